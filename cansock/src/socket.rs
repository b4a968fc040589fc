//! Raw CAN socket wrapper
//!
//! Owned `PF_CAN`/`SOCK_RAW` socket built on `socket2`, addressed through
//! `socketcan::CanAddr`. The CAN_RAW options and the few `SOL_SOCKET`
//! options `socket2` has no setter for go through `setsockopt` directly.
//! Every call reports `io::Error`; translating failures into library error
//! codes is left to the callers in `lifecycle`.

use std::io;
use std::mem::size_of;
use std::os::raw::{c_char, c_int, c_void};
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use socketcan::CanAddr;

use crate::error::ErrorCode;
use crate::types::{CanFilter, CanFrame, CANFD_MTU};

/// Link MTU reported by FD-capable interfaces
pub(crate) const CANFD_LINK_MTU: c_int = CANFD_MTU as c_int;

/// Socket buffer direction, used for size negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Buffer {
    Send,
    Receive,
}

impl Buffer {
    fn force_option(self) -> c_int {
        match self {
            Buffer::Send => libc::SO_SNDBUFFORCE,
            Buffer::Receive => libc::SO_RCVBUFFORCE,
        }
    }

    pub(crate) fn set_error(self) -> ErrorCode {
        match self {
            Buffer::Send => ErrorCode::SetsockoptSndbuf,
            Buffer::Receive => ErrorCode::SetsockoptRcvbuf,
        }
    }

    pub(crate) fn get_error(self) -> ErrorCode {
        match self {
            Buffer::Send => ErrorCode::GetsockoptSndbuf,
            Buffer::Receive => ErrorCode::GetsockoptRcvbuf,
        }
    }
}

/// Outcome of a buffer size request
#[derive(Debug)]
pub(crate) enum BufferNegotiation {
    /// Accepted, possibly through the privileged force variant
    Negotiated { size: usize, forced: bool },
    /// Both the force and the best-effort request failed
    SetFailed(io::Error),
    /// The request went through but reading the result back failed
    GetFailed(io::Error),
}

fn set_socket_option<T>(fd: RawFd, level: c_int, name: c_int, value: &T) -> io::Result<()> {
    set_socket_option_mult(fd, level, name, std::slice::from_ref(value))
}

fn set_socket_option_mult<T>(fd: RawFd, level: c_int, name: c_int, values: &[T]) -> io::Result<()> {
    // an empty slice installs a zero-length option (NULL, 0)
    let ptr = if values.is_empty() {
        std::ptr::null()
    } else {
        values.as_ptr() as *const c_void
    };
    let rv = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            ptr,
            (size_of::<T>() * values.len()) as libc::socklen_t,
        )
    };
    if rv < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Resolve an interface name to the address raw sockets bind to
pub(crate) fn interface_addr(ifname: &str) -> io::Result<SockAddr> {
    CanAddr::from_iface(ifname).map(CanAddr::into_sock_addr)
}

/// An owned raw CAN socket, closed on drop
#[derive(Debug)]
pub(crate) struct CanSocket {
    socket: Socket,
}

impl CanSocket {
    /// Create an unbound raw socket
    pub fn new() -> io::Result<Self> {
        let socket = Socket::new(
            Domain::from(libc::AF_CAN),
            Type::RAW,
            Some(Protocol::from(libc::CAN_RAW)),
        )?;
        Ok(Self { socket })
    }

    pub fn set_nonblocking(&self) -> io::Result<()> {
        self.socket.set_nonblocking(true)
    }

    /// Query the MTU of the named link through this socket
    pub fn link_mtu(&self, ifname: &str) -> io::Result<c_int> {
        let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
        for (dst, src) in req
            .ifr_name
            .iter_mut()
            .zip(ifname.bytes().take(libc::IFNAMSIZ - 1))
        {
            *dst = src as c_char;
        }
        let rv = unsafe {
            libc::ioctl(
                self.as_raw_fd(),
                libc::SIOCGIFMTU as _,
                &mut req as *mut libc::ifreq,
            )
        };
        if rv < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { req.ifr_ifru.ifru_mtu })
    }

    pub fn set_fd_frames(&self) -> io::Result<()> {
        let enable: c_int = 1;
        set_socket_option(self.as_raw_fd(), libc::SOL_CAN_RAW, libc::CAN_RAW_FD_FRAMES, &enable)
    }

    /// Install receive filters; an empty list admits nothing
    pub fn set_filters(&self, filters: &[CanFilter]) -> io::Result<()> {
        set_socket_option_mult(self.as_raw_fd(), libc::SOL_CAN_RAW, libc::CAN_RAW_FILTER, filters)
    }

    pub fn set_error_mask(&self, mask: u32) -> io::Result<()> {
        set_socket_option(self.as_raw_fd(), libc::SOL_CAN_RAW, libc::CAN_RAW_ERR_FILTER, &mask)
    }

    /// Request receive timestamps as ancillary data
    pub fn set_timestamping(&self, hardware: bool) -> io::Result<()> {
        if hardware {
            let flags: c_int = (libc::SOF_TIMESTAMPING_SOFTWARE
                | libc::SOF_TIMESTAMPING_RX_SOFTWARE
                | libc::SOF_TIMESTAMPING_RAW_HARDWARE) as c_int;
            set_socket_option(self.as_raw_fd(), libc::SOL_SOCKET, libc::SO_TIMESTAMPING, &flags)
        } else {
            let enable: c_int = 1;
            set_socket_option(self.as_raw_fd(), libc::SOL_SOCKET, libc::SO_TIMESTAMP, &enable)
        }
    }

    /// Request the queue overflow counter as ancillary data
    pub fn set_rxq_ovfl(&self) -> io::Result<()> {
        let enable: c_int = 1;
        set_socket_option(self.as_raw_fd(), libc::SOL_SOCKET, libc::SO_RXQ_OVFL, &enable)
    }

    /// Request a buffer size and read back what the kernel granted
    ///
    /// The privileged force variant is tried first since it may exceed the
    /// system-wide limit; the plain option is the fallback.
    pub fn negotiate_buffer(&self, which: Buffer, len: usize) -> BufferNegotiation {
        let requested = len.min(c_int::MAX as usize) as c_int;

        let forced =
            set_socket_option(self.as_raw_fd(), libc::SOL_SOCKET, which.force_option(), &requested)
                .is_ok();
        if !forced {
            let set = match which {
                Buffer::Send => self.socket.set_send_buffer_size(requested as usize),
                Buffer::Receive => self.socket.set_recv_buffer_size(requested as usize),
            };
            if let Err(e) = set {
                return BufferNegotiation::SetFailed(e);
            }
        }

        let granted = match which {
            Buffer::Send => self.socket.send_buffer_size(),
            Buffer::Receive => self.socket.recv_buffer_size(),
        };
        match granted {
            Ok(size) => BufferNegotiation::Negotiated { size, forced },
            Err(e) => BufferNegotiation::GetFailed(e),
        }
    }

    pub fn bind(&self, addr: &SockAddr) -> io::Result<()> {
        self.socket.bind(addr)
    }

    /// Write the first `size` bytes of `frame`, returning the count written
    pub fn write_frame(&self, frame: &CanFrame, size: usize) -> io::Result<usize> {
        let bytes = frame.as_bytes();
        self.socket.send(&bytes[..size.min(bytes.len())])
    }
}

/// Wrap an already created socket; used to drive the read path over
/// loopback datagram sockets in tests
impl From<Socket> for CanSocket {
    fn from(socket: Socket) -> Self {
        Self { socket }
    }
}

impl AsRawFd for CanSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}
