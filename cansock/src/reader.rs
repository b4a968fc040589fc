//! Event reader and ancillary data decoder
//!
//! Each read builds its own message descriptor on the stack, pointing the
//! single I/O vector at the caller's event frame. Nothing outlives the call.

use byteorder::{ByteOrder, NativeEndian};
use std::io;
use std::mem::{self, size_of};
use std::os::raw::c_void;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::{CanError, ErrorCode, Result};
use crate::types::{CanFrame, Event};

const CONTROL_LEN: usize = 256;

#[repr(C, align(8))]
struct ControlBuf([u8; CONTROL_LEN]);

/// Which kind of socket a read targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Source {
    /// A filtered receive socket
    Rx,
    /// The transmit socket, read only to surface error frames
    Tx,
}

/// Header processing options, taken from the interface configuration
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ReadOptions {
    pub process_header: bool,
    pub hw_timestamp: bool,
}

/// Values decoded from the control messages of one datagram
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Ancillary {
    /// `SO_TIMESTAMP`
    pub software: Option<Duration>,
    /// `SO_TIMESTAMPING`: software, deprecated, raw hardware
    pub stamps: Option<[Duration; 3]>,
    /// `SO_RXQ_OVFL`
    pub dropped: Option<u32>,
}

fn timeval_to_duration(tv: &libc::timeval) -> Duration {
    Duration::new(tv.tv_sec.max(0) as u64, 0) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

fn timespec_to_duration(ts: &libc::timespec) -> Duration {
    Duration::new(ts.tv_sec.max(0) as u64, 0) + Duration::from_nanos(ts.tv_nsec.max(0) as u64)
}

/// Walk the control messages of a received datagram
pub(crate) fn decode_ancillary(msg: &libc::msghdr) -> Ancillary {
    let mut anc = Ancillary::default();

    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(msg) };
    while !cmsg.is_null() {
        let hdr = unsafe { &*cmsg };
        if hdr.cmsg_level == libc::SOL_SOCKET {
            let data = unsafe { libc::CMSG_DATA(cmsg) };
            let header_len = data as usize - cmsg as usize;
            let payload_len = (hdr.cmsg_len as usize).saturating_sub(header_len);
            let payload = unsafe { std::slice::from_raw_parts(data as *const u8, payload_len) };

            match hdr.cmsg_type {
                libc::SO_RXQ_OVFL if payload.len() >= 4 => {
                    anc.dropped = Some(NativeEndian::read_u32(payload));
                }
                libc::SO_TIMESTAMP if payload.len() >= size_of::<libc::timeval>() => {
                    let tv = unsafe { (data as *const libc::timeval).read_unaligned() };
                    anc.software = Some(timeval_to_duration(&tv));
                }
                libc::SO_TIMESTAMPING if payload.len() >= 3 * size_of::<libc::timespec>() => {
                    let ts = data as *const libc::timespec;
                    let mut stamps = [Duration::ZERO; 3];
                    for (i, stamp) in stamps.iter_mut().enumerate() {
                        let raw = unsafe { ts.add(i).read_unaligned() };
                        *stamp = timespec_to_duration(&raw);
                    }
                    anc.stamps = Some(stamps);
                }
                _ => {}
            }
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(msg, cmsg) };
    }

    anc
}

/// Pick the receive timestamp
///
/// With hardware timestamping requested the raw hardware slot wins, falling
/// back to the software slot of the same message when the driver left it
/// empty. Otherwise the plain `SO_TIMESTAMP` value is used.
pub(crate) fn resolve_timestamp(hw_requested: bool, anc: &Ancillary) -> Option<Duration> {
    if hw_requested {
        if let Some([software, _, hardware]) = anc.stamps {
            if !hardware.is_zero() {
                return Some(hardware);
            }
            if !software.is_zero() {
                return Some(software);
            }
        }
    }
    anc.software.or_else(|| anc.stamps.map(|s| s[2]))
}

/// Issue one non-blocking receive on `fd` into `event`
///
/// Returns the number of bytes read; zero means nothing was pending.
/// A downed network is the only read failure reported as an error.
pub(crate) fn read_one(
    fd: RawFd,
    source: Source,
    opts: ReadOptions,
    event: &mut Event,
) -> Result<usize> {
    let mut control = ControlBuf([0; CONTROL_LEN]);
    let mut addr: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: event.frame.as_mut_ptr(),
        iov_len: size_of::<CanFrame>(),
    };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &mut addr as *mut libc::sockaddr_storage as *mut c_void;
    msg.msg_namelen = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.0.as_mut_ptr() as *mut c_void;
    msg.msg_controllen = CONTROL_LEN as _;

    let nbytes = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_DONTWAIT) };
    if nbytes < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENETDOWN) {
            log::error!("read_one: CAN network is down (fd {})", fd);
            return Err(CanError::os(ErrorCode::NetworkDown, err));
        }
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {}
            _ => log::warn!("read_one: recvmsg on fd {} failed: {}", fd, err),
        }
        return Ok(0);
    }
    if nbytes == 0 {
        return Ok(0);
    }

    if source == Source::Rx {
        if opts.process_header {
            let anc = decode_ancillary(&msg);
            if let Some(ts) = resolve_timestamp(opts.hw_timestamp, &anc) {
                event.timestamp_ns = ts.as_nanos() as u64;
            }
            event.dropped_frames = anc.dropped.unwrap_or(0);
            if event.dropped_frames > 0 {
                log::error!("read_one: CAN frames dropped ({})", event.dropped_frames);
            }
        }
        event.is_rx = true;
        event.origin = Some(fd);
    }
    event.is_error = event.frame.is_error();

    Ok(nbytes as usize)
}
