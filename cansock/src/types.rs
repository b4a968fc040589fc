//! Core types shared across the library
//!
//! Frames and filters are laid out exactly like the kernel's `canfd_frame`
//! and `can_filter` so they can be handed to the socket calls unmodified.

use chrono::{DateTime, Utc};
use std::fmt;
use std::os::unix::io::RawFd;

use crate::dlc::MAX_FD_LEN;
use crate::error::ErrorCode;

/// Timestamp type used throughout the library
pub type Timestamp = DateTime<Utc>;

/// Extended frame format (29-bit identifier)
pub const CAN_EFF_FLAG: u32 = libc::CAN_EFF_FLAG as u32;
/// Remote transmission request
pub const CAN_RTR_FLAG: u32 = libc::CAN_RTR_FLAG as u32;
/// Error frame
pub const CAN_ERR_FLAG: u32 = libc::CAN_ERR_FLAG as u32;

/// Valid bits of a standard identifier
pub const CAN_SFF_MASK: u32 = libc::CAN_SFF_MASK as u32;
/// Valid bits of an extended identifier
pub const CAN_EFF_MASK: u32 = libc::CAN_EFF_MASK as u32;
/// Valid bits of an error frame class
pub const CAN_ERR_MASK: u32 = libc::CAN_ERR_MASK as u32;

/// Wire size of a classic frame
pub const CAN_MTU: usize = libc::CAN_MTU as usize;
/// Wire size of an FD frame
pub const CANFD_MTU: usize = libc::CANFD_MTU as usize;
/// Payload limit of a classic frame
pub const CAN_MAX_DLEN: usize = libc::CAN_MAX_DLEN as usize;

/// FD frame flags
pub const CANFD_BRS: u8 = libc::CANFD_BRS as u8;
pub const CANFD_ESI: u8 = libc::CANFD_ESI as u8;

/// Error classes carried in the identifier of an error frame
///
/// These are also the bits of the error mask installed on every socket.
pub mod error_class {
    pub const TX_TIMEOUT: u32 = 0x0000_0001;
    pub const LOSTARB: u32 = 0x0000_0002;
    pub const CRTL: u32 = 0x0000_0004;
    pub const PROT: u32 = 0x0000_0008;
    pub const TRX: u32 = 0x0000_0010;
    pub const ACK: u32 = 0x0000_0020;
    pub const BUSOFF: u32 = 0x0000_0040;
    pub const BUSERROR: u32 = 0x0000_0080;
    pub const RESTARTED: u32 = 0x0000_0100;
}

/// A CAN or CAN FD frame
///
/// Classic frames occupy the first [`CAN_MTU`] bytes of this layout; FD
/// frames use all [`CANFD_MTU`] bytes.
#[repr(C, align(8))]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    can_id: u32,
    len: u8,
    flags: u8,
    res0: u8,
    res1: u8,
    data: [u8; MAX_FD_LEN],
}

impl CanFrame {
    /// Build a frame from an identifier (flags included) and payload
    ///
    /// Returns `None` if the payload exceeds 64 bytes.
    pub fn new(can_id: u32, data: &[u8]) -> Option<Self> {
        if data.len() > MAX_FD_LEN {
            return None;
        }
        let mut frame = Self::default();
        frame.can_id = can_id;
        frame.len = data.len() as u8;
        frame.data[..data.len()].copy_from_slice(data);
        Some(frame)
    }

    /// Builder method: set FD flags (`CANFD_BRS`, `CANFD_ESI`)
    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    /// Identifier including the EFF/RTR/ERR flag bits
    pub fn id(&self) -> u32 {
        self.can_id
    }

    /// Identifier without flag bits
    pub fn raw_id(&self) -> u32 {
        if self.is_extended() {
            self.can_id & CAN_EFF_MASK
        } else {
            self.can_id & CAN_SFF_MASK
        }
    }

    pub fn is_extended(&self) -> bool {
        self.can_id & CAN_EFF_FLAG != 0
    }

    pub fn is_remote(&self) -> bool {
        self.can_id & CAN_RTR_FLAG != 0
    }

    pub fn is_error(&self) -> bool {
        self.can_id & CAN_ERR_FLAG != 0
    }

    /// Error class bits, meaningful only for error frames
    pub fn error_class(&self) -> u32 {
        self.can_id & CAN_ERR_MASK
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len().min(MAX_FD_LEN)]
    }

    pub(crate) fn set_len(&mut self, len: usize) {
        self.len = len.min(MAX_FD_LEN) as u8;
    }

    /// The full wire layout, of which a socket write sends a prefix
    pub(crate) fn as_bytes(&self) -> &[u8] {
        // repr(C) with no padding, every byte is initialised
        unsafe {
            std::slice::from_raw_parts(self as *const Self as *const u8, std::mem::size_of::<Self>())
        }
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::c_void {
        self as *mut Self as *mut libc::c_void
    }
}

impl Default for CanFrame {
    fn default() -> Self {
        Self {
            can_id: 0,
            len: 0,
            flags: 0,
            res0: 0,
            res1: 0,
            data: [0; MAX_FD_LEN],
        }
    }
}

impl fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanFrame")
            .field("can_id", &format_args!("0x{:08X}", self.can_id))
            .field("len", &self.len)
            .field("flags", &self.flags)
            .field("data", &self.data())
            .finish()
    }
}

impl fmt::Display for CanFrame {
    /// candump-style `ID#DATA` rendering
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_extended() {
            write!(f, "{:08X}#", self.raw_id())?;
        } else {
            write!(f, "{:03X}#", self.can_id & (CAN_SFF_MASK | CAN_ERR_FLAG))?;
        }
        for byte in self.data() {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

/// Receive filter: a frame passes when `received_id & mask == id & mask`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CanFilter {
    pub id: u32,
    pub mask: u32,
}

impl CanFilter {
    pub fn new(id: u32, mask: u32) -> Self {
        Self { id, mask }
    }

    /// Filter admitting every frame
    pub fn accept_all() -> Self {
        Self::new(0, 0)
    }

    /// Filter admitting only the given standard identifier
    pub fn standard(id: u32) -> Self {
        Self::new(id & CAN_SFF_MASK, CAN_SFF_MASK | CAN_EFF_FLAG | CAN_RTR_FLAG)
    }

    /// Filter admitting only the given extended identifier
    pub fn extended(id: u32) -> Self {
        Self::new(
            (id & CAN_EFF_MASK) | CAN_EFF_FLAG,
            CAN_EFF_MASK | CAN_EFF_FLAG | CAN_RTR_FLAG,
        )
    }

    /// Evaluate the filter the way the kernel does
    pub fn matches(&self, can_id: u32) -> bool {
        can_id & self.mask == self.id & self.mask
    }
}

/// One decoded datagram, scoped to a single read and dispatch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Event {
    /// Frame as read from the socket
    pub frame: CanFrame,
    /// Receive timestamp in nanoseconds since the Unix epoch (0 if unknown)
    pub timestamp_ns: u64,
    /// Kernel drop counter reported with this datagram
    pub dropped_frames: u32,
    /// Receive socket the datagram came from
    pub origin: Option<RawFd>,
    /// Read from a receive socket (as opposed to the transmit socket)
    pub is_rx: bool,
    /// Frame identifier carries the error flag
    pub is_error: bool,
}

impl Event {
    /// Convert the receive timestamp to `DateTime<Utc>`
    pub fn timestamp(&self) -> Timestamp {
        let secs = (self.timestamp_ns / 1_000_000_000) as i64;
        let nsecs = (self.timestamp_ns % 1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nsecs).unwrap_or_else(Utc::now)
    }

    /// Reset to the empty state before reuse
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Notification delivered to error handlers
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorNotice {
    /// An error frame was received
    ErrorFrame(CanFrame),
    /// The kernel dropped frames because a receive queue overflowed
    DroppedFrames(u32),
    /// Waiting on the socket set failed with this errno
    Poll(i32),
}

impl ErrorNotice {
    /// Integer code of the notice
    ///
    /// Error frames report their identifier (flag bits included), dropped
    /// frames report [`ErrorCode::DroppedFrames`] and poll failures their
    /// errno, which keeps the historical single-integer callback contract.
    pub fn code(&self) -> u32 {
        match self {
            ErrorNotice::ErrorFrame(frame) => frame.id(),
            ErrorNotice::DroppedFrames(_) => ErrorCode::DroppedFrames.raw() as u32,
            ErrorNotice::Poll(errno) => *errno as u32,
        }
    }
}

impl fmt::Display for ErrorNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorNotice::ErrorFrame(frame) => {
                write!(f, "error frame (class 0x{:X})", frame.error_class())
            }
            ErrorNotice::DroppedFrames(count) => {
                write!(f, "{} ({})", ErrorCode::DroppedFrames, count)
            }
            ErrorNotice::Poll(errno) => {
                write!(f, "{}: {}", ErrorCode::PollWait, std::io::Error::from_raw_os_error(*errno))
            }
        }
    }
}
