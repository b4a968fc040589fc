//! Error taxonomy
//!
//! Every failure the library reports carries a stable [`ErrorCode`]: a small
//! positive integer (zero is success) with a fixed human-readable string.
//! [`CanError`] pairs that code with the OS error that caused it, if any.

use std::fmt;
use std::io;

/// Result type for all fallible library operations
pub type Result<T> = std::result::Result<T, CanError>;

/// Stable numeric error codes
///
/// The discriminants are part of the public contract: they are what
/// [`CanError::errno`] negates and what [`strerror`] looks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    // Argument and state errors
    NullInterface = 1,
    IfrIdx = 2,
    NoMem = 3,

    // Link-control collaborator
    NlGetState = 4,
    NlStart = 5,
    NlStop = 6,
    NlStateMismatch = 7,
    NlBitrate = 8,
    NlRestart = 9,
    NlSetRestartMs = 10,
    NlGetRestartMs = 11,
    NlRestartMsMismatch = 12,
    NlSetCtrlMode = 13,
    NlGetCtrlMode = 14,
    NlCtrlModeMismatch = 15,
    NlGetDevStats = 16,
    NlSetBitTiming = 17,
    NlGetBitTiming = 18,
    NlBitTimingMismatch = 19,
    NlGetBitErrCnt = 20,
    NlBitrateMismatch = 21,
    NlDataBitrate = 22,

    // Transmit socket
    TxSktCreate = 23,
    TxSktWr = 24,
    TxSktBind = 25,
    TxRetryLater = 26,
    IncompFrame = 27,

    // Socket options
    SetsockoptRawFilter = 28,
    SetsockoptErrFilter = 29,
    SetsockoptCanfd = 30,
    SetsockoptTimestamp = 31,
    SetsockoptSndbuf = 32,
    GetsockoptSndbuf = 33,
    SetsockoptRcvbuf = 34,
    GetsockoptRcvbuf = 35,
    SetsockoptRxqOvfl = 36,
    SetNonblocking = 37,

    // Notifications and runtime I/O
    DroppedFrames = 38,
    NetworkDown = 39,
    Siocgifmtu = 40,
    NotCanfd = 41,
    PollWait = 42,

    // Registration
    RegErrHandler = 43,
    ErrCbAlreadyRegistered = 44,
    ErrCbNotFound = 45,
    RxCbAlreadyRegistered = 46,
    RxCbNotFound = 47,
    RxSktCreate = 48,
    RxSktBind = 49,

    // Concurrency
    ThreadAlloc = 50,
    ThreadCreate = 51,
    ThreadMutexLock = 52,
}

impl ErrorCode {
    /// Highest assigned code
    pub const MAX: i32 = ErrorCode::ThreadMutexLock as i32;

    const ALL: [ErrorCode; ErrorCode::MAX as usize] = [
        ErrorCode::NullInterface,
        ErrorCode::IfrIdx,
        ErrorCode::NoMem,
        ErrorCode::NlGetState,
        ErrorCode::NlStart,
        ErrorCode::NlStop,
        ErrorCode::NlStateMismatch,
        ErrorCode::NlBitrate,
        ErrorCode::NlRestart,
        ErrorCode::NlSetRestartMs,
        ErrorCode::NlGetRestartMs,
        ErrorCode::NlRestartMsMismatch,
        ErrorCode::NlSetCtrlMode,
        ErrorCode::NlGetCtrlMode,
        ErrorCode::NlCtrlModeMismatch,
        ErrorCode::NlGetDevStats,
        ErrorCode::NlSetBitTiming,
        ErrorCode::NlGetBitTiming,
        ErrorCode::NlBitTimingMismatch,
        ErrorCode::NlGetBitErrCnt,
        ErrorCode::NlBitrateMismatch,
        ErrorCode::NlDataBitrate,
        ErrorCode::TxSktCreate,
        ErrorCode::TxSktWr,
        ErrorCode::TxSktBind,
        ErrorCode::TxRetryLater,
        ErrorCode::IncompFrame,
        ErrorCode::SetsockoptRawFilter,
        ErrorCode::SetsockoptErrFilter,
        ErrorCode::SetsockoptCanfd,
        ErrorCode::SetsockoptTimestamp,
        ErrorCode::SetsockoptSndbuf,
        ErrorCode::GetsockoptSndbuf,
        ErrorCode::SetsockoptRcvbuf,
        ErrorCode::GetsockoptRcvbuf,
        ErrorCode::SetsockoptRxqOvfl,
        ErrorCode::SetNonblocking,
        ErrorCode::DroppedFrames,
        ErrorCode::NetworkDown,
        ErrorCode::Siocgifmtu,
        ErrorCode::NotCanfd,
        ErrorCode::PollWait,
        ErrorCode::RegErrHandler,
        ErrorCode::ErrCbAlreadyRegistered,
        ErrorCode::ErrCbNotFound,
        ErrorCode::RxCbAlreadyRegistered,
        ErrorCode::RxCbNotFound,
        ErrorCode::RxSktCreate,
        ErrorCode::RxSktBind,
        ErrorCode::ThreadAlloc,
        ErrorCode::ThreadCreate,
        ErrorCode::ThreadMutexLock,
    ];

    /// Numeric value of this code (always positive)
    pub fn raw(self) -> i32 {
        self as i32
    }

    /// Look up a code by its numeric value
    pub fn from_raw(code: i32) -> Option<Self> {
        if code < 1 || code > Self::MAX {
            return None;
        }
        Some(Self::ALL[(code - 1) as usize])
    }

    /// Human-readable description
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NullInterface => "CAN interface is not initialized",
            ErrorCode::IfrIdx => "Interface index error",
            ErrorCode::NoMem => "No memory",
            ErrorCode::NlGetState => "Get netlink interface state",
            ErrorCode::NlStart => "Start interface",
            ErrorCode::NlStop => "Stop interface",
            ErrorCode::NlStateMismatch => "Netlink state set does not match value read",
            ErrorCode::NlBitrate => "Set interface bitrate",
            ErrorCode::NlRestart => "Restart interface error",
            ErrorCode::NlSetRestartMs => "Set restart ms error",
            ErrorCode::NlGetRestartMs => "Get restart ms error",
            ErrorCode::NlRestartMsMismatch => "Restart ms value set does not match value read",
            ErrorCode::NlSetCtrlMode => "Set ctrl mode error",
            ErrorCode::NlGetCtrlMode => "Get ctrl mode error",
            ErrorCode::NlCtrlModeMismatch => "Ctrl mode value set does not match value read",
            ErrorCode::NlGetDevStats => "Get device statistics error",
            ErrorCode::NlSetBitTiming => "Set bit timing error",
            ErrorCode::NlGetBitTiming => "Get bit timing error",
            ErrorCode::NlBitTimingMismatch => "Bit timing value set does not match value read",
            ErrorCode::NlGetBitErrCnt => "Get bit error counter error",
            ErrorCode::NlBitrateMismatch => "Bitrate value set does not match value read",
            ErrorCode::NlDataBitrate => "Set interface data bitrate",
            ErrorCode::TxSktCreate => "Socket create error",
            ErrorCode::TxSktWr => "Socket write error",
            ErrorCode::TxSktBind => "Socket bind error",
            ErrorCode::TxRetryLater => "TX retry later",
            ErrorCode::IncompFrame => "Incomplete TX frame",
            ErrorCode::SetsockoptRawFilter => "setsockopt CAN_RAW_FILTER error",
            ErrorCode::SetsockoptErrFilter => "setsockopt CAN_RAW_ERR_FILTER error",
            ErrorCode::SetsockoptCanfd => "setsockopt CAN_RAW_FD_FRAMES error",
            ErrorCode::SetsockoptTimestamp => "setsockopt SO_TIMESTAMP error",
            ErrorCode::SetsockoptSndbuf => "setsockopt SO_SNDBUF error",
            ErrorCode::GetsockoptSndbuf => "getsockopt SO_SNDBUF error",
            ErrorCode::SetsockoptRcvbuf => "setsockopt SO_RCVBUF error",
            ErrorCode::GetsockoptRcvbuf => "getsockopt SO_RCVBUF error",
            ErrorCode::SetsockoptRxqOvfl => "setsockopt SO_RXQ_OVFL error",
            ErrorCode::SetNonblocking => "Unable to set socket non-blocking",
            ErrorCode::DroppedFrames => "Dropped frames",
            ErrorCode::NetworkDown => "CAN network is down",
            ErrorCode::Siocgifmtu => "ioctl SIOCGIFMTU error",
            ErrorCode::NotCanfd => "CAN FD mtu not supported",
            ErrorCode::PollWait => "Poll wait error",
            ErrorCode::RegErrHandler => "Unable to register error handler",
            ErrorCode::ErrCbAlreadyRegistered => "Error callback already registered",
            ErrorCode::ErrCbNotFound => "Error callback not found",
            ErrorCode::RxCbAlreadyRegistered => "RX callback already registered",
            ErrorCode::RxCbNotFound => "RX callback not found",
            ErrorCode::RxSktCreate => "RX socket create error",
            ErrorCode::RxSktBind => "RX socket bind error",
            ErrorCode::ThreadAlloc => "Unable to allocate thread resources",
            ErrorCode::ThreadCreate => "Unable to create thread",
            ErrorCode::ThreadMutexLock => "Unable to lock thread mutex",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Look up the description of a numeric error code
///
/// Returns `None` for zero, negative values and codes that were never
/// assigned.
pub fn strerror(code: i32) -> Option<&'static str> {
    ErrorCode::from_raw(code).map(ErrorCode::as_str)
}

/// Error returned by every fallible operation
#[derive(Debug, thiserror::Error)]
#[error("{code}")]
pub struct CanError {
    code: ErrorCode,
    #[source]
    source: Option<io::Error>,
}

impl CanError {
    /// Error carrying the OS error that triggered it
    pub fn os(code: ErrorCode, source: io::Error) -> Self {
        Self {
            code,
            source: Some(source),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Negated error code, for callers that use the integer convention
    pub fn errno(&self) -> i32 {
        -self.code.raw()
    }

    /// Underlying OS error number, if any
    pub fn raw_os_error(&self) -> Option<i32> {
        self.source.as_ref().and_then(io::Error::raw_os_error)
    }

    /// True for transient transmit buffer exhaustion
    pub fn is_retry_later(&self) -> bool {
        self.code == ErrorCode::TxRetryLater
    }
}

impl From<ErrorCode> for CanError {
    fn from(code: ErrorCode) -> Self {
        Self { code, source: None }
    }
}

impl PartialEq<ErrorCode> for CanError {
    fn eq(&self, other: &ErrorCode) -> bool {
        self.code == *other
    }
}
