//! SocketCAN Userspace Driver Library
//!
//! Drives Linux CAN network interfaces through raw `PF_CAN` sockets, with
//! one filtered receive socket per registered handler, a shared transmit
//! socket and optional background polling.
//!
//! # Architecture
//!
//! - One [`CanInterface`] per bus interface; `init` opens the transmit socket
//!   and, unless polled mode is requested, spawns a worker thread
//! - Every receive handler gets its own kernel-filtered socket in the
//!   interface's wait-set
//! - The poll loop reads ready sockets, decodes timestamps and drop counters
//!   from ancillary data and dispatches frames to handlers
//! - Error frames, dropped frames and poll failures go to error handlers as
//!   an [`ErrorNotice`]
//!
//! The library does NOT:
//! - Configure bitrates or bring links up by itself (see [`LinkControl`])
//! - Implement ISO-TP, J1939 or any other transport above raw frames
//!
//! # Example Usage
//!
//! ```no_run
//! use cansock::{CanFilter, CanFrame, CanInterface, Event, InterfaceConfig, RxHandlerRef, Timestamp};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let mut can = CanInterface::request_by_name("vcan0");
//! can.init(InterfaceConfig::new().with_polled_mode(true)).unwrap();
//!
//! let handler: RxHandlerRef = Arc::new(|frame: &CanFrame, ts: Timestamp| {
//!     println!("{} {}", ts, frame);
//! });
//! can.register_rx(handler, &[CanFilter::standard(0x123)]).unwrap();
//!
//! can.transmit(&CanFrame::new(0x123, &[1, 2, 3, 4]).unwrap()).unwrap();
//!
//! let mut event = Event::default();
//! if can.poll_once(Some(Duration::from_millis(100)), &mut event).unwrap() > 0 {
//!     can.dispatch(&event).unwrap();
//! }
//! can.free().unwrap();
//! ```

// Public modules
pub mod config;
pub mod dlc;
pub mod error;
pub mod types;

// Re-export main types for convenience
pub use config::{CtrlMode, InterfaceConfig, ShutdownPolicy, DEFAULT_POLL_TIMEOUT};
pub use error::{strerror, CanError, ErrorCode, Result};
pub use interface::{CanInterface, ConcurrencyMode, MAX_IFNAME_LEN};
pub use link::{ExternalLink, LinkControl};
pub use registry::{ErrorHandler, ErrorHandlerRef, LogErrorHandler, RxHandler, RxHandlerRef};
pub use types::{CanFilter, CanFrame, ErrorNotice, Event, Timestamp};

// Internal modules (not exposed in public API)
mod dispatch;
mod interface;
mod lifecycle;
mod link;
mod poll;
mod reader;
mod registry;
mod shared;
mod socket;
mod transmit;
mod waitset;
mod worker;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
