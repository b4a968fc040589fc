//! Callback registry
//!
//! Two owned collections: receive handlers, each bound to the receive socket
//! opened for it, and error handlers, global to the interface. Handlers are
//! identified by the address of their shared allocation, so registering the
//! same `Arc` twice is detected while two distinct handlers of the same type
//! coexist.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::error::{ErrorCode, Result};
use crate::types::{CanFrame, ErrorNotice, Timestamp};

/// Receives data frames from one filtered receive socket
pub trait RxHandler: Send + Sync {
    fn on_frame(&self, frame: &CanFrame, timestamp: Timestamp);
}

impl<F> RxHandler for F
where
    F: Fn(&CanFrame, Timestamp) + Send + Sync,
{
    fn on_frame(&self, frame: &CanFrame, timestamp: Timestamp) {
        self(frame, timestamp)
    }
}

/// Receives interface-wide error notifications
pub trait ErrorHandler: Send + Sync {
    fn on_error(&self, notice: &ErrorNotice);
}

impl<F> ErrorHandler for F
where
    F: Fn(&ErrorNotice) + Send + Sync,
{
    fn on_error(&self, notice: &ErrorNotice) {
        self(notice)
    }
}

pub type RxHandlerRef = Arc<dyn RxHandler>;
pub type ErrorHandlerRef = Arc<dyn ErrorHandler>;

/// Compare two handler references by allocation, ignoring vtables
fn same_handler<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Error handler registered by `init`, logs every notification
pub struct LogErrorHandler {
    ifname: String,
}

impl LogErrorHandler {
    pub fn new(ifname: impl Into<String>) -> Self {
        Self {
            ifname: ifname.into(),
        }
    }
}

impl ErrorHandler for LogErrorHandler {
    fn on_error(&self, notice: &ErrorNotice) {
        log::error!("{}: error: {}, {}", self.ifname, notice.code(), notice);
    }
}

struct RxEntry {
    socket: RawFd,
    handler: RxHandlerRef,
}

/// Receive and error handler lists of one interface
#[derive(Default)]
pub(crate) struct Registry {
    rx: Vec<RxEntry>,
    errors: Vec<ErrorHandlerRef>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Socket bound to a receive handler, if registered
    pub fn rx_socket_of(&self, handler: &RxHandlerRef) -> Option<RawFd> {
        self.rx
            .iter()
            .find(|entry| same_handler(&entry.handler, handler))
            .map(|entry| entry.socket)
    }

    /// Bind a receive handler to its socket
    pub fn add_rx(&mut self, socket: RawFd, handler: RxHandlerRef) -> Result<()> {
        if self.rx_socket_of(&handler).is_some() || self.has_rx_socket(socket) {
            return Err(ErrorCode::RxCbAlreadyRegistered.into());
        }
        self.rx.push(RxEntry { socket, handler });
        Ok(())
    }

    pub fn has_rx_socket(&self, socket: RawFd) -> bool {
        self.rx.iter().any(|entry| entry.socket == socket)
    }

    /// Remove the entry bound to `socket`; absence is not an error
    pub fn remove_rx_socket(&mut self, socket: RawFd) -> Option<RxHandlerRef> {
        let pos = self.rx.iter().position(|entry| entry.socket == socket)?;
        Some(self.rx.remove(pos).handler)
    }

    /// Receive handlers bound to `socket`, in registration order
    pub fn rx_handlers_for(&self, socket: RawFd) -> impl Iterator<Item = &RxHandlerRef> {
        self.rx
            .iter()
            .filter(move |entry| entry.socket == socket)
            .map(|entry| &entry.handler)
    }

    #[cfg(test)]
    pub fn rx_len(&self) -> usize {
        self.rx.len()
    }

    pub fn add_error(&mut self, handler: ErrorHandlerRef) -> Result<()> {
        if self.errors.iter().any(|h| same_handler(h, &handler)) {
            return Err(ErrorCode::ErrCbAlreadyRegistered.into());
        }
        self.errors.push(handler);
        Ok(())
    }

    pub fn remove_error(&mut self, handler: &ErrorHandlerRef) -> Result<()> {
        let pos = self
            .errors
            .iter()
            .position(|h| same_handler(h, handler))
            .ok_or(ErrorCode::ErrCbNotFound)?;
        self.errors.remove(pos);
        Ok(())
    }

    /// Error handlers in registration order
    pub fn error_handlers(&self) -> impl Iterator<Item = &ErrorHandlerRef> {
        self.errors.iter()
    }

    #[cfg(test)]
    pub fn error_len(&self) -> usize {
        self.errors.len()
    }

    /// Deliver a notice to every error handler
    pub fn notify_errors(&self, notice: &ErrorNotice) {
        for handler in self.error_handlers() {
            handler.on_error(notice);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn rx_noop() -> RxHandlerRef {
        Arc::new(|_: &CanFrame, _: Timestamp| {})
    }

    #[test]
    fn test_rx_duplicate_handler_rejected() {
        let mut registry = Registry::new();
        let handler = rx_noop();

        registry.add_rx(5, handler.clone()).unwrap();
        let err = registry.add_rx(6, handler.clone()).unwrap_err();
        assert_eq!(err, ErrorCode::RxCbAlreadyRegistered);
        assert_eq!(registry.rx_len(), 1);
        assert_eq!(registry.rx_socket_of(&handler), Some(5));
    }

    #[test]
    fn test_rx_one_entry_per_socket() {
        let mut registry = Registry::new();
        registry.add_rx(5, rx_noop()).unwrap();
        assert!(registry.add_rx(5, rx_noop()).is_err());
        assert_eq!(registry.rx_len(), 1);
    }

    #[test]
    fn test_rx_remove_only_matching_socket() {
        let mut registry = Registry::new();
        let a = rx_noop();
        let b = rx_noop();
        registry.add_rx(5, a.clone()).unwrap();
        registry.add_rx(6, b.clone()).unwrap();

        assert!(registry.remove_rx_socket(5).is_some());
        assert!(registry.remove_rx_socket(5).is_none());
        assert_eq!(registry.rx_len(), 1);
        assert_eq!(registry.rx_socket_of(&b), Some(6));
        assert_eq!(registry.rx_socket_of(&a), None);
    }

    #[test]
    fn test_distinct_closures_are_distinct_handlers() {
        let mut registry = Registry::new();
        let first: ErrorHandlerRef = Arc::new(|_: &ErrorNotice| {});
        let second: ErrorHandlerRef = Arc::new(|_: &ErrorNotice| {});

        registry.add_error(first.clone()).unwrap();
        registry.add_error(second.clone()).unwrap();
        assert_eq!(
            registry.add_error(first.clone()).unwrap_err(),
            ErrorCode::ErrCbAlreadyRegistered
        );
        assert_eq!(registry.error_len(), 2);

        registry.remove_error(&first).unwrap();
        assert_eq!(
            registry.remove_error(&first).unwrap_err(),
            ErrorCode::ErrCbNotFound
        );
        assert_eq!(registry.error_len(), 1);
    }

    #[test]
    fn test_notify_errors_reaches_all_handlers() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new();
        for _ in 0..3 {
            let hits = hits.clone();
            registry
                .add_error(Arc::new(move |_: &ErrorNotice| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }

        registry.notify_errors(&ErrorNotice::DroppedFrames(1));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
