//! Interface handle
//!
//! [`CanInterface`] is the entry point of the library. It owns the link
//! collaborator, and after [`init`](CanInterface::init) the transmit socket,
//! the wait-set, both callback lists and, outside polled mode, the
//! background worker.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::InterfaceConfig;
use crate::error::{CanError, ErrorCode, Result};
use crate::lifecycle;
use crate::link::{ExternalLink, LinkControl};
use crate::poll;
use crate::registry::{ErrorHandlerRef, LogErrorHandler, RxHandlerRef};
use crate::shared::{Shared, WakePipe};
use crate::transmit::transmit;
use crate::types::{CanFilter, CanFrame, Event};
use crate::worker::Worker;

/// Longest interface name the kernel accepts
pub const MAX_IFNAME_LEN: usize = libc::IFNAMSIZ - 1;

/// Who may touch the interface state, fixed at `init`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyMode {
    /// Polled mode: the caller is the only thread driving the interface
    Exclusive,
    /// A background worker polls; every call serialises with it
    Shared,
}

fn duration_to_us(d: Duration) -> u64 {
    d.as_micros().min(u64::MAX as u128) as u64
}

fn truncate_name(name: &str) -> &str {
    if name.len() <= MAX_IFNAME_LEN {
        return name;
    }
    let mut end = MAX_IFNAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// A CAN network interface driven through raw sockets
pub struct CanInterface {
    name: String,
    config: InterfaceConfig,
    link: Box<dyn LinkControl>,
    poll_interval_us: Arc<AtomicU64>,
    shared: Option<Arc<Shared>>,
    worker: Option<Worker>,
}

impl CanInterface {
    /// Request a handle for a named interface
    ///
    /// Names longer than 15 bytes are truncated. No system resource is
    /// touched until [`init`](Self::init).
    ///
    /// # Example
    /// ```no_run
    /// use cansock::{CanInterface, InterfaceConfig};
    ///
    /// let mut can = CanInterface::request_by_name("vcan0");
    /// can.init(InterfaceConfig::new().with_polled_mode(true)).unwrap();
    /// ```
    pub fn request_by_name(name: &str) -> Self {
        let name = truncate_name(name).to_string();
        log::debug!("Requesting {} interface", name);

        let config = InterfaceConfig::default();
        Self {
            name,
            poll_interval_us: Arc::new(AtomicU64::new(duration_to_us(config.poll_timeout))),
            config,
            link: Box::new(ExternalLink),
            shared: None,
            worker: None,
        }
    }

    /// Request a handle for `can<index>`
    pub fn request(index: u32) -> Self {
        Self::request_by_name(&format!("can{}", index))
    }

    /// Builder method: use `link` to configure and start the interface
    pub fn with_link<L: LinkControl + 'static>(mut self, link: L) -> Self {
        self.link = Box::new(link);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration of the last `init`, or the defaults before it
    pub fn config(&self) -> &InterfaceConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.is_some()
    }

    /// Concurrency mode chosen at `init`
    pub fn mode(&self) -> Option<ConcurrencyMode> {
        self.shared.as_ref().map(|shared| {
            if shared.wake.is_some() {
                ConcurrencyMode::Shared
            } else {
                ConcurrencyMode::Exclusive
            }
        })
    }

    fn shared(&self) -> Result<&Arc<Shared>> {
        self.shared
            .as_ref()
            .ok_or_else(|| CanError::from(ErrorCode::NullInterface))
    }

    /// Apply `config` and bring the interface up
    ///
    /// Link settings go to the link collaborator first, then the link is
    /// started, the transmit socket is opened, a logging error handler is
    /// registered and, unless `polled_mode` is set, the worker is spawned.
    /// The configuration's `poll_timeout` becomes the worker interval.
    /// Initialising an initialised handle releases its sockets first.
    ///
    /// # Arguments
    /// * `config` - Interface configuration
    ///
    /// # Returns
    /// * `Result<()>` - Ok once the interface is usable; nothing is left open
    ///   on failure
    pub fn init(&mut self, config: InterfaceConfig) -> Result<()> {
        if self.release() {
            log::warn!("{}: re-initialising, previous sockets closed", self.name);
        }
        log::info!("Initialising CAN interface {}", self.name);
        self.config = config.clone();

        if config.needs_link_config() {
            log::debug!("{}: applying link settings", self.name);
            if let Some(bitrate) = config.bitrate {
                self.link.set_bitrate(&self.name, bitrate)?;
            }
            if let Some(bitrate) = config.data_bitrate {
                self.link.set_data_bitrate(&self.name, bitrate)?;
            }
            if let Some(restart_ms) = config.restart_ms {
                self.link.set_restart_ms(&self.name, restart_ms)?;
            }
            if let Some(mode) = config.ctrl_mode {
                self.link.set_ctrl_mode(&self.name, mode)?;
            }
        }
        self.link.start(&self.name)?;

        let tx = lifecycle::open_tx(&self.name, &config)?;

        let wake = if config.polled_mode {
            None
        } else {
            Some(WakePipe::new().map_err(|e| {
                log::error!("{}: unable to allocate thread resources: {}", self.name, e);
                CanError::os(ErrorCode::ThreadAlloc, e)
            })?)
        };

        self.poll_interval_us
            .store(duration_to_us(config.poll_timeout), Ordering::Relaxed);
        let shared = Arc::new(Shared::new(
            self.name.clone(),
            tx.addr,
            config,
            tx.socket,
            tx.buf_len,
            wake,
            self.poll_interval_us.clone(),
        ));

        let default_handler: ErrorHandlerRef = Arc::new(LogErrorHandler::new(self.name.clone()));
        shared
            .lock()?
            .registry
            .add_error(default_handler)
            .map_err(|_| {
                log::error!("{}: unable to register default error handler", self.name);
                CanError::from(ErrorCode::RegErrHandler)
            })?;

        let worker = if shared.config.polled_mode {
            None
        } else {
            Some(Worker::spawn(shared.clone())?)
        };

        self.shared = Some(shared);
        self.worker = worker;
        log::info!("CAN interface {} ready", self.name);
        Ok(())
    }

    /// Stop the worker and close every socket; false if not initialised
    fn release(&mut self) -> bool {
        let Some(shared) = self.shared.take() else {
            return false;
        };
        if let Some(worker) = self.worker.take() {
            worker.stop(shared.config.shutdown);
        }
        match shared.lock() {
            Ok(mut state) => state.waitset.clear(),
            Err(e) => log::error!("{}: sockets left to the worker: {}", self.name, e),
        }
        true
    }

    fn shutdown(&mut self) -> Result<()> {
        if !self.release() {
            return Ok(());
        }
        self.link.stop(&self.name).map_err(|e| {
            log::error!("{}: can not stop interface: {}", self.name, e);
            e
        })
    }

    /// Tear the interface down
    ///
    /// Stops the worker according to the configured
    /// [`ShutdownPolicy`](crate::ShutdownPolicy), closes every socket and
    /// stops the link. The link stop result is returned.
    pub fn free(mut self) -> Result<()> {
        self.shutdown()
    }

    /// Open a receive socket admitting `filters` and bind `handler` to it
    ///
    /// An empty filter list admits nothing; use [`CanFilter::accept_all`] to
    /// receive every frame. Returns the descriptor of the new socket.
    ///
    /// # Example
    /// ```no_run
    /// use cansock::{CanFilter, CanFrame, CanInterface, InterfaceConfig, RxHandlerRef, Timestamp};
    /// use std::sync::Arc;
    ///
    /// let mut can = CanInterface::request_by_name("vcan0");
    /// can.init(InterfaceConfig::new()).unwrap();
    ///
    /// let handler: RxHandlerRef = Arc::new(|frame: &CanFrame, ts: Timestamp| {
    ///     println!("{} {}", ts, frame);
    /// });
    /// can.register_rx(handler, &[CanFilter::standard(0x123)]).unwrap();
    /// ```
    pub fn register_rx(&self, handler: RxHandlerRef, filters: &[CanFilter]) -> Result<RawFd> {
        let shared = self.shared()?;
        let mut state = shared.lock_for_update()?;

        if let Some(fd) = state.registry.rx_socket_of(&handler) {
            log::error!("{}: rx callback already registered on fd {}", self.name, fd);
            return Err(ErrorCode::RxCbAlreadyRegistered.into());
        }

        let setup = lifecycle::open_rx(&shared.name, &shared.addr, &shared.config, filters)?;
        if setup.buf_len > 0 {
            shared.rx_buf_len.store(setup.buf_len, Ordering::Relaxed);
        }
        let fd = state.waitset.insert_rx(setup.socket);
        if let Err(e) = state.registry.add_rx(fd, handler) {
            state.waitset.remove_rx(fd);
            return Err(e);
        }

        log::debug!(
            "{}: rx callback registered on fd {} (max fd {})",
            self.name,
            fd,
            state.waitset.max_fd()
        );
        Ok(fd)
    }

    /// Unbind `handler` and close its receive socket
    pub fn unregister_rx(&self, handler: &RxHandlerRef) -> Result<()> {
        let shared = self.shared()?;
        let mut state = shared.lock_for_update()?;

        let Some(fd) = state.registry.rx_socket_of(handler) else {
            log::error!("{}: rx callback not found", self.name);
            return Err(ErrorCode::RxCbNotFound.into());
        };
        state.registry.remove_rx_socket(fd);
        state.waitset.remove_rx(fd);
        log::debug!("{}: rx callback on fd {} unregistered", self.name, fd);
        Ok(())
    }

    /// Open a receive socket without a handler
    ///
    /// The socket joins the wait-set: its error frames and drop counts still
    /// reach the error handlers, and [`poll_once`](Self::poll_once) reads
    /// from it.
    pub fn open_rx(&self, filters: &[CanFilter]) -> Result<RawFd> {
        let shared = self.shared()?;
        let mut state = shared.lock_for_update()?;

        let setup = lifecycle::open_rx(&shared.name, &shared.addr, &shared.config, filters)?;
        if setup.buf_len > 0 {
            shared.rx_buf_len.store(setup.buf_len, Ordering::Relaxed);
        }
        let fd = state.waitset.insert_rx(setup.socket);
        log::debug!("{}: rx socket {} opened (max fd {})", self.name, fd, state.waitset.max_fd());
        Ok(fd)
    }

    /// Close a receive socket and drop the handler bound to it, if any
    ///
    /// Descriptors the interface does not own are left alone.
    pub fn close_rx(&self, fd: RawFd) -> Result<()> {
        let shared = self.shared()?;
        let mut state = shared.lock_for_update()?;

        if state.waitset.remove_rx(fd).is_none() {
            log::debug!("{}: fd {} is not an open rx socket", self.name, fd);
        }
        state.registry.remove_rx_socket(fd);
        Ok(())
    }

    /// Register an interface-wide error handler
    pub fn register_error(&self, handler: ErrorHandlerRef) -> Result<()> {
        let shared = self.shared()?;
        let mut state = shared.lock_for_update()?;
        state.registry.add_error(handler).map_err(|e| {
            log::error!("{}: error callback already registered", self.name);
            e
        })
    }

    pub fn unregister_error(&self, handler: &ErrorHandlerRef) -> Result<()> {
        let shared = self.shared()?;
        let mut state = shared.lock_for_update()?;
        state.registry.remove_error(handler).map_err(|e| {
            log::error!("{}: error callback not found", self.name);
            e
        })
    }

    /// Wait up to `timeout` and read one datagram into `event`
    ///
    /// The event is decoded but not dispatched; pass it to
    /// [`dispatch`](Self::dispatch). `None` waits indefinitely.
    ///
    /// # Returns
    /// * `Result<usize>` - Bytes read, 0 if nothing arrived in time
    pub fn poll_once(&self, timeout: Option<Duration>, event: &mut Event) -> Result<usize> {
        poll::poll_once(self.shared()?, timeout, event)
    }

    /// Wait up to `timeout`, then read and dispatch everything pending
    pub fn poll(&self, timeout: Option<Duration>) -> Result<()> {
        poll::poll(self.shared()?, timeout)
    }

    pub fn poll_msec(&self, milliseconds: u64) -> Result<()> {
        self.poll(Some(Duration::from_millis(milliseconds)))
    }

    /// Deliver a decoded event to the registered handlers
    pub fn dispatch(&self, event: &Event) -> Result<()> {
        poll::dispatch_event(self.shared()?, event)
    }

    /// Send one frame
    ///
    /// With FD enabled the payload length is rounded up to the next valid FD
    /// size on a copy of the frame. A full transmit queue yields
    /// [`ErrorCode::TxRetryLater`]; see [`CanError::is_retry_later`].
    pub fn transmit(&self, frame: &CanFrame) -> Result<()> {
        let shared = self.shared()?;
        transmit(&shared.tx, &shared.name, shared.config.canfd_enabled, frame)
    }

    /// Worker poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us.load(Ordering::Relaxed))
    }

    /// Change the worker poll interval; takes effect on the next wait
    pub fn set_poll_interval(&self, interval: Duration) {
        self.poll_interval_us
            .store(duration_to_us(interval), Ordering::Relaxed);
    }

    pub fn set_poll_interval_msec(&self, milliseconds: u64) {
        self.set_poll_interval(Duration::from_millis(milliseconds));
    }

    /// Transmit socket descriptor, for external multiplexing
    pub fn tx_socket_fd(&self) -> Result<RawFd> {
        Ok(self.shared()?.tx.as_raw_fd())
    }

    /// Last nonzero kernel drop counter seen on any receive socket
    pub fn dropped_frames(&self) -> u32 {
        self.shared
            .as_ref()
            .map_or(0, |shared| shared.dropped_frames.load(Ordering::Relaxed))
    }

    /// Send buffer size granted by the kernel, 0 if none was requested
    pub fn tx_buf_len_actual(&self) -> usize {
        self.shared.as_ref().map_or(0, |shared| shared.tx_buf_len)
    }

    /// Receive buffer size granted to the last receive socket opened
    pub fn rx_buf_len_actual(&self) -> usize {
        self.shared
            .as_ref()
            .map_or(0, |shared| shared.rx_buf_len.load(Ordering::Relaxed))
    }
}

impl Drop for CanInterface {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CtrlMode;
    use crate::types::{ErrorNotice, Timestamp};
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct MockLink {
        calls: Arc<Mutex<Vec<String>>>,
        fail_on: Option<&'static str>,
    }

    impl MockLink {
        fn record(&self, call: &'static str, code: ErrorCode) -> Result<()> {
            self.calls.lock().unwrap().push(call.to_string());
            if self.fail_on == Some(call) {
                return Err(code.into());
            }
            Ok(())
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl LinkControl for MockLink {
        fn set_bitrate(&mut self, _: &str, _: u32) -> Result<()> {
            self.record("bitrate", ErrorCode::NlBitrate)
        }

        fn set_data_bitrate(&mut self, _: &str, _: u32) -> Result<()> {
            self.record("data_bitrate", ErrorCode::NlDataBitrate)
        }

        fn set_restart_ms(&mut self, _: &str, _: u32) -> Result<()> {
            self.record("restart_ms", ErrorCode::NlSetRestartMs)
        }

        fn set_ctrl_mode(&mut self, _: &str, _: CtrlMode) -> Result<()> {
            self.record("ctrl_mode", ErrorCode::NlSetCtrlMode)
        }

        fn start(&mut self, _: &str) -> Result<()> {
            self.record("start", ErrorCode::NlStart)
        }

        fn stop(&mut self, _: &str) -> Result<()> {
            self.record("stop", ErrorCode::NlStop)
        }
    }

    #[test]
    fn test_request_names() {
        assert_eq!(CanInterface::request(3).name(), "can3");
        let long = CanInterface::request_by_name("averyveryverylongname0");
        assert_eq!(long.name(), "averyveryverylo");
        assert_eq!(long.name().len(), MAX_IFNAME_LEN);
        assert!(!long.is_initialized());
        assert_eq!(long.mode(), None);
    }

    #[test]
    fn test_operations_before_init() {
        let can = CanInterface::request_by_name("vcan0");
        let handler: RxHandlerRef = Arc::new(|_: &CanFrame, _: Timestamp| {});
        let err_handler: ErrorHandlerRef = Arc::new(|_: &ErrorNotice| {});
        let mut event = Event::default();

        assert_eq!(can.register_rx(handler.clone(), &[]).unwrap_err(), ErrorCode::NullInterface);
        assert_eq!(can.unregister_rx(&handler).unwrap_err(), ErrorCode::NullInterface);
        assert_eq!(can.register_error(err_handler).unwrap_err(), ErrorCode::NullInterface);
        assert_eq!(can.open_rx(&[]).unwrap_err(), ErrorCode::NullInterface);
        assert_eq!(can.close_rx(3).unwrap_err(), ErrorCode::NullInterface);
        assert_eq!(
            can.poll_once(Some(Duration::ZERO), &mut event).unwrap_err(),
            ErrorCode::NullInterface
        );
        assert_eq!(can.poll_msec(0).unwrap_err(), ErrorCode::NullInterface);
        assert_eq!(can.dispatch(&event).unwrap_err(), ErrorCode::NullInterface);
        assert_eq!(
            can.transmit(&CanFrame::default()).unwrap_err(),
            ErrorCode::NullInterface
        );
        assert_eq!(can.tx_socket_fd().unwrap_err(), ErrorCode::NullInterface);
        assert_eq!(can.dropped_frames(), 0);
        assert_eq!(can.tx_buf_len_actual(), 0);
    }

    #[test]
    fn test_poll_interval_tuning() {
        let can = CanInterface::request_by_name("vcan0");
        assert_eq!(can.poll_interval(), Duration::from_secs(1));
        can.set_poll_interval_msec(250);
        assert_eq!(can.poll_interval(), Duration::from_millis(250));
        can.set_poll_interval(Duration::from_micros(1500));
        assert_eq!(can.poll_interval(), Duration::from_micros(1500));
    }

    #[test]
    fn test_init_link_order_then_socket_failure() {
        let link = MockLink::default();
        let mut can = CanInterface::request_by_name("nosuchcan0").with_link(link.clone());
        let config = InterfaceConfig::new()
            .with_bitrate(500_000)
            .with_restart_ms(100)
            .with_ctrl_mode(CtrlMode::new(CtrlMode::LOOPBACK, 0))
            .with_polled_mode(true);

        let err = can.init(config).unwrap_err();
        assert!(
            err.code() == ErrorCode::IfrIdx || err.code() == ErrorCode::TxSktCreate,
            "unexpected error: {:?}",
            err
        );
        assert_eq!(link.calls(), vec!["bitrate", "restart_ms", "ctrl_mode", "start"]);
        assert!(!can.is_initialized());

        // nothing was brought up, so nothing is stopped
        can.free().unwrap();
        assert_eq!(link.calls().len(), 4);
    }

    #[test]
    fn test_init_without_link_settings_only_starts_link() {
        let link = MockLink {
            fail_on: Some("bitrate"),
            ..MockLink::default()
        };
        let mut can = CanInterface::request_by_name("nosuchcan0").with_link(link.clone());

        let err = can.init(InterfaceConfig::new().with_polled_mode(true)).unwrap_err();
        assert_ne!(err, ErrorCode::NlBitrate);
        assert_eq!(link.calls(), vec!["start"]);
    }

    #[test]
    fn test_init_stops_at_link_failure() {
        let link = MockLink {
            fail_on: Some("data_bitrate"),
            ..MockLink::default()
        };
        let mut can = CanInterface::request(0).with_link(link.clone());
        let config = InterfaceConfig::new()
            .with_bitrate(500_000)
            .with_data_bitrate(2_000_000);

        assert_eq!(can.init(config).unwrap_err(), ErrorCode::NlDataBitrate);
        assert_eq!(link.calls(), vec!["bitrate", "data_bitrate"]);
        assert_eq!(can.config().data_bitrate, Some(2_000_000));
    }

    #[test]
    fn test_external_link_rejects_bitrate() {
        let mut can = CanInterface::request_by_name("nosuchcan0");
        let err = can.init(InterfaceConfig::new().with_bitrate(125_000)).unwrap_err();
        assert_eq!(err, ErrorCode::NlBitrate);
    }
}
