//! Poll/run loop
//!
//! Every variant holds the interface lock from the wait until the last read,
//! so a poll never interleaves with a registration or another poll. The
//! worker locks plainly and waits on the wake pipe; caller threads lock
//! through the update path, which wakes the worker out of its wait.

use std::io;
use std::os::raw::c_int;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::dispatch::dispatch;
use crate::error::{CanError, ErrorCode, Result};
use crate::reader::{read_one, Source};
use crate::registry::Registry;
use crate::shared::{Shared, State, WakePipe};
use crate::types::{ErrorNotice, Event};

/// `poll(2)` timeout in milliseconds, rounding partial milliseconds up;
/// `None` blocks indefinitely
fn timeout_ms(timeout: Option<Duration>) -> c_int {
    match timeout {
        None => -1,
        Some(t) => {
            let ms = (t.as_micros() + 999) / 1000;
            ms.min(c_int::MAX as u128) as c_int
        }
    }
}

fn wait(fds: &mut [libc::pollfd], timeout: Option<Duration>) -> io::Result<usize> {
    let rv = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms(timeout)) };
    if rv < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rv as usize)
}

fn is_ready(pfd: &libc::pollfd) -> bool {
    pfd.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0
}

fn wait_failed(shared: &Shared, e: io::Error) -> CanError {
    log::error!("{}: poll error: {}", shared.name, e);
    CanError::os(ErrorCode::PollWait, e)
}

fn source_of(state: &State, fd: RawFd) -> Source {
    if Some(fd) == state.waitset.tx_fd() {
        Source::Tx
    } else {
        Source::Rx
    }
}

/// Wait for one ready socket and read a single datagram from it into `event`
///
/// Caller-side variant: the interface lock is taken through
/// [`Shared::lock_for_update`], which cuts a running worker's wait short.
/// Receive sockets are checked before the transmit socket. The event is not
/// dispatched. Returns the number of bytes read, 0 when the wait timed out
/// or was interrupted.
pub(crate) fn poll_once(shared: &Shared, timeout: Option<Duration>, event: &mut Event) -> Result<usize> {
    let state = shared.lock_for_update()?;
    let mut fds = state.waitset.pollfds(None);

    event.clear();
    match wait(&mut fds, timeout) {
        Ok(0) => return Ok(0),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
        Err(e) => return Err(wait_failed(shared, e)),
    }

    let Some(pfd) = fds.iter().find(|pfd| is_ready(pfd)) else {
        return Ok(0);
    };
    let nbytes = read_one(pfd.fd, source_of(&state, pfd.fd), shared.read_options(), event)
        .map_err(|e| {
            log::error!("{}: read error on fd {}: {}", shared.name, pfd.fd, e);
            e
        })?;
    shared.note_dropped(event);
    Ok(nbytes)
}

/// Read and dispatch every pending datagram of one socket
fn drain_socket(
    shared: &Shared,
    registry: &Registry,
    fd: RawFd,
    source: Source,
    event: &mut Event,
) -> Result<()> {
    loop {
        event.clear();
        if read_one(fd, source, shared.read_options(), event)? == 0 {
            return Ok(());
        }
        shared.note_dropped(event);
        dispatch(registry, event);
    }
}

/// Wait for readiness, then drain and dispatch every ready socket
///
/// A failed wait is reported to the error handlers before it is returned.
/// A read failure on one socket does not stop the others from draining;
/// the first one is returned.
fn poll_locked(
    shared: &Shared,
    state: &State,
    wake: Option<&WakePipe>,
    timeout: Option<Duration>,
) -> Result<()> {
    let wake_fd = wake.map(WakePipe::read_fd);
    let mut fds = state.waitset.pollfds(wake_fd);

    match wait(&mut fds, timeout) {
        Ok(0) => return Ok(()),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
        Err(e) => {
            let errno = e.raw_os_error().unwrap_or(0);
            state.registry.notify_errors(&ErrorNotice::Poll(errno));
            return Err(wait_failed(shared, e));
        }
    }

    let mut event = Event::default();
    let mut result = Ok(());

    for pfd in fds.iter().filter(|pfd| is_ready(pfd)) {
        if Some(pfd.fd) == wake_fd {
            if let Some(wake) = wake {
                wake.drain();
            }
            continue;
        }
        let source = source_of(state, pfd.fd);
        if let Err(e) = drain_socket(shared, &state.registry, pfd.fd, source, &mut event) {
            log::error!("{}: read error on fd {}: {}", shared.name, pfd.fd, e);
            if result.is_ok() {
                result = Err(e);
            }
        }
    }

    result
}

/// Draining poll on behalf of a caller thread
pub(crate) fn poll(shared: &Shared, timeout: Option<Duration>) -> Result<()> {
    let state = shared.lock_for_update()?;
    poll_locked(shared, &state, None, timeout)
}

/// One iteration of the background worker
///
/// The worker alone waits on the wake pipe, for at most the current poll
/// interval.
pub(crate) fn worker_poll(shared: &Shared) -> Result<()> {
    let state = shared.lock()?;
    poll_locked(shared, &state, shared.wake.as_ref(), Some(shared.poll_interval()))
}

/// Deliver a decoded event from a caller thread
pub(crate) fn dispatch_event(shared: &Shared, event: &Event) -> Result<()> {
    let state = shared.lock_for_update()?;
    dispatch(&state.registry, event);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterfaceConfig;
    use crate::registry::{ErrorHandlerRef, RxHandlerRef};
    use crate::shared::test_support::{self, loopback_socket, send_frame};
    use crate::socket::CanSocket;
    use crate::types::{CanFrame, Timestamp, CAN_MTU};
    use socket2::Socket;
    use std::os::unix::io::AsRawFd;
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    #[test]
    fn test_timeout_conversion() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_ms(Some(Duration::from_micros(1))), 1);
        assert_eq!(timeout_ms(Some(Duration::from_millis(100))), 100);
        assert_eq!(timeout_ms(Some(Duration::from_secs(1) + Duration::from_micros(500))), 1001);
        assert_eq!(timeout_ms(Some(Duration::from_secs(u64::MAX))), c_int::MAX);
    }

    #[test]
    fn test_wait_times_out_on_idle_pipe() {
        let pipe = WakePipe::new().unwrap();
        let mut fds = [libc::pollfd {
            fd: pipe.read_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        assert_eq!(wait(&mut fds, Some(Duration::from_millis(10))).unwrap(), 0);
        assert!(!is_ready(&fds[0]));

        pipe.wake();
        assert_eq!(wait(&mut fds, Some(Duration::ZERO)).unwrap(), 1);
        assert!(is_ready(&fds[0]));
    }
    #[derive(Default)]
    struct Seen {
        frames: Mutex<Vec<(&'static str, u32)>>,
        errors: Mutex<Vec<ErrorNotice>>,
    }

    impl Seen {
        fn ids(&self, tag: &str) -> Vec<u32> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .filter(|(t, _)| *t == tag)
                .map(|(_, id)| *id)
                .collect()
        }

        fn frame_count(&self) -> usize {
            self.frames.lock().unwrap().len()
        }
    }

    fn add_rx_socket(shared: &Shared, socket: Socket, seen: &Arc<Seen>, tag: &'static str) -> RawFd {
        let recorder = seen.clone();
        let handler: RxHandlerRef = Arc::new(move |frame: &CanFrame, _: Timestamp| {
            recorder.frames.lock().unwrap().push((tag, frame.id()));
        });
        let mut state = shared.lock_for_update().unwrap();
        let fd = state.waitset.insert_rx(CanSocket::from(socket));
        state.registry.add_rx(fd, handler).unwrap();
        fd
    }

    fn add_error_recorder(shared: &Shared, seen: &Arc<Seen>) {
        let recorder = seen.clone();
        let handler: ErrorHandlerRef = Arc::new(move |notice: &ErrorNotice| {
            recorder.errors.lock().unwrap().push(notice.clone());
        });
        shared.lock_for_update().unwrap().registry.add_error(handler).unwrap();
    }

    /// Poll until `seen` holds `count` frames, for at most a second
    fn poll_until(shared: &Shared, seen: &Seen, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(1);
        while seen.frame_count() < count && Instant::now() < deadline {
            poll(shared, Some(Duration::from_millis(50))).unwrap();
        }
    }

    fn frame(id: u32) -> CanFrame {
        CanFrame::new(id, &[id as u8]).unwrap()
    }

    #[test]
    fn test_poll_drains_ready_sockets_to_their_handlers() {
        let shared = test_support::shared(
            InterfaceConfig::new().with_process_header(false),
            false,
            Duration::from_millis(100),
        );
        let seen = Arc::new(Seen::default());
        let (a, a_addr) = loopback_socket();
        let (b, b_addr) = loopback_socket();
        let (sender, _) = loopback_socket();
        add_rx_socket(&shared, a, &seen, "a");
        add_rx_socket(&shared, b, &seen, "b");

        for id in 0x100..0x103 {
            send_frame(&sender, &a_addr, &frame(id));
        }
        for id in 0x200..0x202 {
            send_frame(&sender, &b_addr, &frame(id));
        }
        poll_until(&shared, &seen, 5);

        assert_eq!(seen.ids("a"), vec![0x100, 0x101, 0x102]);
        assert_eq!(seen.ids("b"), vec![0x200, 0x201]);

        let mut event = Event::default();
        assert_eq!(poll_once(&shared, Some(Duration::from_millis(10)), &mut event).unwrap(), 0);
        assert_eq!(seen.frame_count(), 5);
    }

    #[test]
    fn test_poll_once_reads_without_dispatching() {
        let shared = test_support::shared(InterfaceConfig::new(), false, Duration::from_millis(100));
        let seen = Arc::new(Seen::default());
        let (a, a_addr) = loopback_socket();
        let (sender, _) = loopback_socket();
        let a_fd = add_rx_socket(&shared, a, &seen, "a");

        send_frame(&sender, &a_addr, &frame(0x42));
        let mut event = Event::default();
        let n = poll_once(&shared, Some(Duration::from_secs(1)), &mut event).unwrap();

        assert_eq!(n, CAN_MTU);
        assert_eq!(event.origin, Some(a_fd));
        assert_eq!(event.frame.id(), 0x42);
        assert!(event.is_rx);
        assert_eq!(seen.frame_count(), 0);

        dispatch_event(&shared, &event).unwrap();
        assert_eq!(seen.ids("a"), vec![0x42]);
    }

    #[test]
    fn test_queue_overflow_reported_once_with_next_frame() {
        let shared = test_support::shared(InterfaceConfig::new(), false, Duration::from_millis(100));
        let seen = Arc::new(Seen::default());
        add_error_recorder(&shared, &seen);

        let (rx, rx_addr) = loopback_socket();
        // smallest queue the kernel grants
        rx.set_recv_buffer_size(1).unwrap();
        let rx = CanSocket::from(rx);
        rx.set_rxq_ovfl().unwrap();
        let rx_fd = rx.as_raw_fd();
        let recorder = seen.clone();
        let handler: RxHandlerRef = Arc::new(move |frame: &CanFrame, _: Timestamp| {
            recorder.frames.lock().unwrap().push(("rx", frame.id()));
        });
        {
            let mut state = shared.lock_for_update().unwrap();
            state.waitset.insert_rx(rx);
            state.registry.add_rx(rx_fd, handler).unwrap();
        }

        let (sender, _) = loopback_socket();
        for id in 0..64 {
            send_frame(&sender, &rx_addr, &frame(id));
        }
        poll_until(&shared, &seen, 1);
        poll(&shared, Some(Duration::from_millis(50))).unwrap();
        let queued = seen.frame_count();
        assert!(queued > 0 && queued < 64, "{} of 64 frames queued", queued);
        seen.errors.lock().unwrap().clear();

        send_frame(&sender, &rx_addr, &frame(0x7FF));
        poll_until(&shared, &seen, queued + 1);

        assert_eq!(seen.ids("rx").last(), Some(&0x7FF));
        let errors = seen.errors.lock().unwrap().clone();
        assert_eq!(errors.len(), 1, "notices: {:?}", errors);
        match errors[0] {
            ErrorNotice::DroppedFrames(n) => {
                assert!(n as usize >= 64 - queued, "{} drops for {} queued", n, queued);
                assert_eq!(shared.dropped_frames.load(Ordering::Relaxed), n);
            }
            ref other => panic!("unexpected notice {:?}", other),
        }
    }

    #[test]
    fn test_caller_poll_ignores_wake_pipe() {
        let shared = test_support::shared(InterfaceConfig::new(), true, Duration::from_secs(1));
        shared.wake.as_ref().unwrap().wake();

        let mut event = Event::default();
        let start = Instant::now();
        assert_eq!(poll_once(&shared, Some(Duration::from_millis(50)), &mut event).unwrap(), 0);
        assert!(start.elapsed() >= Duration::from_millis(40));

        // the worker iteration consumes the wake-up
        worker_poll(&shared).unwrap();
        assert!(!test_support::wait_readable_within(
            shared.wake.as_ref().unwrap().read_fd(),
            Duration::ZERO
        ));
    }
}
