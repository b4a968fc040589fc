//! State shared between an interface handle and its background worker

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use socket2::SockAddr;

use crate::config::InterfaceConfig;
use crate::error::{CanError, ErrorCode, Result};
use crate::reader::ReadOptions;
use crate::registry::Registry;
use crate::socket::CanSocket;
use crate::types::Event;
use crate::waitset::WaitSet;

/// Everything guarded by the interface lock
#[derive(Default)]
pub(crate) struct State {
    pub waitset: WaitSet,
    pub registry: Registry,
}

/// Self-pipe used to cut a blocked wait short
#[derive(Debug)]
pub(crate) struct WakePipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl WakePipe {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0; 2];
        let rv = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rv < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            read: unsafe { OwnedFd::from_raw_fd(fds[0]) },
            write: unsafe { OwnedFd::from_raw_fd(fds[1]) },
        })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Make the read end ready; a full pipe is already ready
    pub fn wake(&self) {
        let byte = 1u8;
        unsafe {
            libc::write(
                self.write.as_raw_fd(),
                &byte as *const u8 as *const libc::c_void,
                1,
            );
        }
    }

    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.read.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

pub(crate) struct Shared {
    pub name: String,
    pub addr: SockAddr,
    pub config: InterfaceConfig,
    pub tx: CanSocket,
    pub tx_buf_len: usize,
    pub rx_buf_len: AtomicUsize,
    pub dropped_frames: AtomicU32,
    pub run: AtomicBool,
    pub wake: Option<WakePipe>,
    poll_interval_us: Arc<AtomicU64>,
    contenders: AtomicUsize,
    state: Mutex<State>,
}

impl Shared {
    pub fn new(
        name: String,
        addr: SockAddr,
        config: InterfaceConfig,
        tx: CanSocket,
        tx_buf_len: usize,
        wake: Option<WakePipe>,
        poll_interval_us: Arc<AtomicU64>,
    ) -> Self {
        let mut state = State::default();
        state.waitset.set_tx(tx.as_raw_fd());

        Self {
            name,
            addr,
            config,
            tx,
            tx_buf_len,
            rx_buf_len: AtomicUsize::new(0),
            dropped_frames: AtomicU32::new(0),
            run: AtomicBool::new(true),
            wake,
            poll_interval_us,
            contenders: AtomicUsize::new(0),
            state: Mutex::new(state),
        }
    }

    pub fn read_options(&self) -> ReadOptions {
        ReadOptions {
            process_header: self.config.process_header,
            hw_timestamp: self.config.hw_timestamp,
        }
    }

    /// Worker poll interval, shared with the owning handle
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us.load(Ordering::Relaxed))
    }

    /// Record the kernel drop counter carried by a decoded event
    pub fn note_dropped(&self, event: &Event) {
        if event.dropped_frames > 0 {
            self.dropped_frames
                .store(event.dropped_frames, Ordering::Relaxed);
        }
    }

    /// Threads other than the worker waiting for the lock
    pub fn contenders(&self) -> usize {
        self.contenders.load(Ordering::Acquire)
    }

    /// Take the lock as the background worker
    ///
    /// Only the worker waits on the wake pipe, so every other thread goes
    /// through [`Shared::lock_for_update`].
    pub fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| {
            log::error!("{}: unable to lock interface mutex", self.name);
            CanError::from(ErrorCode::ThreadMutexLock)
        })
    }

    /// Take the lock from any thread other than the worker
    ///
    /// Wakes the worker first so the caller does not sit out a full poll
    /// interval, and holds the worker back until the guard drops.
    pub fn lock_for_update(&self) -> Result<UpdateGuard<'_>> {
        self.contenders.fetch_add(1, Ordering::AcqRel);
        if let Some(wake) = &self.wake {
            wake.wake();
        }
        match self.lock() {
            Ok(guard) => Ok(UpdateGuard {
                shared: self,
                guard,
            }),
            Err(e) => {
                self.contenders.fetch_sub(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }
}

pub(crate) struct UpdateGuard<'a> {
    shared: &'a Shared,
    guard: MutexGuard<'a, State>,
}

impl Deref for UpdateGuard<'_> {
    type Target = State;

    fn deref(&self) -> &State {
        &self.guard
    }
}

impl DerefMut for UpdateGuard<'_> {
    fn deref_mut(&mut self) -> &mut State {
        &mut self.guard
    }
}

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        self.shared.contenders.fetch_sub(1, Ordering::AcqRel);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_pipe_ready_then_drained() {
        let pipe = WakePipe::new().unwrap();
        pipe.wake();
        pipe.wake();

        let mut pfd = libc::pollfd {
            fd: pipe.read_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut pfd, 1, 0) };
        assert_eq!(ready, 1);

        pipe.drain();
        pfd.revents = 0;
        let ready = unsafe { libc::poll(&mut pfd, 1, 0) };
        assert_eq!(ready, 0);
    }
    #[test]
    fn test_update_guard_wakes_worker_and_counts_contenders() {
        let shared = test_support::shared(InterfaceConfig::new(), true, Duration::from_secs(1));
        let wake_fd = shared.wake.as_ref().unwrap().read_fd();
        {
            let _guard = shared.lock_for_update().unwrap();
            assert_eq!(shared.contenders(), 1);
            assert!(test_support::wait_readable(wake_fd));
        }
        assert_eq!(shared.contenders(), 0);
    }
}
