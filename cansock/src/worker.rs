//! Background worker
//!
//! One thread per interface running the draining poll with the interface's
//! current interval. Shutdown is cooperative: the run flag is cleared and the
//! wake pipe cuts the current wait short.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::ShutdownPolicy;
use crate::error::{CanError, ErrorCode, Result};
use crate::poll::worker_poll;
use crate::shared::Shared;

const CONTENDED_BACKOFF: Duration = Duration::from_micros(200);

pub(crate) struct Worker {
    handle: JoinHandle<()>,
    shared: Arc<Shared>,
}

fn run(shared: Arc<Shared>) {
    log::debug!("{}: worker started", shared.name);

    while shared.run.load(Ordering::Acquire) {
        match worker_poll(&shared) {
            Ok(()) => {}
            Err(e) if e.code() == ErrorCode::ThreadMutexLock => break,
            Err(e) => {
                log::debug!("{}: worker poll failed: {}", shared.name, e);
                // keep a persistent failure from spinning
                thread::sleep(shared.poll_interval());
            }
        }
        thread::yield_now();
        // callers holding or queued for the lock go first
        while shared.contenders() > 0 && shared.run.load(Ordering::Acquire) {
            thread::sleep(CONTENDED_BACKOFF);
        }
    }

    log::debug!("{}: worker stopped", shared.name);
}

impl Worker {
    pub fn spawn(shared: Arc<Shared>) -> Result<Self> {
        let name = format!("cansock-{}", shared.name);
        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || run(thread_shared))
            .map_err(|e| {
                log::error!("{}: unable to create thread: {}", shared.name, e);
                CanError::os(ErrorCode::ThreadCreate, e)
            })?;

        Ok(Self { handle, shared })
    }

    /// Ask the worker to stop and, with [`ShutdownPolicy::Join`], wait for it
    pub fn stop(self, policy: ShutdownPolicy) {
        self.shared.run.store(false, Ordering::Release);
        if let Some(wake) = &self.shared.wake {
            wake.wake();
        }

        match policy {
            ShutdownPolicy::Join => {
                if self.handle.join().is_err() {
                    log::error!("{}: worker panicked", self.shared.name);
                }
            }
            ShutdownPolicy::Detach => {
                log::debug!("{}: worker detached", self.shared.name);
            }
        }
    }
}
