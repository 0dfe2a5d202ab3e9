use std::io;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Condvar, Mutex,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("cannot spawn {name} stage: {source}")]
    Spawn {
        name: &'static str,
        source: io::Error,
    },
    #[error("{0} stage did not exit in time")]
    Timeout(&'static str),
    #[error("{0} stage panicked")]
    Panicked(&'static str),
}

struct StageShared {
    running: Mutex<bool>,
    exited: Condvar,
    armed: AtomicBool,
}

/// Given to the body of a stage to check whether it should keep going.
pub(crate) struct StageControl(Arc<StageShared>);

impl StageControl {
    pub(crate) fn is_armed(&self) -> bool {
        self.0.armed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
impl StageControl {
    /// A control that is never disarmed, to run a stage body on the current
    /// thread.
    pub(crate) fn always_armed() -> Self {
        Self(Arc::new(StageShared {
            running: Mutex::new(true),
            exited: Condvar::new(),
            armed: AtomicBool::new(true),
        }))
    }
}

/// Marks the stage as exited when its thread ends, even by panicking.
struct ExitGuard(Arc<StageShared>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if let Ok(mut running) = self.0.running.lock() {
            *running = false;
        }
        self.0.exited.notify_all();
    }
}

/// A pipeline stage running on its own thread.
///
/// The body runs once and is expected to loop on its input until either the
/// input is closed (its queue deinitialized) or the stage is disarmed.
/// Disarming only takes effect when the body next checks its control, so a
/// unit of work in progress always completes.
pub(crate) struct StageWorker {
    name: &'static str,
    shared: Arc<StageShared>,
    handle: Option<JoinHandle<()>>,
}

impl StageWorker {
    pub(crate) fn spawn<F>(name: &'static str, body: F) -> Result<Self, StageError>
    where
        F: FnOnce(StageControl) + Send + 'static,
    {
        let shared = Arc::new(StageShared {
            running: Mutex::new(true),
            exited: Condvar::new(),
            armed: AtomicBool::new(true),
        });
        let control = StageControl(Arc::clone(&shared));

        let handle = thread::Builder::new()
            .name(format!("camhal {}", name))
            .spawn(move || {
                let _exit = ExitGuard(Arc::clone(&control.0));
                debug!("{} stage started", name);
                body(control);
                debug!("{} stage exiting", name);
            })
            .map_err(|source| StageError::Spawn { name, source })?;

        Ok(Self {
            name,
            shared,
            handle: Some(handle),
        })
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    /// Ask the stage to stop at its next opportunity.
    pub(crate) fn disarm(&self) {
        self.shared.armed.store(false, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        *self.shared.running.lock().unwrap()
    }

    /// Wait up to `timeout` for the stage to exit.
    ///
    /// A stage joined from its own thread (i.e. from a callback it invoked)
    /// cannot be waited for: it is detached and will exit on its own once
    /// the callback returns.
    pub(crate) fn join(mut self, timeout: Duration) -> Result<(), StageError> {
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => return Ok(()),
        };

        if handle.thread().id() == thread::current().id() {
            debug!("{} stage stopped from its own thread, detaching", self.name);
            return Ok(());
        }

        let running = self.shared.running.lock().unwrap();
        let (running, _) = self
            .shared
            .exited
            .wait_timeout_while(running, timeout, |running| *running)
            .unwrap();
        if *running {
            error!("{} stage still running after {:?}, detaching", self.name, timeout);
            return Err(StageError::Timeout(self.name));
        }
        drop(running);

        handle.join().map_err(|_| StageError::Panicked(self.name))
    }
}

impl Drop for StageWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.disarm();
            debug!("{} stage detached without being joined", self.name);
        }
    }
}

/// Logs the rate at which a stage processes frames, once per second.
pub(crate) struct FpsCounter {
    name: &'static str,
    enabled: bool,
    frames: u32,
    since: Instant,
}

impl FpsCounter {
    pub(crate) fn new(name: &'static str, enabled: bool) -> Self {
        Self {
            name,
            enabled,
            frames: 0,
            since: Instant::now(),
        }
    }

    pub(crate) fn tick(&mut self) {
        if !self.enabled {
            return;
        }

        self.frames += 1;
        let elapsed = self.since.elapsed();
        if elapsed >= Duration::from_secs(1) {
            info!(
                "{} stage: {:.2} fps",
                self.name,
                self.frames as f64 / elapsed.as_secs_f64()
            );
            self.frames = 0;
            self.since = Instant::now();
        }
    }
}
