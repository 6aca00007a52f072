//! Cross-process mutual exclusion for ledger access.
//!
//! The lock is a marker file created with create-new semantics: whoever
//! creates the marker holds the gate, and releasing deletes it. There is
//! no metadata inside the marker; its existence is the entire lock
//! state. The lock is advisory: every participant must use the same
//! marker path.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum GateError {
    #[error("gate not acquired within {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("gate filesystem error: {0}")]
    Lock(#[from] io::Error),
}

/// Advisory lock serializing all ledger read-modify-write cycles.
pub trait Gate {
    /// Block until the gate is held by this caller, polling every
    /// `retry_interval`, or fail with [`GateError::Timeout`] once
    /// `timeout` has elapsed in total.
    fn acquire(&self, timeout: Duration, retry_interval: Duration) -> Result<(), GateError>;

    /// Release the gate. Idempotent if already released.
    fn release(&self) -> Result<(), GateError>;

    /// Run `f` with the gate held, releasing on every exit path.
    ///
    /// The backstop fires only on unwind; the normal path releases
    /// explicitly so that a failed release surfaces as an error.
    fn locked<T>(
        &self,
        timeout: Duration,
        retry_interval: Duration,
        f: impl FnOnce() -> T,
    ) -> Result<T, GateError>
    where
        Self: Sized,
    {
        struct Backstop<'a, G: Gate>(Option<&'a G>);

        impl<G: Gate> Drop for Backstop<'_, G> {
            fn drop(&mut self) {
                if let Some(gate) = self.0.take() {
                    let _ = gate.release();
                }
            }
        }

        self.acquire(timeout, retry_interval)?;
        let mut backstop = Backstop(Some(self));
        let out = f();
        backstop.0 = None;
        self.release()?;
        Ok(out)
    }
}

/// Marker-file gate.
#[derive(Debug, Clone)]
pub struct FileGate {
    /// Location of the lock marker.
    path: PathBuf,
}

impl FileGate {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Gate for FileGate {
    fn acquire(&self, timeout: Duration, retry_interval: Duration) -> Result<(), GateError> {
        let start = Instant::now();
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(_) => {
                    debug!(path = %self.path.display(), "gate acquired");
                    return Ok(());
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if start.elapsed() >= timeout {
                        return Err(GateError::Timeout { timeout });
                    }
                    trace!(path = %self.path.display(), "gate held elsewhere, retrying");
                    std::thread::sleep(retry_interval);
                }
                Err(err) => return Err(GateError::Lock(err)),
            }
        }
    }

    fn release(&self) -> Result<(), GateError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "gate released");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(GateError::Lock(err)),
        }
    }
}

/// In-memory gate for tests. Same contract, no filesystem.
#[derive(Debug, Default)]
pub struct MemGate {
    held: AtomicBool,
}

impl MemGate {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Gate for MemGate {
    fn acquire(&self, timeout: Duration, retry_interval: Duration) -> Result<(), GateError> {
        let start = Instant::now();
        loop {
            if self
                .held
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(GateError::Timeout { timeout });
            }
            std::thread::sleep(retry_interval);
        }
    }

    fn release(&self) -> Result<(), GateError> {
        self.held.store(false, Ordering::Release);
        Ok(())
    }
}
