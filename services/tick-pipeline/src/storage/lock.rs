//! Cross-process advisory lock for partition lifecycle changes
//!
//! One lock file per symbol. The OS releases the lock when the holding
//! process exits, so a crashed holder never wedges its peers. Acquisition
//! polls with capped exponential backoff until a deadline.
//!
//! Each acquisition opens its own file handle, so two threads of the same
//! process contend exactly like two processes do.

use std::fs::{self, File, OpenOptions, TryLockError};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum LockError {
    #[error("timed out after {waited_ms}ms waiting for lock {}", path.display())]
    Timeout { path: PathBuf, waited_ms: u64 },

    #[error("IO error on lock {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Held advisory lock. Released on drop, on every exit path.
#[derive(Debug)]
pub struct PartitionLock {
    file: File,
    path: PathBuf,
}

impl PartitionLock {
    /// Wait up to `timeout` for the lock at `path`.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let file = Self::open(path)?;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            match file.try_lock() {
                Ok(()) => {
                    debug!(
                        lock = %path.display(),
                        waited_us = started.elapsed().as_micros() as u64,
                        "Partition lock acquired"
                    );
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(TryLockError::WouldBlock) => {}
                Err(TryLockError::Error(source)) => {
                    return Err(LockError::Io {
                        path: path.to_path_buf(),
                        source,
                    })
                }
            }

            let now = Instant::now();
            if now >= deadline {
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!(lock = %path.display(), waited_ms, "Partition lock acquisition timed out");
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    waited_ms,
                });
            }
            thread::sleep(backoff.min(deadline - now));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Take the lock only if it is free right now.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, LockError> {
        let file = Self::open(path)?;
        match file.try_lock() {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(TryLockError::WouldBlock) => Ok(None),
            Err(TryLockError::Error(source)) => Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(path: &Path) -> Result<File, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(io_err)
    }
}

impl Drop for PartitionLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!(lock = %self.path.display(), error = %e, "Failed to release partition lock");
        }
    }
}
