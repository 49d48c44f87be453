//! Partitioned tick storage
//!
//! One append-only file per (symbol, calendar day). Partition lifecycle
//! changes (create, seal, compress, archive, delete) are serialized across
//! processes by a per-symbol advisory lock and recorded in a per-symbol
//! catalog. Plain appends never take the cross-process lock.

pub mod catalog;
pub mod layout;
pub mod lock;
pub mod manager;
pub mod record;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use market_types::ids::Symbol;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use catalog::{Catalog, CatalogError, PartitionMeta, PartitionState};
pub use layout::Layout;
pub use lock::{LockError, PartitionLock};
pub use manager::{AppendOutcome, RotationOutcome, StorageManager};
pub use record::RecordError;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error("partition {symbol}/{day} is sealed (active partition is {active})")]
    PartitionSealed {
        symbol: Symbol,
        day: NaiveDate,
        active: NaiveDate,
    },

    #[error("partition {symbol}/{day} not found")]
    PartitionNotFound { symbol: Symbol, day: NaiveDate },

    #[error("cannot rotate {symbol} to {day}: latest allowed day is {latest}")]
    RotationTooFarAhead {
        symbol: Symbol,
        day: NaiveDate,
        latest: NaiveDate,
    },

    #[error("no writable partition for {symbol}")]
    Unavailable { symbol: Symbol },
}

impl StorageError {
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, StorageError::Lock(LockError::Timeout { .. }))
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for partitions, catalogs and archives.
    pub root: PathBuf,
    /// Day boundary as an offset from midnight UTC, in ms.
    pub day_boundary_offset_ms: i64,
    /// Maximum wait for a partition lock.
    pub lock_timeout_ms: u64,
    /// How often buffered appends are flushed to the OS.
    pub flush_interval_ms: u64,
}

impl StorageConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
            day_boundary_offset_ms: 0,
            lock_timeout_ms: 2_000,
            flush_interval_ms: 1_000,
        }
    }
}
