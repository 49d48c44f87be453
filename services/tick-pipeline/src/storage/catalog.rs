//! Per-symbol partition catalog
//!
//! The catalog is the durable record of every partition's lifecycle state.
//! It is rewritten atomically (write temp, fsync, rename) and only ever
//! mutated while the symbol's [`PartitionLock`](super::lock::PartitionLock)
//! is held, so a reload under the lock always observes the latest state.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use market_types::ids::Symbol;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::layout::sync_dir;

const CATALOG_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("catalog {path} unreadable: {reason}")]
    Malformed { path: String, reason: String },
}

/// Lifecycle state of one partition.
///
/// Transitions only move forward:
/// `Active → Sealed → Compressed → Archived → Deleted`
/// (a sealed partition may also be deleted directly by retention).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionState {
    Active,
    Sealed,
    Compressed,
    Archived,
    Deleted,
}

impl PartitionState {
    fn rank(&self) -> u8 {
        match self {
            PartitionState::Active => 0,
            PartitionState::Sealed => 1,
            PartitionState::Compressed => 2,
            PartitionState::Archived => 3,
            PartitionState::Deleted => 4,
        }
    }

    /// Whether moving from `self` to `next` is a legal forward transition.
    pub fn can_advance_to(&self, next: PartitionState) -> bool {
        match self {
            PartitionState::Active => next == PartitionState::Sealed,
            _ => next.rank() > self.rank(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub day: NaiveDate,
    pub state: PartitionState,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub sealed_at: Option<DateTime<Utc>>,
    /// Size of the plain partition at seal time.
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub tick_count: u64,
    #[serde(default)]
    pub compressed_bytes: Option<u64>,
    /// A write to this partition failed; its contents may be incomplete.
    #[serde(default)]
    pub degraded: bool,
}

impl PartitionMeta {
    pub fn active(day: NaiveDate) -> Self {
        Self {
            day,
            state: PartitionState::Active,
            created_at: Utc::now(),
            sealed_at: None,
            size_bytes: 0,
            tick_count: 0,
            compressed_bytes: None,
            degraded: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    version: u32,
    pub symbol: Symbol,
    partitions: BTreeMap<NaiveDate, PartitionMeta>,
}

impl Catalog {
    pub fn new(symbol: Symbol) -> Self {
        Self {
            version: CATALOG_VERSION,
            symbol,
            partitions: BTreeMap::new(),
        }
    }

    /// Load the catalog at `path`; a missing file is an empty catalog.
    pub fn load(path: &Path, symbol: &Symbol) -> Result<Self, CatalogError> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::new(symbol.clone())),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data).map_err(|e| CatalogError::Malformed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Atomically replace the catalog at `path`.
    pub fn store(&self, path: &Path) -> Result<(), CatalogError> {
        let data = serde_json::to_vec_pretty(self).map_err(|e| CatalogError::Malformed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let tmp_path = path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        sync_dir(dir)?;
        Ok(())
    }

    pub fn get(&self, day: NaiveDate) -> Option<&PartitionMeta> {
        self.partitions.get(&day)
    }

    pub fn get_mut(&mut self, day: NaiveDate) -> Option<&mut PartitionMeta> {
        self.partitions.get_mut(&day)
    }

    pub fn insert(&mut self, meta: PartitionMeta) {
        self.partitions.insert(meta.day, meta);
    }

    /// The single active partition, if one exists.
    pub fn active(&self) -> Option<&PartitionMeta> {
        self.partitions
            .values()
            .rev()
            .find(|meta| meta.state == PartitionState::Active)
    }

    pub fn active_day(&self) -> Option<NaiveDate> {
        self.active().map(|meta| meta.day)
    }

    pub fn active_count(&self) -> usize {
        self.partitions
            .values()
            .filter(|meta| meta.state == PartitionState::Active)
            .count()
    }

    /// Partitions in `state`, oldest first.
    pub fn in_state(&self, state: PartitionState) -> impl Iterator<Item = &PartitionMeta> {
        self.partitions.values().filter(move |meta| meta.state == state)
    }

    /// All partitions, oldest first.
    pub fn partitions(&self) -> impl Iterator<Item = &PartitionMeta> {
        self.partitions.values()
    }

    pub fn degraded_count(&self) -> usize {
        self.partitions
            .values()
            .filter(|meta| meta.degraded && meta.state != PartitionState::Deleted)
            .count()
    }
}
