//! Storage Manager
//!
//! Owns one writer slot per symbol and runs the partition rotation
//! protocol:
//!
//! 1. acquire the symbol's partition lock (bounded wait)
//! 2. reload the catalog from disk; if the active partition already covers
//!    the target day, another thread or process rotated first: stop
//! 3. flush, fsync and close the active partition (recreating it empty if
//!    the file went missing)
//! 4. mark it sealed, pre-create the next partition, mark that active
//! 5. persist the catalog; the lock guard releases on every exit path
//!
//! Appends take only the in-process slot mutex. A tick for a later day
//! triggers rotation; if the lock cannot be had in time the tick is written
//! to the current partition instead of being lost.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use market_types::ids::Symbol;
use market_types::tick::Tick;
use market_types::time::{day_of, now_millis};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::catalog::{Catalog, PartitionMeta, PartitionState};
use super::layout::{sync_dir, Layout};
use super::lock::PartitionLock;
use super::record::{self, RecordReader};
use super::{StorageConfig, StorageError};
use crate::metrics::PipelineMetrics;

/// Where an appended tick landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Written to the partition for the tick's own day.
    Appended,
    /// Rotation lock timed out; written to the still-active older partition.
    Fallback { active: NaiveDate },
}

/// Result of a rotation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RotationOutcome {
    /// First partition for the symbol.
    Created { day: NaiveDate },
    /// `from` sealed, `to` active.
    Rotated { from: NaiveDate, to: NaiveDate },
    /// The active partition already covered the requested day.
    AlreadyRotated { active: NaiveDate },
    /// Forced reopen of the active partition.
    Reopened { day: NaiveDate },
}

#[derive(Default)]
struct WriterSlot {
    day: Option<NaiveDate>,
    writer: Option<BufWriter<File>>,
    bytes: u64,
    ticks: u64,
    degraded: bool,
}

fn lock_slot(slot: &Mutex<WriterSlot>) -> MutexGuard<'_, WriterSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct StorageManager {
    layout: Layout,
    config: StorageConfig,
    slots: DashMap<Symbol, Arc<Mutex<WriterSlot>>>,
    metrics: Arc<PipelineMetrics>,
}

impl StorageManager {
    /// Open the store rooted at `config.root`, recovering every symbol's
    /// active partition (torn tails are truncated, mid-file corruption is
    /// quarantined).
    pub fn open(config: StorageConfig, metrics: Arc<PipelineMetrics>) -> Result<Self, StorageError> {
        let layout = Layout::new(&config.root);
        fs::create_dir_all(layout.ticks_dir())?;
        fs::create_dir_all(layout.archive_dir())?;

        let manager = Self {
            layout,
            config,
            slots: DashMap::new(),
            metrics,
        };

        let symbols = manager.layout.discover_symbols()?;
        for symbol in &symbols {
            if let Err(e) = manager.recover_symbol(symbol) {
                manager.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
                error!(symbol = %symbol, error = %e, "Partition recovery failed");
            }
        }

        info!(
            root = %manager.layout.root().display(),
            symbols = symbols.len(),
            "Storage opened"
        );
        Ok(manager)
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Calendar day a tick timestamp is stored under.
    pub fn partition_day(&self, timestamp: i64) -> NaiveDate {
        day_of(timestamp, self.config.day_boundary_offset_ms)
    }

    /// Active partition day this process is writing for `symbol`.
    pub fn active_day(&self, symbol: &Symbol) -> Option<NaiveDate> {
        let slot = self.slots.get(symbol).map(|s| Arc::clone(s.value()))?;
        let day = lock_slot(&slot).day;
        day
    }

    // ── Appends ─────────────────────────────────────────────────────

    /// Persist one validated tick.
    ///
    /// Every failure other than a sealed-day refusal counts the tick as not
    /// persisted.
    pub fn append(&self, tick: &Tick) -> Result<AppendOutcome, StorageError> {
        let symbol = &tick.symbol;
        let day = self.partition_day(tick.timestamp);
        let slot = self.slot(symbol);
        let record = record::encode(tick);

        let result = match self.try_write(symbol, &slot, day, &record, false) {
            Ok(Some(outcome)) => Ok(outcome),
            Ok(None) => match self.rotate(symbol, day) {
                Err(e) if !e.is_lock_timeout() => Err(e),
                rotated => self
                    .try_write(symbol, &slot, day, &record, rotated.is_err())
                    .and_then(|outcome| {
                        outcome.ok_or_else(|| StorageError::Unavailable {
                            symbol: symbol.clone(),
                        })
                    }),
            },
            Err(e) => Err(e),
        };

        match &result {
            Ok(_) | Err(StorageError::PartitionSealed { .. }) => {}
            Err(e) => {
                self.metrics.ticks_not_persisted.fetch_add(1, Ordering::Relaxed);
                if let StorageError::Io(io) = e {
                    self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
                    error!(symbol = %symbol, day = %day, error = %io, "Tick append failed");
                    self.mark_degraded(symbol);
                }
            }
        }
        result
    }

    /// Write into the slot if it can take `day`. `None` means a rotation is
    /// needed first.
    fn try_write(
        &self,
        symbol: &Symbol,
        slot: &Mutex<WriterSlot>,
        day: NaiveDate,
        record: &[u8],
        fallback: bool,
    ) -> Result<Option<AppendOutcome>, StorageError> {
        let mut guard = lock_slot(slot);
        match guard.day {
            Some(active) if active == day => {
                self.write_record(symbol, &mut guard, record)?;
                Ok(Some(AppendOutcome::Appended))
            }
            Some(active) if active > day => {
                self.metrics.sealed_partition_writes.fetch_add(1, Ordering::Relaxed);
                debug!(symbol = %symbol, day = %day, active = %active, "Tick for sealed partition refused");
                Err(StorageError::PartitionSealed {
                    symbol: symbol.clone(),
                    day,
                    active,
                })
            }
            Some(active) if fallback => {
                self.write_record(symbol, &mut guard, record)?;
                self.metrics.lock_fallback_writes.fetch_add(1, Ordering::Relaxed);
                warn!(
                    symbol = %symbol,
                    tick_day = %day,
                    active = %active,
                    "Rotation lock timed out; tick written to current partition"
                );
                Ok(Some(AppendOutcome::Fallback { active }))
            }
            _ => Ok(None),
        }
    }

    fn write_record(&self, symbol: &Symbol, slot: &mut WriterSlot, record: &[u8]) -> Result<(), StorageError> {
        if slot.writer.is_none() {
            let day = slot.day.ok_or_else(|| StorageError::Unavailable {
                symbol: symbol.clone(),
            })?;
            let degraded = slot.degraded;
            *slot = self.attach(symbol, day)?;
            slot.degraded |= degraded;
        }

        let Some(writer) = slot.writer.as_mut() else {
            return Err(StorageError::Unavailable {
                symbol: symbol.clone(),
            });
        };

        let started = Instant::now();
        if let Err(e) = writer.write_all(record) {
            slot.degraded = true;
            return Err(e.into());
        }
        slot.bytes += record.len() as u64;
        slot.ticks += 1;

        self.metrics.ticks_persisted.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .bytes_written
            .fetch_add(record.len() as u64, Ordering::Relaxed);
        self.metrics
            .record_latency(crate::metrics::Stage::Storage, started.elapsed());
        Ok(())
    }

    /// Flag the symbol's active partition as degraded in the catalog.
    fn mark_degraded(&self, symbol: &Symbol) {
        let result = (|| -> Result<bool, StorageError> {
            let _lock = PartitionLock::acquire(&self.layout.lock_path(symbol), self.config.lock_timeout())?;
            let path = self.layout.catalog_path(symbol);
            let mut catalog = Catalog::load(&path, symbol)?;
            let Some(day) = catalog.active_day() else {
                return Ok(false);
            };
            match catalog.get_mut(day) {
                Some(meta) if !meta.degraded => meta.degraded = true,
                _ => return Ok(false),
            }
            catalog.store(&path)?;
            Ok(true)
        })();

        match result {
            Ok(true) => {
                self.metrics.degraded_partitions.fetch_add(1, Ordering::Relaxed);
                warn!(symbol = %symbol, "Active partition marked degraded");
            }
            Ok(false) => {}
            Err(e) => error!(symbol = %symbol, error = %e, "Failed to mark partition degraded"),
        }
    }

    // ── Rotation ────────────────────────────────────────────────────

    /// Rotate `symbol` so that `target_day` is the active partition.
    ///
    /// Idempotent: concurrent callers for the same day see exactly one
    /// `Rotated`/`Created`, the rest `AlreadyRotated`.
    pub fn rotate(&self, symbol: &Symbol, target_day: NaiveDate) -> Result<RotationOutcome, StorageError> {
        let result = self.rotate_locked(symbol, target_day, false);
        self.record_rotation(symbol, target_day, &result);
        result
    }

    /// Operator-triggered rotation. If `target_day` is the active day the
    /// partition is flushed, recreated if missing and reopened.
    ///
    /// `target_day` may be at most one day past the current partition day;
    /// activating a later day would seal the partition live ticks belong to.
    pub fn force_rotate(&self, symbol: &Symbol, target_day: NaiveDate) -> Result<RotationOutcome, StorageError> {
        let today = self.partition_day(now_millis());
        let latest = today.succ_opt().unwrap_or(today);
        if target_day > latest {
            warn!(symbol = %symbol, day = %target_day, latest = %latest, "Forced rotation beyond next day refused");
            return Err(StorageError::RotationTooFarAhead {
                symbol: symbol.clone(),
                day: target_day,
                latest,
            });
        }

        info!(symbol = %symbol, day = %target_day, "Forced rotation requested");
        let result = self.rotate_locked(symbol, target_day, true);
        self.record_rotation(symbol, target_day, &result);
        result
    }

    /// Rotate every known symbol whose active partition is older than
    /// `target_day`.
    pub fn rotate_all(&self, target_day: NaiveDate) -> Vec<(Symbol, Result<RotationOutcome, StorageError>)> {
        let symbols = match self.layout.discover_symbols() {
            Ok(symbols) => symbols,
            Err(e) => {
                error!(error = %e, "Symbol discovery failed during scheduled rotation");
                return Vec::new();
            }
        };

        symbols
            .into_iter()
            .filter(|symbol| {
                Catalog::load(&self.layout.catalog_path(symbol), symbol)
                    .map(|catalog| catalog.active_day().is_some_and(|active| active < target_day))
                    .unwrap_or(true)
            })
            .map(|symbol| {
                let result = self.rotate(&symbol, target_day);
                (symbol, result)
            })
            .collect()
    }

    fn record_rotation(
        &self,
        symbol: &Symbol,
        target_day: NaiveDate,
        result: &Result<RotationOutcome, StorageError>,
    ) {
        match result {
            Ok(RotationOutcome::Rotated { .. }) => {
                self.metrics.rotations.fetch_add(1, Ordering::Relaxed);
                self.metrics.last_rotation_failed.store(false, Ordering::Relaxed);
            }
            Ok(RotationOutcome::Created { .. }) => {
                self.metrics.partitions_created.fetch_add(1, Ordering::Relaxed);
                self.metrics.last_rotation_failed.store(false, Ordering::Relaxed);
            }
            Ok(_) => {}
            Err(e) if e.is_lock_timeout() => {
                self.metrics.lock_timeouts.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.metrics.rotation_failures.fetch_add(1, Ordering::Relaxed);
                self.metrics.last_rotation_failed.store(true, Ordering::Relaxed);
                error!(symbol = %symbol, day = %target_day, error = %e, "Partition rotation failed");
            }
        }
    }

    fn rotate_locked(
        &self,
        symbol: &Symbol,
        target_day: NaiveDate,
        reopen: bool,
    ) -> Result<RotationOutcome, StorageError> {
        let started = Instant::now();
        let _lock = PartitionLock::acquire(&self.layout.lock_path(symbol), self.config.lock_timeout())?;
        let slot = self.slot(symbol);
        let mut guard = lock_slot(&slot);

        let catalog_path = self.layout.catalog_path(symbol);
        let mut catalog = Catalog::load(&catalog_path, symbol)?;
        let previous = catalog.active_day();

        if let Some(active) = previous {
            if active > target_day || (active == target_day && !reopen) {
                if guard.day != Some(active) || guard.writer.is_none() {
                    Self::close_writer(&mut guard)?;
                    *guard = self.attach(symbol, active)?;
                }
                debug!(symbol = %symbol, active = %active, "Partition already rotated");
                return Ok(RotationOutcome::AlreadyRotated { active });
            }

            if active == target_day {
                let degraded = guard.degraded && guard.day == Some(active);
                Self::close_writer(&mut guard)?;
                self.ensure_partition_file(symbol, active)?;
                *guard = self.attach(symbol, active)?;
                guard.degraded |= degraded;
                info!(symbol = %symbol, day = %active, "Active partition reopened");
                return Ok(RotationOutcome::Reopened { day: active });
            }

            // Seal the outgoing partition.
            let tracked = guard.day == Some(active);
            Self::close_writer(&mut guard)?;
            self.ensure_partition_file(symbol, active)?;
            let path = self.layout.partition_path(symbol, active);
            let (size_bytes, tick_count) = if tracked {
                (guard.bytes, guard.ticks)
            } else {
                let summary = record::scan(BufReader::new(File::open(&path)?))?;
                (summary.valid_len, summary.records)
            };
            let degraded = tracked && guard.degraded;

            if let Some(meta) = catalog.get_mut(active) {
                meta.state = PartitionState::Sealed;
                meta.sealed_at = Some(Utc::now());
                meta.size_bytes = size_bytes;
                meta.tick_count = tick_count;
                meta.degraded |= degraded;
            }
            *guard = WriterSlot::default();
        }

        // Pre-create the incoming partition before it becomes active.
        let symbol_dir = self.layout.symbol_dir(symbol);
        fs::create_dir_all(&symbol_dir)?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.layout.partition_path(symbol, target_day))?
            .sync_all()?;
        sync_dir(&symbol_dir)?;

        catalog.insert(PartitionMeta::active(target_day));
        catalog.store(&catalog_path)?;
        *guard = self.attach(symbol, target_day)?;

        let outcome = match previous {
            Some(from) => RotationOutcome::Rotated { from, to: target_day },
            None => RotationOutcome::Created { day: target_day },
        };
        info!(
            symbol = %symbol,
            from = ?previous,
            to = %target_day,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Partition rotated"
        );
        Ok(outcome)
    }

    /// Recreate a partition file that vanished underneath us.
    fn ensure_partition_file(&self, symbol: &Symbol, day: NaiveDate) -> Result<(), StorageError> {
        let path = self.layout.partition_path(symbol, day);
        if path.exists() {
            return Ok(());
        }
        warn!(symbol = %symbol, day = %day, path = %path.display(), "Active partition file missing; recreating");
        File::create(&path)?.sync_all()?;
        sync_dir(&self.layout.symbol_dir(symbol))?;
        self.metrics.partitions_recreated.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn close_writer(slot: &mut WriterSlot) -> Result<(), StorageError> {
        if let Some(mut writer) = slot.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Open `day` for appending after truncating any torn tail.
    ///
    /// A partition corrupt in the middle is never truncated: the file is
    /// moved aside intact, a fresh one takes its place and the slot comes
    /// back degraded.
    fn attach(&self, symbol: &Symbol, day: NaiveDate) -> Result<WriterSlot, StorageError> {
        let path = self.layout.partition_path(symbol, day);
        fs::create_dir_all(self.layout.symbol_dir(symbol))?;

        let mut degraded = false;
        if path.exists() {
            let summary = record::scan(BufReader::new(File::open(&path)?))?;
            if let Some(offset) = summary.corrupt_at {
                self.quarantine(symbol, day, offset)?;
                degraded = true;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let summary = record::scan(BufReader::new(File::open(&path)?))?;
        if summary.torn {
            let file_len = file.metadata()?.len();
            warn!(
                symbol = %symbol,
                day = %day,
                valid_len = summary.valid_len,
                file_len,
                "Truncating torn partition tail"
            );
            file.set_len(summary.valid_len)?;
            file.sync_all()?;
            self.metrics.torn_tails_repaired.fetch_add(1, Ordering::Relaxed);
        }

        Ok(WriterSlot {
            day: Some(day),
            writer: Some(BufWriter::new(file)),
            bytes: summary.valid_len,
            ticks: summary.records,
            degraded,
        })
    }

    fn quarantine(&self, symbol: &Symbol, day: NaiveDate, offset: u64) -> Result<(), StorageError> {
        let path = self.layout.partition_path(symbol, day);
        let target = self
            .layout
            .quarantine_path(symbol, day, Utc::now().timestamp_millis());
        fs::rename(&path, &target)?;
        sync_dir(&self.layout.symbol_dir(symbol))?;
        self.metrics.partitions_quarantined.fetch_add(1, Ordering::Relaxed);
        self.metrics.degraded_partitions.fetch_add(1, Ordering::Relaxed);
        error!(
            symbol = %symbol,
            day = %day,
            offset,
            quarantined = %target.display(),
            "Partition corrupt mid-file; moved aside and restarted empty"
        );
        Ok(())
    }

    fn recover_symbol(&self, symbol: &Symbol) -> Result<(), StorageError> {
        let _lock = PartitionLock::acquire(&self.layout.lock_path(symbol), self.config.lock_timeout())?;
        let catalog_path = self.layout.catalog_path(symbol);
        let mut catalog = Catalog::load(&catalog_path, symbol)?;

        // At most one partition may be active; keep the newest.
        let actives: Vec<NaiveDate> = catalog
            .in_state(PartitionState::Active)
            .map(|meta| meta.day)
            .collect();
        if let Some((newest, older)) = actives.split_last() {
            for day in older {
                warn!(symbol = %symbol, day = %day, active = %newest, "Sealing stale active partition");
                let path = self.layout.partition_path(symbol, *day);
                let summary = if path.exists() {
                    Some(record::scan(BufReader::new(File::open(&path)?))?)
                } else {
                    None
                };
                if let Some(meta) = catalog.get_mut(*day) {
                    meta.state = PartitionState::Sealed;
                    meta.sealed_at = Some(Utc::now());
                    if let Some(summary) = summary {
                        meta.size_bytes = summary.valid_len;
                        meta.tick_count = summary.records;
                    }
                }
            }
        }

        self.metrics
            .degraded_partitions
            .fetch_add(catalog.degraded_count() as u64, Ordering::Relaxed);

        if let Some(active) = catalog.active_day() {
            let slot = self.attach(symbol, active)?;
            if let Some(meta) = catalog.get_mut(active) {
                meta.size_bytes = slot.bytes;
                meta.tick_count = slot.ticks;
                meta.degraded |= slot.degraded;
            }
            debug!(symbol = %symbol, day = %active, ticks = slot.ticks, "Recovered active partition");
            self.slots.insert(symbol.clone(), Arc::new(Mutex::new(slot)));
        }

        catalog.store(&catalog_path)?;
        Ok(())
    }

    fn slot(&self, symbol: &Symbol) -> Arc<Mutex<WriterSlot>> {
        if let Some(slot) = self.slots.get(symbol) {
            return Arc::clone(slot.value());
        }
        Arc::clone(self.slots.entry(symbol.clone()).or_default().value())
    }

    // ── Flush / Shutdown ────────────────────────────────────────────

    /// Flush buffered appends for every symbol; `sync` adds an fsync.
    pub fn flush_all(&self, sync: bool) -> Result<(), StorageError> {
        let slots: Vec<(Symbol, Arc<Mutex<WriterSlot>>)> = self
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut first_error = None;
        for (symbol, slot) in slots {
            let mut guard = lock_slot(&slot);
            let Some(writer) = guard.writer.as_mut() else {
                continue;
            };
            let result = writer
                .flush()
                .and_then(|_| if sync { writer.get_ref().sync_all() } else { Ok(()) });
            if let Err(e) = result {
                guard.degraded = true;
                self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
                error!(symbol = %symbol, error = %e, "Partition flush failed");
                first_error.get_or_insert(StorageError::Io(e));
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Flush, fsync and record active partition sizes in the catalogs.
    pub fn close(&self) -> Result<(), StorageError> {
        let flushed = self.flush_all(true);

        let symbols: Vec<Symbol> = self.slots.iter().map(|entry| entry.key().clone()).collect();
        for symbol in symbols {
            let slot = self.slot(&symbol);
            let result = (|| -> Result<(), StorageError> {
                let _lock = PartitionLock::acquire(&self.layout.lock_path(&symbol), self.config.lock_timeout())?;
                let guard = lock_slot(&slot);
                let Some(day) = guard.day else {
                    return Ok(());
                };
                let path = self.layout.catalog_path(&symbol);
                let mut catalog = Catalog::load(&path, &symbol)?;
                if let Some(meta) = catalog.get_mut(day) {
                    meta.size_bytes = guard.bytes;
                    meta.tick_count = guard.ticks;
                    meta.degraded |= guard.degraded;
                }
                catalog.store(&path)?;
                Ok(())
            })();
            if let Err(e) = result {
                warn!(symbol = %symbol, error = %e, "Failed to record partition stats on close");
            }
        }

        info!("Storage closed");
        flushed
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub fn symbols(&self) -> Result<Vec<Symbol>, StorageError> {
        Ok(self.layout.discover_symbols()?)
    }

    pub fn catalog(&self, symbol: &Symbol) -> Result<Catalog, StorageError> {
        Ok(Catalog::load(&self.layout.catalog_path(symbol), symbol)?)
    }

    pub fn list_partitions(&self, symbol: &Symbol) -> Result<Vec<PartitionMeta>, StorageError> {
        Ok(self.catalog(symbol)?.partitions().cloned().collect())
    }

    /// Every tick stored for `symbol` on `day`, whatever its lifecycle state.
    pub fn read_partition(&self, symbol: &Symbol, day: NaiveDate) -> Result<Vec<Tick>, StorageError> {
        let not_found = || StorageError::PartitionNotFound {
            symbol: symbol.clone(),
            day,
        };
        let catalog = self.catalog(symbol)?;
        let meta = catalog.get(day).ok_or_else(not_found)?;

        let ticks = match meta.state {
            PartitionState::Active | PartitionState::Sealed => {
                if let Some(slot) = self.slots.get(symbol).map(|s| Arc::clone(s.value())) {
                    let mut guard = lock_slot(&slot);
                    if guard.day == Some(day) {
                        if let Some(writer) = guard.writer.as_mut() {
                            writer.flush()?;
                        }
                    }
                }
                let file = File::open(self.layout.partition_path(symbol, day))?;
                RecordReader::new(BufReader::new(file)).collect::<Result<Vec<_>, _>>()?
            }
            PartitionState::Compressed | PartitionState::Archived => {
                let path = if meta.state == PartitionState::Compressed {
                    self.layout.compressed_path(symbol, day)
                } else {
                    self.layout.archive_path(symbol, day)
                };
                let decoder = zstd::Decoder::new(File::open(path)?)?;
                RecordReader::new(decoder).collect::<Result<Vec<_>, _>>()?
            }
            PartitionState::Deleted => return Err(not_found()),
        };
        Ok(ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use market_types::time::{day_start_millis, MILLIS_PER_SECOND};
    use tempfile::TempDir;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, d).unwrap()
    }

    fn make_tick(symbol: &str, day: NaiveDate, second: i64) -> Tick {
        Tick {
            symbol: Symbol::new(symbol),
            bid: 1.0850,
            ask: 1.0852,
            timestamp: day_start_millis(day, 0) + second * MILLIS_PER_SECOND,
            volume: Some(1.0),
            source: "test".to_string(),
        }
    }

    fn open_store(tmp: &TempDir) -> StorageManager {
        StorageManager::open(StorageConfig::new(tmp.path()), Arc::new(PipelineMetrics::new())).unwrap()
    }

    #[test]
    fn test_first_append_creates_partition() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        let symbol = Symbol::new("EURUSD");

        let outcome = store.append(&make_tick("EURUSD", day(20), 1)).unwrap();
        assert_eq!(outcome, AppendOutcome::Appended);
        assert_eq!(store.active_day(&symbol), Some(day(20)));

        let catalog = store.catalog(&symbol).unwrap();
        assert_eq!(catalog.active_day(), Some(day(20)));
        assert!(store.layout().partition_path(&symbol, day(20)).exists());
    }

    #[test]
    fn test_append_then_read_back() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        let ticks: Vec<Tick> = (0..100).map(|s| make_tick("EURUSD", day(20), s)).collect();
        for tick in &ticks {
            store.append(tick).unwrap();
        }
        let read = store.read_partition(&Symbol::new("EURUSD"), day(20)).unwrap();
        assert_eq!(read, ticks);
    }

    #[test]
    fn test_next_day_tick_rotates() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        let symbol = Symbol::new("EURUSD");

        store.append(&make_tick("EURUSD", day(20), 5)).unwrap();
        store.append(&make_tick("EURUSD", day(20), 6)).unwrap();
        store.append(&make_tick("EURUSD", day(21), 1)).unwrap();

        let catalog = store.catalog(&symbol).unwrap();
        let sealed = catalog.get(day(20)).unwrap();
        assert_eq!(sealed.state, PartitionState::Sealed);
        assert_eq!(sealed.tick_count, 2);
        assert!(sealed.sealed_at.is_some());
        assert_eq!(catalog.active_day(), Some(day(21)));
        assert_eq!(catalog.active_count(), 1);
        assert_eq!(store.metrics.rotations.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_sealed_partition_refuses_writes() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        store.append(&make_tick("EURUSD", day(20), 5)).unwrap();
        store.append(&make_tick("EURUSD", day(21), 1)).unwrap();
        let result = store.append(&make_tick("EURUSD", day(20), 7));

        assert!(matches!(result, Err(StorageError::PartitionSealed { .. })));
        assert_eq!(store.metrics.sealed_partition_writes.load(Ordering::Relaxed), 1);
        assert_eq!(store.metrics.ticks_not_persisted.load(Ordering::Relaxed), 0);
        let sealed = store.read_partition(&Symbol::new("EURUSD"), day(20)).unwrap();
        assert_eq!(sealed.len(), 1);
    }

    #[test]
    fn test_rotation_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        let symbol = Symbol::new("EURUSD");
        store.append(&make_tick("EURUSD", day(20), 5)).unwrap();

        let first = store.rotate(&symbol, day(21)).unwrap();
        let second = store.rotate(&symbol, day(21)).unwrap();
        assert_eq!(first, RotationOutcome::Rotated { from: day(20), to: day(21) });
        assert_eq!(second, RotationOutcome::AlreadyRotated { active: day(21) });
        assert_eq!(store.catalog(&symbol).unwrap().active_count(), 1);
    }

    #[test]
    fn test_lock_timeout_falls_back_to_current_partition() {
        let tmp = TempDir::new().unwrap();
        let mut config = StorageConfig::new(tmp.path());
        config.lock_timeout_ms = 20;
        let store = StorageManager::open(config, Arc::new(PipelineMetrics::new())).unwrap();
        let symbol = Symbol::new("EURUSD");
        store.append(&make_tick("EURUSD", day(20), 5)).unwrap();

        let _held = PartitionLock::acquire(&store.layout().lock_path(&symbol), std::time::Duration::from_secs(1)).unwrap();
        let outcome = store.append(&make_tick("EURUSD", day(21), 1)).unwrap();

        assert_eq!(outcome, AppendOutcome::Fallback { active: day(20) });
        assert_eq!(store.metrics.lock_timeouts.load(Ordering::Relaxed), 1);
        assert_eq!(store.metrics.lock_fallback_writes.load(Ordering::Relaxed), 1);
        assert_eq!(store.read_partition(&symbol, day(20)).unwrap().len(), 2);
    }

    #[test]
    fn test_unwritable_first_tick_counted_as_not_persisted() {
        let tmp = TempDir::new().unwrap();
        let mut config = StorageConfig::new(tmp.path());
        config.lock_timeout_ms = 20;
        let store = StorageManager::open(config, Arc::new(PipelineMetrics::new())).unwrap();
        let symbol = Symbol::new("GBPUSD");

        let _held = PartitionLock::acquire(&store.layout().lock_path(&symbol), std::time::Duration::from_secs(1)).unwrap();
        let result = store.append(&make_tick("GBPUSD", day(20), 1));

        assert!(matches!(result, Err(StorageError::Unavailable { .. })));
        assert_eq!(store.metrics.ticks_not_persisted.load(Ordering::Relaxed), 1);
        assert_eq!(store.metrics.ticks_persisted.load(Ordering::Relaxed), 0);
        assert_eq!(store.metrics.snapshot().ticks_not_persisted, 1);
    }

    #[test]
    fn test_forced_rotation_into_far_future_refused() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        let symbol = Symbol::new("EURUSD");
        let today = store.partition_day(now_millis());
        store.force_rotate(&symbol, today).unwrap();

        let far = NaiveDate::from_ymd_opt(2099, 1, 1).unwrap();
        let result = store.force_rotate(&symbol, far);
        assert!(matches!(result, Err(StorageError::RotationTooFarAhead { .. })));
        assert_eq!(store.catalog(&symbol).unwrap().active_day(), Some(today));

        let tomorrow = today.succ_opt().unwrap();
        assert_eq!(
            store.force_rotate(&symbol, tomorrow).unwrap(),
            RotationOutcome::Rotated { from: today, to: tomorrow }
        );
    }

    #[test]
    fn test_missing_active_file_recreated_on_rotation() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        let symbol = Symbol::new("EURUSD");
        store.append(&make_tick("EURUSD", day(20), 5)).unwrap();
        store.flush_all(true).unwrap();

        fs::remove_file(store.layout().partition_path(&symbol, day(20))).unwrap();
        store.force_rotate(&symbol, day(20)).unwrap();

        assert!(store.layout().partition_path(&symbol, day(20)).exists());
        assert_eq!(store.metrics.partitions_recreated.load(Ordering::Relaxed), 1);
        store.append(&make_tick("EURUSD", day(20), 6)).unwrap();
        assert_eq!(store.read_partition(&symbol, day(20)).unwrap().len(), 1);
    }

    #[test]
    fn test_reopen_truncates_torn_tail() {
        let tmp = TempDir::new().unwrap();
        let symbol = Symbol::new("EURUSD");
        {
            let store = open_store(&tmp);
            for s in 0..10 {
                store.append(&make_tick("EURUSD", day(20), s)).unwrap();
            }
            store.close().unwrap();
        }

        let path = Layout::new(tmp.path()).partition_path(&symbol, day(20));
        let partial = record::encode(&make_tick("EURUSD", day(20), 10));
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&partial[..partial.len() - 3]).unwrap();
        drop(file);

        let store = open_store(&tmp);
        assert_eq!(store.metrics.torn_tails_repaired.load(Ordering::Relaxed), 1);
        store.append(&make_tick("EURUSD", day(20), 11)).unwrap();
        let ticks = store.read_partition(&symbol, day(20)).unwrap();
        assert_eq!(ticks.len(), 11);
    }

    #[test]
    fn test_mid_file_corruption_quarantined_not_truncated() {
        let tmp = TempDir::new().unwrap();
        let symbol = Symbol::new("EURUSD");
        {
            let store = open_store(&tmp);
            for s in 0..100 {
                store.append(&make_tick("EURUSD", day(20), s)).unwrap();
            }
            store.close().unwrap();
        }

        let layout = Layout::new(tmp.path());
        let path = layout.partition_path(&symbol, day(20));
        let mut bytes = fs::read(&path).unwrap();
        bytes[60] ^= 0x01; // inside the second record
        fs::write(&path, &bytes).unwrap();

        let store = open_store(&tmp);
        assert_eq!(store.metrics.partitions_quarantined.load(Ordering::Relaxed), 1);
        assert_eq!(store.metrics.torn_tails_repaired.load(Ordering::Relaxed), 0);

        let quarantined: Vec<_> = fs::read_dir(layout.symbol_dir(&symbol))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().contains(".corrupt-"))
            .collect();
        assert_eq!(quarantined.len(), 1);
        assert_eq!(fs::read(quarantined[0].path()).unwrap(), bytes);

        assert!(store.catalog(&symbol).unwrap().get(day(20)).unwrap().degraded);
        store.append(&make_tick("EURUSD", day(20), 200)).unwrap();
        assert_eq!(store.read_partition(&symbol, day(20)).unwrap().len(), 1);
    }

    #[test]
    fn test_close_records_active_stats() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        let symbol = Symbol::new("EURUSD");
        for s in 0..3 {
            store.append(&make_tick("EURUSD", day(20), s)).unwrap();
        }
        store.close().unwrap();

        let meta = store.catalog(&symbol).unwrap().get(day(20)).cloned().unwrap();
        assert_eq!(meta.tick_count, 3);
        assert!(meta.size_bytes > 0);
    }

    #[test]
    fn test_rotate_all_seals_idle_symbols() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        store.append(&make_tick("EURUSD", day(20), 1)).unwrap();
        store.append(&make_tick("GBPUSD", day(20), 1)).unwrap();
        store.append(&make_tick("USDJPY", day(21), 1)).unwrap();

        let results = store.rotate_all(day(21));
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| matches!(r, Ok(RotationOutcome::Rotated { .. }))));
        assert_eq!(
            store.catalog(&Symbol::new("GBPUSD")).unwrap().get(day(20)).unwrap().state,
            PartitionState::Sealed
        );
    }

    #[test]
    fn test_day_boundary_offset() {
        let tmp = TempDir::new().unwrap();
        let mut config = StorageConfig::new(tmp.path());
        config.day_boundary_offset_ms = 22 * 3_600_000;
        let store = StorageManager::open(config, Arc::new(PipelineMetrics::new())).unwrap();

        // 23:00 UTC on the 20th belongs to the trading day starting 22:00 on the 20th
        let ts = day_start_millis(day(20), 0) + 23 * 3_600_000;
        assert_eq!(store.partition_day(ts), day(20));
        let ts = day_start_millis(day(20), 0) + 21 * 3_600_000;
        assert_eq!(store.partition_day(ts), day(19));
    }
}
