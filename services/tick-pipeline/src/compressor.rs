//! Background compression, archival and retention
//!
//! A sweep walks every symbol's catalog and plans work by partition age:
//!
//! - sealed and older than `compress_after_days`: compress
//! - compressed and older than `archive_after_days`: move to the archive tier
//! - anything but active older than `retention_days`: delete
//!
//! Compression is verify-then-replace: the sealed partition's records are
//! checked, a zstd artifact is written to a temporary sibling, decompressed
//! and compared byte-for-byte (SHA-256 and length) against the original,
//! then renamed into place and recorded in the catalog. The original is
//! removed only after the catalog says `compressed`. Any failure leaves the
//! original untouched and removes the temporary artifact.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use market_types::ids::Symbol;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::metrics::PipelineMetrics;
use crate::storage::layout::sync_dir;
use crate::storage::record::{self, RecordError};
use crate::storage::{
    Catalog, CatalogError, LockError, PartitionLock, PartitionState, StorageError, StorageManager,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    /// Seconds between scheduled sweeps.
    pub interval_secs: u64,
    /// Run a sweep immediately at startup.
    pub run_on_start: bool,
    pub compress_after_days: i64,
    /// `None` keeps compressed partitions in the hot tier.
    pub archive_after_days: Option<i64>,
    /// `None` keeps partitions forever.
    pub retention_days: Option<i64>,
    /// Partitions processed in parallel.
    pub concurrency: usize,
    pub level: i32,
    /// Plan and report without touching any file.
    pub dry_run: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 7 * 24 * 3_600,
            run_on_start: false,
            compress_after_days: 7,
            archive_after_days: Some(30),
            retention_days: Some(180),
            concurrency: 4,
            level: 3,
            dry_run: false,
        }
    }
}

#[derive(Error, Debug)]
pub enum CompressError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("partition integrity check failed: {0}")]
    Integrity(#[from] RecordError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("artifact verification failed: original {original_len} bytes, round-trip {roundtrip_len} bytes, digest match {digest_match}")]
    VerificationFailed {
        original_len: u64,
        roundtrip_len: u64,
        digest_match: bool,
    },

    #[error("partition is {found:?}, cannot move to {target:?}")]
    StateChanged {
        found: PartitionState,
        target: PartitionState,
    },

    #[error("partition missing from catalog")]
    NotInCatalog,
}

// ── Codec ───────────────────────────────────────────────────────────

/// Stream codec used for partition artifacts.
pub trait Codec: Send + Sync {
    fn compress(&self, src: &mut dyn Read, dst: &mut dyn Write) -> io::Result<()>;
    fn decompress(&self, src: &mut dyn Read, dst: &mut dyn Write) -> io::Result<()>;
}

pub struct ZstdCodec {
    level: i32,
}

impl ZstdCodec {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Codec for ZstdCodec {
    fn compress(&self, src: &mut dyn Read, dst: &mut dyn Write) -> io::Result<()> {
        zstd::stream::copy_encode(src, dst, self.level)
    }

    fn decompress(&self, src: &mut dyn Read, dst: &mut dyn Write) -> io::Result<()> {
        zstd::stream::copy_decode(src, dst)
    }
}

/// Sink that hashes and counts everything written to it.
#[derive(Default)]
struct DigestWriter {
    hasher: Sha256,
    len: u64,
}

impl Write for DigestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.hasher.update(buf);
        self.len += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl DigestWriter {
    fn finish(self) -> (Vec<u8>, u64) {
        (self.hasher.finalize().to_vec(), self.len)
    }
}

fn digest_file(path: &Path) -> io::Result<(Vec<u8>, u64)> {
    let mut writer = DigestWriter::default();
    io::copy(&mut BufReader::new(File::open(path)?), &mut writer)?;
    Ok(writer.finish())
}

/// Removes a temporary file on drop unless disarmed.
struct TempArtifact {
    path: PathBuf,
    armed: bool,
}

impl TempArtifact {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "Failed to remove temporary artifact");
                }
            }
        }
    }
}

// ── Sweep Planning ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepAction {
    Compress,
    Archive,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepTask {
    pub symbol: Symbol,
    pub day: NaiveDate,
    pub action: SweepAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepFailure {
    pub symbol: Symbol,
    pub day: NaiveDate,
    pub action: SweepAction,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub planned: Vec<SweepTask>,
    pub compressed: usize,
    pub archived: usize,
    pub deleted: usize,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub failures: Vec<SweepFailure>,
}

impl SweepReport {
    fn new(started_at: DateTime<Utc>, dry_run: bool, planned: Vec<SweepTask>) -> Self {
        Self {
            started_at,
            finished_at: started_at,
            dry_run,
            planned,
            compressed: 0,
            archived: 0,
            deleted: 0,
            bytes_in: 0,
            bytes_out: 0,
            failures: Vec::new(),
        }
    }
}

enum TaskResult {
    Compressed { bytes_in: u64, bytes_out: u64 },
    Archived,
    Deleted,
}

// ── Compressor ──────────────────────────────────────────────────────

pub struct Compressor {
    storage: Arc<StorageManager>,
    config: CompressionConfig,
    codec: Arc<dyn Codec>,
    metrics: Arc<PipelineMetrics>,
    last_report: Mutex<Option<SweepReport>>,
    sweep_gate: tokio::sync::Mutex<()>,
}

impl Compressor {
    pub fn new(storage: Arc<StorageManager>, config: CompressionConfig, metrics: Arc<PipelineMetrics>) -> Self {
        let codec = Arc::new(ZstdCodec::new(config.level));
        Self::with_codec(storage, config, metrics, codec)
    }

    pub fn with_codec(
        storage: Arc<StorageManager>,
        config: CompressionConfig,
        metrics: Arc<PipelineMetrics>,
        codec: Arc<dyn Codec>,
    ) -> Self {
        Self {
            storage,
            config,
            codec,
            metrics,
            last_report: Mutex::new(None),
            sweep_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    pub fn last_report(&self) -> Option<SweepReport> {
        self.last_report.lock().ok().and_then(|report| report.clone())
    }

    /// Work due at `now`, oldest partitions first.
    pub fn plan(&self, now: DateTime<Utc>) -> Result<Vec<SweepTask>, StorageError> {
        let today = self.storage.partition_day(now.timestamp_millis());
        let mut tasks = Vec::new();

        for symbol in self.storage.symbols()? {
            let catalog = match self.storage.catalog(&symbol) {
                Ok(catalog) => catalog,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Skipping symbol with unreadable catalog");
                    continue;
                }
            };
            for meta in catalog.partitions() {
                let age = (today - meta.day).num_days();
                let action = match meta.state {
                    PartitionState::Active | PartitionState::Deleted => None,
                    _ if self.config.retention_days.is_some_and(|days| age >= days) => {
                        Some(SweepAction::Delete)
                    }
                    PartitionState::Compressed
                        if self.config.archive_after_days.is_some_and(|days| age >= days) =>
                    {
                        Some(SweepAction::Archive)
                    }
                    PartitionState::Sealed if age >= self.config.compress_after_days => {
                        Some(SweepAction::Compress)
                    }
                    _ => None,
                };
                if let Some(action) = action {
                    tasks.push(SweepTask {
                        symbol: symbol.clone(),
                        day: meta.day,
                        action,
                    });
                }
            }
        }

        tasks.sort_by(|a, b| a.day.cmp(&b.day).then_with(|| a.symbol.cmp(&b.symbol)));
        Ok(tasks)
    }

    /// Run one sweep against the current wall clock.
    pub async fn sweep(&self) -> Result<SweepReport, StorageError> {
        self.sweep_at(Utc::now()).await
    }

    /// Run one sweep as if the time were `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, StorageError> {
        let _gate = self.sweep_gate.lock().await;
        let started_at = Utc::now();
        let planned = self.plan(now)?;
        let mut report = SweepReport::new(started_at, self.config.dry_run, planned.clone());

        info!(
            tasks = planned.len(),
            dry_run = self.config.dry_run,
            concurrency = self.config.concurrency,
            "Compression sweep started"
        );

        if !self.config.dry_run {
            let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
            let mut set = JoinSet::new();

            for task in planned {
                let semaphore = Arc::clone(&semaphore);
                let storage = Arc::clone(&self.storage);
                let codec = Arc::clone(&self.codec);
                set.spawn(async move {
                    let result = match semaphore.acquire_owned().await {
                        Ok(_permit) => {
                            let task = task.clone();
                            tokio::task::spawn_blocking(move || execute(&storage, codec.as_ref(), &task))
                                .await
                                .unwrap_or_else(|e| Err(CompressError::Io(io::Error::other(e))))
                        }
                        Err(e) => Err(CompressError::Io(io::Error::other(e))),
                    };
                    (task, result)
                });
            }

            while let Some(joined) = set.join_next().await {
                let Ok((task, result)) = joined else {
                    continue;
                };
                self.account(&mut report, task, result);
            }
        }

        report.finished_at = Utc::now();
        self.metrics.sweeps_completed.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .last_sweep_failed
            .store(!report.failures.is_empty(), Ordering::Relaxed);

        info!(
            compressed = report.compressed,
            archived = report.archived,
            deleted = report.deleted,
            failures = report.failures.len(),
            bytes_in = report.bytes_in,
            bytes_out = report.bytes_out,
            "Compression sweep finished"
        );

        if let Ok(mut last) = self.last_report.lock() {
            *last = Some(report.clone());
        }
        Ok(report)
    }

    fn account(&self, report: &mut SweepReport, task: SweepTask, result: Result<TaskResult, CompressError>) {
        match result {
            Ok(TaskResult::Compressed { bytes_in, bytes_out }) => {
                report.compressed += 1;
                report.bytes_in += bytes_in;
                report.bytes_out += bytes_out;
                self.metrics.partitions_compressed.fetch_add(1, Ordering::Relaxed);
                self.metrics.compression_bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
                self.metrics.compression_bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
            }
            Ok(TaskResult::Archived) => {
                report.archived += 1;
                self.metrics.partitions_archived.fetch_add(1, Ordering::Relaxed);
            }
            Ok(TaskResult::Deleted) => {
                report.deleted += 1;
                self.metrics.partitions_deleted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                if task.action == SweepAction::Compress {
                    self.metrics.compression_failures.fetch_add(1, Ordering::Relaxed);
                }
                error!(
                    symbol = %task.symbol,
                    day = %task.day,
                    action = ?task.action,
                    error = %e,
                    "Sweep task failed"
                );
                report.failures.push(SweepFailure {
                    symbol: task.symbol,
                    day: task.day,
                    action: task.action,
                    error: e.to_string(),
                });
            }
        }
    }

    /// Sweep on the configured schedule until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("Compression disabled");
            return;
        }

        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
        if !self.config.run_on_start {
            ticker.tick().await;
        }

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Compression sweep could not run");
                        self.metrics.last_sweep_failed.store(true, Ordering::Relaxed);
                    }
                }
                _ = shutdown.changed() => {
                    debug!("Compressor stopping");
                    break;
                }
            }
        }
    }
}

// ── Task Execution ──────────────────────────────────────────────────

fn execute(storage: &StorageManager, codec: &dyn Codec, task: &SweepTask) -> Result<TaskResult, CompressError> {
    match task.action {
        SweepAction::Compress => compress_partition(storage, codec, &task.symbol, task.day),
        SweepAction::Archive => archive_partition(storage, &task.symbol, task.day).map(|_| TaskResult::Archived),
        SweepAction::Delete => delete_partition(storage, &task.symbol, task.day).map(|_| TaskResult::Deleted),
    }
}

/// Load the catalog under the partition lock and check `day` may move from
/// one of `from` to `to`.
fn locked_catalog(
    storage: &StorageManager,
    symbol: &Symbol,
    day: NaiveDate,
    from: &[PartitionState],
    to: PartitionState,
) -> Result<(PartitionLock, Catalog), CompressError> {
    let lock = PartitionLock::acquire(&storage.layout().lock_path(symbol), storage.config().lock_timeout())?;
    let catalog = storage.catalog(symbol)?;
    let meta = catalog.get(day).ok_or(CompressError::NotInCatalog)?;
    if !from.contains(&meta.state) || !meta.state.can_advance_to(to) {
        return Err(CompressError::StateChanged {
            found: meta.state,
            target: to,
        });
    }
    Ok((lock, catalog))
}

fn compress_partition(
    storage: &StorageManager,
    codec: &dyn Codec,
    symbol: &Symbol,
    day: NaiveDate,
) -> Result<TaskResult, CompressError> {
    let layout = storage.layout();
    let original = layout.partition_path(symbol, day);
    let target = layout.compressed_path(symbol, day);
    let tmp_path = layout.compressed_temp_path(symbol, day);

    // 1. every record intact
    let records = record::verify(BufReader::new(File::open(&original)?))?;
    let (original_digest, original_len) = digest_file(&original)?;

    // 2. compress into a temporary sibling
    let mut artifact = TempArtifact::new(tmp_path.clone());
    {
        let mut src = BufReader::new(File::open(&original)?);
        let mut dst = BufWriter::new(File::create(&tmp_path)?);
        codec.compress(&mut src, &mut dst)?;
        let file = dst.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
    }
    let compressed_len = fs::metadata(&tmp_path)?.len();

    // 3. decompress and compare against the original
    let mut roundtrip = DigestWriter::default();
    codec.decompress(&mut BufReader::new(File::open(&tmp_path)?), &mut roundtrip)?;
    let (roundtrip_digest, roundtrip_len) = roundtrip.finish();
    if roundtrip_len != original_len || roundtrip_digest != original_digest {
        return Err(CompressError::VerificationFailed {
            original_len,
            roundtrip_len,
            digest_match: roundtrip_digest == original_digest,
        });
    }

    // 4. publish under the partition lock
    let (_lock, mut catalog) = locked_catalog(
        storage,
        symbol,
        day,
        &[PartitionState::Sealed],
        PartitionState::Compressed,
    )?;
    fs::rename(&tmp_path, &target)?;
    artifact.disarm();
    sync_dir(&layout.symbol_dir(symbol))?;

    if let Some(meta) = catalog.get_mut(day) {
        meta.state = PartitionState::Compressed;
        meta.size_bytes = original_len;
        meta.tick_count = records;
        meta.compressed_bytes = Some(compressed_len);
    }
    catalog.store(&layout.catalog_path(symbol))?;

    // 5. the catalog now points at the artifact; the original can go
    if let Err(e) = fs::remove_file(&original) {
        warn!(symbol = %symbol, day = %day, error = %e, "Compressed partition original not removed");
    }

    debug!(
        symbol = %symbol,
        day = %day,
        records,
        original_len,
        compressed_len,
        "Partition compressed"
    );
    Ok(TaskResult::Compressed {
        bytes_in: original_len,
        bytes_out: compressed_len,
    })
}

fn archive_partition(storage: &StorageManager, symbol: &Symbol, day: NaiveDate) -> Result<(), CompressError> {
    let layout = storage.layout();
    let (_lock, mut catalog) = locked_catalog(
        storage,
        symbol,
        day,
        &[PartitionState::Compressed],
        PartitionState::Archived,
    )?;

    let source = layout.compressed_path(symbol, day);
    let dest = layout.archive_path(symbol, day);
    let dest_dir = dest.parent().map(Path::to_path_buf).unwrap_or_else(|| layout.archive_dir());
    fs::create_dir_all(&dest_dir)?;

    if fs::rename(&source, &dest).is_err() {
        // Archive tier may live on another filesystem.
        fs::copy(&source, &dest)?;
        File::open(&dest)?.sync_all()?;
        fs::remove_file(&source)?;
    }
    sync_dir(&dest_dir)?;

    if let Some(meta) = catalog.get_mut(day) {
        meta.state = PartitionState::Archived;
    }
    catalog.store(&layout.catalog_path(symbol))?;
    debug!(symbol = %symbol, day = %day, "Partition archived");
    Ok(())
}

fn delete_partition(storage: &StorageManager, symbol: &Symbol, day: NaiveDate) -> Result<(), CompressError> {
    let layout = storage.layout();
    let (_lock, mut catalog) = locked_catalog(
        storage,
        symbol,
        day,
        &[PartitionState::Sealed, PartitionState::Compressed, PartitionState::Archived],
        PartitionState::Deleted,
    )?;

    for path in [
        layout.partition_path(symbol, day),
        layout.compressed_path(symbol, day),
        layout.archive_path(symbol, day),
    ] {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    if let Some(meta) = catalog.get_mut(day) {
        meta.state = PartitionState::Deleted;
    }
    catalog.store(&layout.catalog_path(symbol))?;
    info!(symbol = %symbol, day = %day, "Partition deleted by retention");
    Ok(())
}
