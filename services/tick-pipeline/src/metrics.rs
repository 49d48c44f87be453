//! Pipeline counters and latency tracking
//!
//! Every stage reports into a shared `PipelineMetrics`. Counters are plain
//! atomics; latency samples live in bounded windows behind a mutex.
//! `snapshot()` produces the serializable view served by `/stats`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use market_types::errors::RejectReason;
use serde::Serialize;

/// Pipeline stage a latency sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Submit to dequeue: validation plus queue wait.
    Ingest,
    Aggregate,
    Storage,
    Distribute,
}

impl Stage {
    pub fn all() -> [Stage; 4] {
        [Stage::Ingest, Stage::Aggregate, Stage::Storage, Stage::Distribute]
    }
}

const LATENCY_WINDOW: usize = 2_048;

/// Shared metrics registry for one pipeline instance.
pub struct PipelineMetrics {
    // Ingestion
    pub ticks_received: AtomicU64,
    pub ticks_accepted: AtomicU64,
    pub ticks_processed: AtomicU64,
    /// Accepted ticks still queued when shutdown gave up waiting.
    pub ticks_abandoned: AtomicU64,
    rejected_by_reason: DashMap<&'static str, AtomicU64>,
    pub price_spikes: AtomicU64,

    // Aggregation
    pub bars_closed: AtomicU64,
    pub late_bar_ticks: AtomicU64,
    pub timeframe_switches: AtomicU64,

    // Storage
    pub ticks_persisted: AtomicU64,
    pub bytes_written: AtomicU64,
    pub storage_errors: AtomicU64,
    pub sealed_partition_writes: AtomicU64,
    pub partitions_created: AtomicU64,
    pub rotations: AtomicU64,
    pub rotation_failures: AtomicU64,
    pub lock_timeouts: AtomicU64,
    pub lock_fallback_writes: AtomicU64,
    pub partitions_recreated: AtomicU64,
    pub degraded_partitions: AtomicU64,
    pub torn_tails_repaired: AtomicU64,
    pub partitions_quarantined: AtomicU64,
    /// Accepted ticks that never reached a partition (sealed-day refusals
    /// are counted separately).
    pub ticks_not_persisted: AtomicU64,
    pub last_rotation_failed: AtomicBool,

    // Compression
    pub partitions_compressed: AtomicU64,
    pub compression_failures: AtomicU64,
    pub compression_bytes_in: AtomicU64,
    pub compression_bytes_out: AtomicU64,
    pub partitions_archived: AtomicU64,
    pub partitions_deleted: AtomicU64,
    pub sweeps_completed: AtomicU64,
    pub last_sweep_failed: AtomicBool,

    // Distribution
    pub events_published: AtomicU64,
    pub events_delivered: AtomicU64,
    pub subscriber_drops: AtomicU64,
    pub subscribers_disconnected: AtomicU64,
    pub out_of_order_suppressed: AtomicU64,
    pub sink_failures: AtomicU64,
    pub active_subscribers: AtomicU64,

    latency: BTreeMap<Stage, Mutex<LatencyTracker>>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            ticks_received: AtomicU64::new(0),
            ticks_accepted: AtomicU64::new(0),
            ticks_processed: AtomicU64::new(0),
            ticks_abandoned: AtomicU64::new(0),
            rejected_by_reason: DashMap::new(),
            price_spikes: AtomicU64::new(0),
            bars_closed: AtomicU64::new(0),
            late_bar_ticks: AtomicU64::new(0),
            timeframe_switches: AtomicU64::new(0),
            ticks_persisted: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            storage_errors: AtomicU64::new(0),
            sealed_partition_writes: AtomicU64::new(0),
            partitions_created: AtomicU64::new(0),
            rotations: AtomicU64::new(0),
            rotation_failures: AtomicU64::new(0),
            lock_timeouts: AtomicU64::new(0),
            lock_fallback_writes: AtomicU64::new(0),
            partitions_recreated: AtomicU64::new(0),
            degraded_partitions: AtomicU64::new(0),
            torn_tails_repaired: AtomicU64::new(0),
            partitions_quarantined: AtomicU64::new(0),
            ticks_not_persisted: AtomicU64::new(0),
            last_rotation_failed: AtomicBool::new(false),
            partitions_compressed: AtomicU64::new(0),
            compression_failures: AtomicU64::new(0),
            compression_bytes_in: AtomicU64::new(0),
            compression_bytes_out: AtomicU64::new(0),
            partitions_archived: AtomicU64::new(0),
            partitions_deleted: AtomicU64::new(0),
            sweeps_completed: AtomicU64::new(0),
            last_sweep_failed: AtomicBool::new(false),
            events_published: AtomicU64::new(0),
            events_delivered: AtomicU64::new(0),
            subscriber_drops: AtomicU64::new(0),
            subscribers_disconnected: AtomicU64::new(0),
            out_of_order_suppressed: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
            active_subscribers: AtomicU64::new(0),
            latency: Stage::all()
                .into_iter()
                .map(|stage| (stage, Mutex::new(LatencyTracker::new(LATENCY_WINDOW))))
                .collect(),
        }
    }

    /// Count a rejected tick under its reason label.
    pub fn record_rejection(&self, reason: RejectReason) {
        self.rejected_by_reason
            .entry(reason.label())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejections(&self, reason: RejectReason) -> u64 {
        self.rejected_by_reason
            .get(reason.label())
            .map(|count| count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn total_rejections(&self) -> u64 {
        self.rejected_by_reason
            .iter()
            .map(|entry| entry.value().load(Ordering::Relaxed))
            .sum()
    }

    /// Ticks dropped for flow-control reasons (queue full, shutdown).
    pub fn flow_control_drops(&self) -> u64 {
        self.rejections(RejectReason::QueueFull) + self.rejections(RejectReason::ShuttingDown)
    }

    /// Every tick or event lost after submission: flow control, slow
    /// subscribers, failed persistence and ticks abandoned at shutdown.
    pub fn total_drops(&self) -> u64 {
        self.flow_control_drops()
            + self.subscriber_drops.load(Ordering::Relaxed)
            + self.ticks_not_persisted.load(Ordering::Relaxed)
            + self.ticks_abandoned.load(Ordering::Relaxed)
    }

    /// Record one latency sample for `stage`.
    pub fn record_latency(&self, stage: Stage, elapsed: Duration) {
        if let Some(tracker) = self.latency.get(&stage) {
            if let Ok(mut tracker) = tracker.lock() {
                tracker.record(elapsed.as_micros() as u64);
            }
        }
    }

    pub fn latency_summary(&self, stage: Stage) -> LatencySummary {
        self.latency
            .get(&stage)
            .and_then(|tracker| tracker.lock().ok().map(|t| t.summary()))
            .unwrap_or_default()
    }

    /// Bytes saved by compression so far.
    pub fn bytes_saved(&self) -> u64 {
        self.compression_bytes_in
            .load(Ordering::Relaxed)
            .saturating_sub(self.compression_bytes_out.load(Ordering::Relaxed))
    }

    /// Original / compressed size over every compressed partition.
    pub fn compression_ratio(&self) -> Option<f64> {
        let bytes_in = self.compression_bytes_in.load(Ordering::Relaxed);
        let bytes_out = self.compression_bytes_out.load(Ordering::Relaxed);
        if bytes_out == 0 {
            None
        } else {
            Some(bytes_in as f64 / bytes_out as f64)
        }
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let rejected = self
            .rejected_by_reason
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().load(Ordering::Relaxed)))
            .collect();
        let latency_us = Stage::all()
            .into_iter()
            .map(|stage| (stage, self.latency_summary(stage)))
            .collect();

        MetricsSnapshot {
            ticks_received: load(&self.ticks_received),
            ticks_accepted: load(&self.ticks_accepted),
            ticks_processed: load(&self.ticks_processed),
            ticks_abandoned: load(&self.ticks_abandoned),
            rejected,
            price_spikes: load(&self.price_spikes),
            bars_closed: load(&self.bars_closed),
            late_bar_ticks: load(&self.late_bar_ticks),
            ticks_persisted: load(&self.ticks_persisted),
            bytes_written: load(&self.bytes_written),
            storage_errors: load(&self.storage_errors),
            ticks_not_persisted: load(&self.ticks_not_persisted),
            sealed_partition_writes: load(&self.sealed_partition_writes),
            rotations: load(&self.rotations),
            rotation_failures: load(&self.rotation_failures),
            lock_timeouts: load(&self.lock_timeouts),
            lock_fallback_writes: load(&self.lock_fallback_writes),
            degraded_partitions: load(&self.degraded_partitions),
            torn_tails_repaired: load(&self.torn_tails_repaired),
            partitions_quarantined: load(&self.partitions_quarantined),
            partitions_compressed: load(&self.partitions_compressed),
            compression_failures: load(&self.compression_failures),
            compression_ratio: self.compression_ratio(),
            bytes_saved: self.bytes_saved(),
            partitions_archived: load(&self.partitions_archived),
            partitions_deleted: load(&self.partitions_deleted),
            events_published: load(&self.events_published),
            events_delivered: load(&self.events_delivered),
            subscriber_drops: load(&self.subscriber_drops),
            subscribers_disconnected: load(&self.subscribers_disconnected),
            out_of_order_suppressed: load(&self.out_of_order_suppressed),
            active_subscribers: load(&self.active_subscribers),
            latency_us,
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable view of [`PipelineMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub ticks_received: u64,
    pub ticks_accepted: u64,
    pub ticks_processed: u64,
    pub ticks_abandoned: u64,
    pub rejected: BTreeMap<String, u64>,
    pub price_spikes: u64,
    pub bars_closed: u64,
    pub late_bar_ticks: u64,
    pub ticks_persisted: u64,
    pub bytes_written: u64,
    pub storage_errors: u64,
    pub ticks_not_persisted: u64,
    pub sealed_partition_writes: u64,
    pub rotations: u64,
    pub rotation_failures: u64,
    pub lock_timeouts: u64,
    pub lock_fallback_writes: u64,
    pub degraded_partitions: u64,
    pub torn_tails_repaired: u64,
    pub partitions_quarantined: u64,
    pub partitions_compressed: u64,
    pub compression_failures: u64,
    pub compression_ratio: Option<f64>,
    pub bytes_saved: u64,
    pub partitions_archived: u64,
    pub partitions_deleted: u64,
    pub events_published: u64,
    pub events_delivered: u64,
    pub subscriber_drops: u64,
    pub subscribers_disconnected: u64,
    pub out_of_order_suppressed: u64,
    pub active_subscribers: u64,
    pub latency_us: BTreeMap<Stage, LatencySummary>,
}

/// Tracks latency samples for percentile calculation.
pub struct LatencyTracker {
    samples: VecDeque<u64>,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples: max_samples.max(1),
        }
    }

    /// Record a latency sample.
    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Get a percentile value (0-100).
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (p as f64 / 100.0 * (sorted.len() - 1) as f64) as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }

    /// Average latency.
    pub fn average(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: u64 = self.samples.iter().sum();
        Some(sum / self.samples.len() as u64)
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }

    pub fn summary(&self) -> LatencySummary {
        LatencySummary {
            samples: self.count(),
            avg: self.average(),
            p99: self.percentile(99),
        }
    }
}

/// Average and tail latency over the sample window, in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LatencySummary {
    pub samples: usize,
    pub avg: Option<u64>,
    pub p99: Option<u64>,
}
