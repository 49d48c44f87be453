//! Pipeline health monitoring
//!
//! The monitor samples [`PipelineMetrics`] once per interval, derives
//! windowed rates (throughput, drop rate), tracks per-symbol feed freshness
//! and raises alerts on transitions. `health()` folds all of it into a single
//! verdict for `/health`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use market_types::ids::Symbol;
use market_types::time::now_millis;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::metrics::{LatencySummary, PipelineMetrics, Stage};

/// A feed silent for this many stale thresholds is dead.
const DEAD_MULTIPLIER: i64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Evaluation interval; rates are computed over this window.
    pub interval_ms: u64,
    /// A symbol with no tick for this long is stale.
    pub stale_after_ms: i64,
    /// Lost ticks and events per received tick above which health degrades.
    pub max_drop_rate: f64,
    /// Bound on retained alerts; oldest evicted first.
    pub max_alerts: usize,
    /// Alert when any stage's p99 latency exceeds this many microseconds.
    pub max_stage_p99_us: Option<u64>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            stale_after_ms: 30_000,
            max_drop_rate: 0.01,
            max_alerts: 1_000,
            max_stage_p99_us: None,
        }
    }
}

// ── Verdicts ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    Live,
    Stale,
    Dead,
}

/// Classify a feed by the age of its last tick.
pub fn feed_status(age_ms: i64, stale_after_ms: i64) -> FeedStatus {
    if age_ms >= stale_after_ms.saturating_mul(DEAD_MULTIPLIER) {
        FeedStatus::Dead
    } else if age_ms >= stale_after_ms {
        FeedStatus::Stale
    } else {
        FeedStatus::Live
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedHealth {
    pub symbol: Symbol,
    pub status: FeedStatus,
    pub last_tick_at: i64,
    pub age_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub timestamp: i64,
    pub level: AlertLevel,
    pub component: &'static str,
    pub message: String,
}

/// Health verdict with the evidence behind it.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checked_at: i64,
    /// Reasons the status is not `healthy`.
    pub reasons: Vec<String>,
    pub throughput_tps: f64,
    pub drop_rate: f64,
    pub latency_us: BTreeMap<Stage, LatencySummary>,
    pub bytes_saved: u64,
    pub compression_ratio: Option<f64>,
    pub degraded_partitions: u64,
    pub last_sweep_failed: bool,
    pub last_rotation_failed: bool,
    pub feeds: Vec<FeedHealth>,
}

// ── Monitor ─────────────────────────────────────────────────────────

/// Counter values at the previous evaluation, and the rates derived from them.
#[derive(Debug, Default, Clone)]
struct Window {
    at_ms: Option<i64>,
    received: u64,
    processed: u64,
    dropped: u64,
    storage_errors: u64,
    price_spikes: u64,
    throughput_tps: f64,
    drop_rate: f64,
    processed_in_window: u64,
    storage_errors_in_window: u64,
}

pub struct Monitor {
    config: MonitorConfig,
    metrics: Arc<PipelineMetrics>,
    last_tick: DashMap<Symbol, AtomicU64>,
    feed_states: DashMap<Symbol, FeedStatus>,
    alerts: Mutex<VecDeque<Alert>>,
    window: Mutex<Window>,
}

impl Monitor {
    pub fn new(config: MonitorConfig, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            config,
            metrics,
            last_tick: DashMap::new(),
            feed_states: DashMap::new(),
            alerts: Mutex::new(VecDeque::new()),
            window: Mutex::new(Window::default()),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Note that `symbol` delivered a tick at `now_ms` (wall clock).
    pub fn record_tick(&self, symbol: &Symbol, now_ms: i64) {
        let now = now_ms.max(0) as u64;
        if let Some(last) = self.last_tick.get(symbol) {
            last.fetch_max(now, Ordering::Relaxed);
            return;
        }
        self.last_tick
            .entry(symbol.clone())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_max(now, Ordering::Relaxed);
    }

    pub fn feeds(&self, now_ms: i64) -> Vec<FeedHealth> {
        let mut feeds: Vec<FeedHealth> = self
            .last_tick
            .iter()
            .map(|entry| {
                let last_tick_at = entry.value().load(Ordering::Relaxed) as i64;
                let age_ms = (now_ms - last_tick_at).max(0);
                FeedHealth {
                    symbol: entry.key().clone(),
                    status: feed_status(age_ms, self.config.stale_after_ms),
                    last_tick_at,
                    age_ms,
                }
            })
            .collect();
        feeds.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        feeds
    }

    /// Most recent alerts, oldest first.
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .map(|alerts| alerts.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn raise(&self, now_ms: i64, level: AlertLevel, component: &'static str, message: String) {
        match level {
            AlertLevel::Warning => warn!(component, %message, "Alert raised"),
            AlertLevel::Critical => error!(component, %message, "Alert raised"),
        }
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push_back(Alert {
                timestamp: now_ms,
                level,
                component,
                message,
            });
            while alerts.len() > self.config.max_alerts {
                alerts.pop_front();
            }
        }
    }

    /// Close the current window: update rates, raise alerts, return health.
    pub fn evaluate(&self, now_ms: i64) -> HealthReport {
        let received = self.metrics.ticks_received.load(Ordering::Relaxed);
        let processed = self.metrics.ticks_processed.load(Ordering::Relaxed);
        let dropped = self.metrics.total_drops();
        let storage_errors = self.metrics.storage_errors.load(Ordering::Relaxed);
        let price_spikes = self.metrics.price_spikes.load(Ordering::Relaxed);

        let previous = self.window.lock().map(|w| w.clone()).unwrap_or_default();
        let elapsed_ms = previous.at_ms.map(|at| now_ms - at).filter(|ms| *ms > 0);

        let received_delta = received.saturating_sub(previous.received);
        let processed_delta = processed.saturating_sub(previous.processed);
        let dropped_delta = dropped.saturating_sub(previous.dropped);
        let errors_delta = storage_errors.saturating_sub(previous.storage_errors);
        let spikes_delta = price_spikes.saturating_sub(previous.price_spikes);

        let throughput_tps = match elapsed_ms {
            Some(ms) => processed_delta as f64 * 1_000.0 / ms as f64,
            None => 0.0,
        };
        let drop_rate = if received_delta == 0 {
            0.0
        } else {
            dropped_delta as f64 / received_delta as f64
        };

        let next = Window {
            at_ms: Some(now_ms),
            received,
            processed,
            dropped,
            storage_errors,
            price_spikes,
            throughput_tps,
            drop_rate,
            processed_in_window: processed_delta,
            storage_errors_in_window: errors_delta,
        };
        if let Ok(mut window) = self.window.lock() {
            *window = next;
        }

        if drop_rate > self.config.max_drop_rate {
            self.raise(
                now_ms,
                AlertLevel::Warning,
                "ingestion",
                format!("drop rate {:.2}% over the last interval", drop_rate * 100.0),
            );
        }
        if errors_delta > 0 {
            self.raise(
                now_ms,
                AlertLevel::Critical,
                "storage",
                format!("{errors_delta} storage errors over the last interval"),
            );
        }
        if spikes_delta > 0 {
            self.raise(
                now_ms,
                AlertLevel::Warning,
                "ingestion",
                format!("{spikes_delta} abnormal price moves over the last interval"),
            );
        }
        if let Some(limit) = self.config.max_stage_p99_us {
            for stage in Stage::all() {
                if let Some(p99) = self.metrics.latency_summary(stage).p99.filter(|p99| *p99 > limit) {
                    self.raise(
                        now_ms,
                        AlertLevel::Warning,
                        "latency",
                        format!("{stage:?} p99 latency {p99}us exceeds {limit}us"),
                    );
                }
            }
        }

        for feed in self.feeds(now_ms) {
            let previous = self.feed_states.insert(feed.symbol.clone(), feed.status);
            if previous.is_some_and(|status| status == feed.status) {
                continue;
            }
            match feed.status {
                FeedStatus::Stale => self.raise(
                    now_ms,
                    AlertLevel::Warning,
                    "feed",
                    format!("{} silent for {} ms", feed.symbol, feed.age_ms),
                ),
                FeedStatus::Dead => self.raise(
                    now_ms,
                    AlertLevel::Critical,
                    "feed",
                    format!("{} dead, silent for {} ms", feed.symbol, feed.age_ms),
                ),
                FeedStatus::Live => {
                    if previous.is_some() {
                        debug!(symbol = %feed.symbol, "Feed recovered");
                    }
                }
            }
        }

        self.health(now_ms)
    }

    /// Verdict from the last closed window and the current feed ages.
    pub fn health(&self, now_ms: i64) -> HealthReport {
        let window = self.window.lock().map(|w| w.clone()).unwrap_or_default();
        let feeds = self.feeds(now_ms);
        let degraded_partitions = self.metrics.degraded_partitions.load(Ordering::Relaxed);
        let last_sweep_failed = self.metrics.last_sweep_failed.load(Ordering::Relaxed);
        let last_rotation_failed = self.metrics.last_rotation_failed.load(Ordering::Relaxed);

        let mut unhealthy = Vec::new();
        let mut degraded = Vec::new();

        let dead: Vec<String> = feeds
            .iter()
            .filter(|f| f.status == FeedStatus::Dead)
            .map(|f| f.symbol.to_string())
            .collect();
        if !dead.is_empty() {
            unhealthy.push(format!("dead feeds: {}", dead.join(", ")));
        }
        if window.storage_errors_in_window > 0 && window.processed_in_window == 0 {
            unhealthy.push(format!(
                "{} storage errors and nothing processed in the last interval",
                window.storage_errors_in_window
            ));
        }

        let stale: Vec<String> = feeds
            .iter()
            .filter(|f| f.status == FeedStatus::Stale)
            .map(|f| f.symbol.to_string())
            .collect();
        if !stale.is_empty() {
            degraded.push(format!("stale feeds: {}", stale.join(", ")));
        }
        if last_sweep_failed {
            degraded.push("last compression sweep had failures".to_string());
        }
        if last_rotation_failed {
            degraded.push("last rotation failed".to_string());
        }
        if degraded_partitions > 0 {
            degraded.push(format!("{degraded_partitions} degraded partitions"));
        }
        if window.drop_rate > self.config.max_drop_rate {
            degraded.push(format!("drop rate {:.4} above {:.4}", window.drop_rate, self.config.max_drop_rate));
        }

        let status = if !unhealthy.is_empty() {
            HealthStatus::Unhealthy
        } else if !degraded.is_empty() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        unhealthy.extend(degraded);

        HealthReport {
            status,
            checked_at: now_ms,
            reasons: unhealthy,
            throughput_tps: window.throughput_tps,
            drop_rate: window.drop_rate,
            latency_us: Stage::all()
                .into_iter()
                .map(|stage| (stage, self.metrics.latency_summary(stage)))
                .collect(),
            bytes_saved: self.metrics.bytes_saved(),
            compression_ratio: self.metrics.compression_ratio(),
            degraded_partitions,
            last_sweep_failed,
            last_rotation_failed,
            feeds,
        }
    }

    /// Evaluate every `interval_ms` until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.interval_ms));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.evaluate(now_millis());
                    if report.status != HealthStatus::Healthy {
                        warn!(status = ?report.status, reasons = ?report.reasons, "Pipeline not healthy");
                    } else {
                        debug!(throughput_tps = report.throughput_tps, "Pipeline healthy");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("Monitor stopping");
                    break;
                }
            }
        }
    }
}
