//! Tick ingestion boundary
//!
//! Validates raw ticks from feed adapters and turns them into [`Tick`]s.
//! Every refusal carries exactly one [`RejectReason`]; nothing is dropped
//! silently.
//!
//! Checks, in order:
//! - required fields present, symbol well-formed
//! - prices finite, positive, `bid <= ask`; volume finite and non-negative
//! - timestamp not too far ahead of the wall clock, not older than the max age
//! - not older than the symbol's newest tick by more than the late tolerance
//! - not a retransmit of a tick seen within the dedup window
//!
//! A mid price jumping by more than the spike threshold is accepted but
//! counted and logged.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use market_types::errors::RejectReason;
use market_types::ids::Symbol;
use market_types::tick::{RawTick, Tick, TickFingerprint};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::metrics::PipelineMetrics;

const UNKNOWN_SOURCE: &str = "unknown";

/// Configuration for the tick ingester.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngesterConfig {
    /// Number of processing workers (one bounded queue each).
    pub worker_count: usize,
    /// Capacity of each worker queue.
    pub queue_capacity: usize,
    /// Retransmits are recognised within this much tick time.
    pub dedup_window_ms: i64,
    /// Hard cap on fingerprints remembered per symbol.
    pub dedup_capacity: usize,
    /// How far behind the symbol's newest tick a tick may arrive.
    pub late_tolerance_ms: i64,
    /// How far ahead of the wall clock a tick may be stamped.
    pub max_future_skew_ms: i64,
    /// Ticks older than this (vs. wall clock) are refused. `None` disables
    /// the check, e.g. for replaying historical data.
    pub max_tick_age_ms: Option<i64>,
    /// Relative mid-price move that counts as a spike.
    pub price_spike_threshold: f64,
}

impl Default for IngesterConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 10_000,
            dedup_window_ms: 5_000,
            dedup_capacity: 10_000,
            late_tolerance_ms: 1_000,
            max_future_skew_ms: 60_000,
            max_tick_age_ms: Some(60_000),
            price_spike_threshold: 0.10,
        }
    }
}

/// Per-symbol ordering and dedup state.
#[derive(Default)]
struct SymbolWindow {
    newest_timestamp: i64,
    last_mid: Option<f64>,
    recent: VecDeque<TickFingerprint>,
    seen: HashSet<TickFingerprint>,
}

impl SymbolWindow {
    fn evict(&mut self, window_ms: i64, capacity: usize) {
        let horizon = self.newest_timestamp.saturating_sub(window_ms);
        while let Some(front) = self.recent.front() {
            if front.timestamp >= horizon && self.recent.len() <= capacity {
                break;
            }
            if let Some(old) = self.recent.pop_front() {
                self.seen.remove(&old);
            }
        }
    }
}

/// Validates raw ticks and tracks per-symbol dedup/ordering windows.
pub struct Ingester {
    config: IngesterConfig,
    windows: DashMap<Symbol, SymbolWindow>,
    metrics: Arc<PipelineMetrics>,
}

impl Ingester {
    pub fn new(config: IngesterConfig, metrics: Arc<PipelineMetrics>) -> Self {
        info!(
            workers = config.worker_count,
            queue_capacity = config.queue_capacity,
            dedup_window_ms = config.dedup_window_ms,
            late_tolerance_ms = config.late_tolerance_ms,
            "Ingester initialized"
        );
        Self {
            config,
            windows: DashMap::new(),
            metrics,
        }
    }

    pub fn config(&self) -> &IngesterConfig {
        &self.config
    }

    /// Validate `raw` against the wall clock `now_ms`.
    pub fn validate(&self, raw: RawTick, now_ms: i64) -> Result<Tick, RejectReason> {
        let tick = self.check_fields(raw, now_ms)?;
        self.check_sequence(&tick)?;
        Ok(tick)
    }

    /// Stateless checks on a single tick. Leaves no state behind, so callers
    /// may run it before deciding whether the tick can be queued at all.
    pub fn check_fields(&self, raw: RawTick, now_ms: i64) -> Result<Tick, RejectReason> {
        let symbol = raw.symbol.ok_or(RejectReason::MissingField("symbol"))?;
        let bid = raw.bid.ok_or(RejectReason::MissingField("bid"))?;
        let ask = raw.ask.ok_or(RejectReason::MissingField("ask"))?;
        let timestamp = raw.timestamp.ok_or(RejectReason::MissingField("timestamp"))?;

        let symbol = Symbol::try_new(symbol.trim()).ok_or(RejectReason::InvalidSymbol)?;

        if !bid.is_finite() || !ask.is_finite() {
            return Err(RejectReason::NonFinitePrice);
        }
        if bid <= 0.0 || ask <= 0.0 {
            return Err(RejectReason::NonPositivePrice);
        }
        if bid > ask {
            return Err(RejectReason::CrossedQuote);
        }
        if let Some(volume) = raw.volume {
            if !volume.is_finite() || volume < 0.0 {
                return Err(RejectReason::InvalidVolume);
            }
        }

        if timestamp > now_ms.saturating_add(self.config.max_future_skew_ms) {
            return Err(RejectReason::FutureTimestamp);
        }
        if let Some(max_age) = self.config.max_tick_age_ms {
            if timestamp < now_ms.saturating_sub(max_age) {
                return Err(RejectReason::StaleTimestamp);
            }
        }

        let source = raw
            .source
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| UNKNOWN_SOURCE.to_string());

        Ok(Tick {
            symbol,
            bid,
            ask,
            timestamp,
            volume: raw.volume,
            source,
        })
    }

    /// Per-symbol late and duplicate checks; records the tick on success.
    pub fn check_sequence(&self, tick: &Tick) -> Result<(), RejectReason> {
        let mut window = self.windows.entry(tick.symbol.clone()).or_default();
        let first = window.recent.is_empty() && window.last_mid.is_none();

        if !first && tick.timestamp < window.newest_timestamp - self.config.late_tolerance_ms {
            return Err(RejectReason::LateTick);
        }

        let fingerprint = tick.fingerprint();
        if window.seen.contains(&fingerprint) {
            return Err(RejectReason::Duplicate);
        }

        let mid = tick.mid();
        if let Some(last_mid) = window.last_mid {
            let change = ((mid - last_mid) / last_mid).abs();
            if change > self.config.price_spike_threshold {
                self.metrics.price_spikes.fetch_add(1, Ordering::Relaxed);
                warn!(
                    symbol = %tick.symbol,
                    last_mid,
                    mid,
                    change_pct = change * 100.0,
                    "Price spike detected"
                );
            }
        }

        window.newest_timestamp = window.newest_timestamp.max(tick.timestamp);
        window.last_mid = Some(mid);
        window.seen.insert(fingerprint);
        window.recent.push_back(fingerprint);
        window.evict(self.config.dedup_window_ms, self.config.dedup_capacity);
        Ok(())
    }

    /// Number of symbols with dedup state.
    pub fn tracked_symbols(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_737_388_800_000;

    fn make_ingester(config: IngesterConfig) -> Ingester {
        Ingester::new(config, Arc::new(PipelineMetrics::new()))
    }

    fn raw(symbol: &str, bid: f64, ask: f64, ts: i64) -> RawTick {
        RawTick::new(symbol, bid, ask, ts, None, "OANDA")
    }

    #[test]
    fn test_valid_tick_accepted() {
        let ingester = make_ingester(IngesterConfig::default());
        let tick = ingester.validate(raw("EURUSD", 1.0850, 1.0852, NOW), NOW).unwrap();
        assert_eq!(tick.symbol.as_str(), "EURUSD");
        assert_eq!(tick.source, "OANDA");
    }

    #[test]
    fn test_missing_fields_rejected() {
        let ingester = make_ingester(IngesterConfig::default());
        let mut r = raw("EURUSD", 1.0, 1.1, NOW);
        r.ask = None;
        assert_eq!(ingester.validate(r, NOW), Err(RejectReason::MissingField("ask")));

        let mut r = raw("EURUSD", 1.0, 1.1, NOW);
        r.timestamp = None;
        assert_eq!(ingester.validate(r, NOW), Err(RejectReason::MissingField("timestamp")));

        let mut r = raw("EURUSD", 1.0, 1.1, NOW);
        r.symbol = None;
        assert_eq!(ingester.validate(r, NOW), Err(RejectReason::MissingField("symbol")));
    }

    #[test]
    fn test_malformed_prices_rejected() {
        let ingester = make_ingester(IngesterConfig::default());
        assert_eq!(
            ingester.validate(raw("EURUSD", f64::NAN, 1.1, NOW), NOW),
            Err(RejectReason::NonFinitePrice)
        );
        assert_eq!(
            ingester.validate(raw("EURUSD", 1.0, f64::INFINITY, NOW), NOW),
            Err(RejectReason::NonFinitePrice)
        );
        assert_eq!(
            ingester.validate(raw("EURUSD", 0.0, 1.1, NOW), NOW),
            Err(RejectReason::NonPositivePrice)
        );
        assert_eq!(
            ingester.validate(raw("EURUSD", 1.2, 1.1, NOW), NOW),
            Err(RejectReason::CrossedQuote)
        );
    }

    #[test]
    fn test_locked_quote_accepted() {
        let ingester = make_ingester(IngesterConfig::default());
        assert!(ingester.validate(raw("EURUSD", 1.1, 1.1, NOW), NOW).is_ok());
    }

    #[test]
    fn test_invalid_symbol_and_volume() {
        let ingester = make_ingester(IngesterConfig::default());
        assert_eq!(
            ingester.validate(raw("EUR USD", 1.0, 1.1, NOW), NOW),
            Err(RejectReason::InvalidSymbol)
        );
        let mut r = raw("EURUSD", 1.0, 1.1, NOW);
        r.volume = Some(-5.0);
        assert_eq!(ingester.validate(r, NOW), Err(RejectReason::InvalidVolume));
    }

    #[test]
    fn test_timestamp_bounds() {
        let ingester = make_ingester(IngesterConfig::default());
        assert_eq!(
            ingester.validate(raw("EURUSD", 1.0, 1.1, NOW + 61_000), NOW),
            Err(RejectReason::FutureTimestamp)
        );
        assert_eq!(
            ingester.validate(raw("EURUSD", 1.0, 1.1, NOW - 61_000), NOW),
            Err(RejectReason::StaleTimestamp)
        );

        let replay = make_ingester(IngesterConfig {
            max_tick_age_ms: None,
            ..IngesterConfig::default()
        });
        assert!(replay.validate(raw("EURUSD", 1.0, 1.1, NOW - 86_400_000), NOW).is_ok());
    }

    #[test]
    fn test_duplicate_within_window_rejected() {
        let ingester = make_ingester(IngesterConfig::default());
        assert!(ingester.validate(raw("EURUSD", 1.0, 1.1, NOW), NOW).is_ok());
        assert_eq!(
            ingester.validate(raw("EURUSD", 1.0, 1.1, NOW), NOW),
            Err(RejectReason::Duplicate)
        );
        // Same timestamp, different quote: not a duplicate
        assert!(ingester.validate(raw("EURUSD", 1.0, 1.2, NOW), NOW).is_ok());
        // Same quote on another symbol: not a duplicate
        assert!(ingester.validate(raw("GBPUSD", 1.0, 1.1, NOW), NOW).is_ok());
    }

    #[test]
    fn test_field_checks_leave_no_dedup_state() {
        let ingester = make_ingester(IngesterConfig::default());
        let tick = ingester.check_fields(raw("EURUSD", 1.0, 1.1, NOW), NOW).unwrap();
        assert_eq!(ingester.tracked_symbols(), 0);

        assert!(ingester.check_sequence(&tick).is_ok());
        assert_eq!(ingester.check_sequence(&tick), Err(RejectReason::Duplicate));
        assert_eq!(ingester.tracked_symbols(), 1);
    }

    #[test]
    fn test_duplicate_forgotten_after_window() {
        let ingester = make_ingester(IngesterConfig {
            max_tick_age_ms: None,
            late_tolerance_ms: 10_000,
            ..IngesterConfig::default()
        });
        assert!(ingester.validate(raw("EURUSD", 1.0, 1.1, NOW), NOW).is_ok());
        assert!(ingester.validate(raw("EURUSD", 1.0, 1.1, NOW + 6_000), NOW).is_ok());
        // NOW is now 6s behind the newest tick: outside the 5s dedup window but
        // inside the late tolerance
        assert!(ingester.validate(raw("EURUSD", 1.0, 1.1, NOW), NOW).is_ok());
    }

    #[test]
    fn test_late_tick_rejected() {
        let ingester = make_ingester(IngesterConfig::default());
        assert!(ingester.validate(raw("EURUSD", 1.0, 1.1, NOW), NOW).is_ok());
        // Within tolerance
        assert!(ingester.validate(raw("EURUSD", 1.0, 1.1, NOW - 800), NOW).is_ok());
        // Beyond tolerance
        assert_eq!(
            ingester.validate(raw("EURUSD", 1.0, 1.1, NOW - 1_500), NOW),
            Err(RejectReason::LateTick)
        );
    }

    #[test]
    fn test_dedup_capacity_bounded() {
        let ingester = make_ingester(IngesterConfig {
            dedup_capacity: 3,
            ..IngesterConfig::default()
        });
        for i in 0..5 {
            assert!(ingester.validate(raw("EURUSD", 1.0, 1.1, NOW + i), NOW).is_ok());
        }
        // Oldest fingerprints evicted by the cap even though inside the time window
        assert!(ingester.validate(raw("EURUSD", 1.0, 1.1, NOW), NOW).is_ok());
        assert_eq!(
            ingester.validate(raw("EURUSD", 1.0, 1.1, NOW + 4), NOW),
            Err(RejectReason::Duplicate)
        );
    }

    #[test]
    fn test_price_spike_counted_but_accepted() {
        let metrics = Arc::new(PipelineMetrics::new());
        let ingester = Ingester::new(IngesterConfig::default(), Arc::clone(&metrics));
        assert!(ingester.validate(raw("EURUSD", 1.00, 1.00, NOW), NOW).is_ok());
        assert!(ingester.validate(raw("EURUSD", 1.20, 1.20, NOW + 1), NOW).is_ok());
        assert_eq!(metrics.price_spikes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_missing_source_defaults() {
        let ingester = make_ingester(IngesterConfig::default());
        let mut r = raw("EURUSD", 1.0, 1.1, NOW);
        r.source = None;
        assert_eq!(ingester.validate(r, NOW).unwrap().source, "unknown");
    }
}
