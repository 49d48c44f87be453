//! Multi-timeframe bar aggregation
//!
//! Holds one [`CandleBuilder`] per (symbol, timeframe). Each symbol's state
//! sits behind its own map entry, so ticks for one symbol are applied
//! strictly one at a time while other symbols proceed independently.
//! Readers always receive owned copies.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use market_types::ids::Symbol;
use market_types::tick::Tick;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::candles::{resample, Bar, CandleBuilder, GapPolicy, Timeframe};
use crate::metrics::PipelineMetrics;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregatorError {
    #[error("no bars tracked for {0}")]
    UnknownSymbol(Symbol),

    #[error("no tracked timeframe of {symbol} divides {target}")]
    NoSourceTimeframe { symbol: Symbol, target: Timeframe },
}

/// Aggregator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Timeframes built for every symbol from its first tick.
    pub timeframes: Vec<Timeframe>,
    /// Closed bars retained per (symbol, timeframe).
    pub history_capacity: usize,
    pub gap_policy: GapPolicy,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            timeframes: Timeframe::all().to_vec(),
            history_capacity: 500,
            gap_policy: GapPolicy::Skip,
        }
    }
}

/// What one tick did to a symbol's bars.
#[derive(Debug, Default)]
pub struct AggregationOutcome {
    /// Bars closed by this tick across all timeframes, ordered by bucket end.
    pub closed: Vec<Bar>,
    /// Timeframes for which the tick was older than the forming bar.
    pub late_timeframes: usize,
}

#[derive(Debug)]
struct SymbolBars {
    builders: BTreeMap<Timeframe, CandleBuilder>,
}

pub struct Aggregator {
    config: AggregatorConfig,
    symbols: DashMap<Symbol, SymbolBars>,
    metrics: Arc<PipelineMetrics>,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig, metrics: Arc<PipelineMetrics>) -> Self {
        info!(
            timeframes = ?config.timeframes,
            history_capacity = config.history_capacity,
            gap_policy = ?config.gap_policy,
            "Aggregator initialized"
        );
        Self {
            config,
            symbols: DashMap::new(),
            metrics,
        }
    }

    fn new_builder(&self, symbol: &Symbol, timeframe: Timeframe) -> CandleBuilder {
        CandleBuilder::new(
            timeframe,
            symbol.clone(),
            self.config.history_capacity,
            self.config.gap_policy,
        )
    }

    /// Apply a validated tick to every tracked timeframe of its symbol.
    pub fn process(&self, tick: &Tick) -> AggregationOutcome {
        let price = tick.mid();
        let volume = tick.volume.unwrap_or(1.0);

        let mut entry = self.symbols.entry(tick.symbol.clone()).or_insert_with(|| SymbolBars {
            builders: self
                .config
                .timeframes
                .iter()
                .map(|tf| (*tf, self.new_builder(&tick.symbol, *tf)))
                .collect(),
        });

        let mut outcome = AggregationOutcome::default();
        for builder in entry.builders.values_mut() {
            let applied = builder.apply(price, volume, tick.timestamp);
            if applied.late {
                outcome.late_timeframes += 1;
            }
            outcome.closed.extend(applied.closed);
        }
        drop(entry);

        outcome
            .closed
            .sort_by_key(|bar| (bar.bucket_end(), bar.timeframe));

        if outcome.late_timeframes > 0 {
            self.metrics.late_bar_ticks.fetch_add(1, Ordering::Relaxed);
            debug!(
                symbol = %tick.symbol,
                timestamp = tick.timestamp,
                timeframes = outcome.late_timeframes,
                "Late tick ignored by bar builder"
            );
        }
        self.metrics
            .bars_closed
            .fetch_add(outcome.closed.len() as u64, Ordering::Relaxed);
        outcome
    }

    /// Make `target` a tracked timeframe of `symbol`, rebuilding its history
    /// by resampling the finest tracked timeframe that divides it.
    ///
    /// Only complete buckets become closed bars. If `target` was already
    /// tracked its own closed bars are kept and the resampled ones only fill
    /// in older buckets. The forming bar of the target is discarded and
    /// reopens with the next tick. Returns the number of derived bars.
    pub fn switch_timeframe(&self, symbol: &Symbol, target: Timeframe) -> Result<usize, AggregatorError> {
        let mut entry = self
            .symbols
            .get_mut(symbol)
            .ok_or_else(|| AggregatorError::UnknownSymbol(symbol.clone()))?;

        let source = entry
            .builders
            .iter()
            .filter(|(tf, _)| **tf != target && tf.divides(target))
            .map(|(_, builder)| builder)
            .next()
            .ok_or_else(|| AggregatorError::NoSourceTimeframe {
                symbol: symbol.clone(),
                target,
            })?;

        let closed: Vec<Bar> = source.closed().cloned().collect();
        let next_bucket = source.forming().map(|bar| bar.bucket_start);
        let source_tf = source.timeframe();
        let rebuilt = resample(&closed, target, next_bucket).unwrap_or_default();
        let count = rebuilt.len();

        entry
            .builders
            .entry(target)
            .or_insert_with(|| self.new_builder(symbol, target))
            .merge_history(rebuilt);
        drop(entry);

        self.metrics.timeframe_switches.fetch_add(1, Ordering::Relaxed);
        info!(
            symbol = %symbol,
            source = %source_tf,
            target = %target,
            bars = count,
            "Timeframe rebuilt from finer history"
        );
        Ok(count)
    }

    /// The most recent `limit` closed bars, oldest first.
    pub fn recent_bars(&self, symbol: &Symbol, timeframe: Timeframe, limit: usize) -> Vec<Bar> {
        self.with_builder(symbol, timeframe, |b| b.recent(limit))
            .unwrap_or_default()
    }

    /// Closed bars with `from <= bucket_start < to`.
    pub fn bars_in_range(&self, symbol: &Symbol, timeframe: Timeframe, from: i64, to: i64) -> Vec<Bar> {
        self.with_builder(symbol, timeframe, |b| b.range(from, to))
            .unwrap_or_default()
    }

    pub fn forming_bar(&self, symbol: &Symbol, timeframe: Timeframe) -> Option<Bar> {
        self.with_builder(symbol, timeframe, |b| b.forming().cloned())
            .flatten()
    }

    /// Timeframes currently built for `symbol`.
    pub fn timeframes(&self, symbol: &Symbol) -> Vec<Timeframe> {
        self.symbols
            .get(symbol)
            .map(|entry| entry.builders.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self.symbols.iter().map(|e| e.key().clone()).collect();
        symbols.sort();
        symbols
    }

    fn with_builder<T>(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        f: impl FnOnce(&CandleBuilder) -> T,
    ) -> Option<T> {
        let entry = self.symbols.get(symbol)?;
        entry.builders.get(&timeframe).map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candles::BarState;
    use market_types::time::MILLIS_PER_MINUTE;

    const T0: i64 = 1_737_388_800_000;

    fn make_tick(symbol: &str, bid: f64, ask: f64, ts: i64) -> Tick {
        Tick {
            symbol: Symbol::new(symbol),
            bid,
            ask,
            timestamp: ts,
            volume: None,
            source: "test".to_string(),
        }
    }

    fn make_aggregator(timeframes: Vec<Timeframe>) -> Aggregator {
        Aggregator::new(
            AggregatorConfig {
                timeframes,
                ..AggregatorConfig::default()
            },
            Arc::new(PipelineMetrics::new()),
        )
    }

    #[test]
    fn test_bar_fields_use_mid_price() {
        let agg = make_aggregator(vec![Timeframe::M1]);
        let symbol = Symbol::new("EURUSD");
        agg.process(&make_tick("EURUSD", 1.0, 1.2, T0));
        agg.process(&make_tick("EURUSD", 1.2, 1.4, T0 + 1_000));

        let bar = agg.forming_bar(&symbol, Timeframe::M1).unwrap();
        assert!((bar.open - 1.1).abs() < 1e-12);
        assert!((bar.close - 1.3).abs() < 1e-12);
        assert_eq!(bar.volume, 2.0); // tick count when the feed has no volume
    }

    #[test]
    fn test_closed_bars_ordered_by_bucket_end() {
        let agg = make_aggregator(vec![Timeframe::M1, Timeframe::M5, Timeframe::M15]);
        agg.process(&make_tick("EURUSD", 1.0, 1.0, T0));
        let outcome = agg.process(&make_tick("EURUSD", 1.0, 1.0, T0 + 15 * MILLIS_PER_MINUTE));

        assert_eq!(outcome.closed.len(), 3);
        let ends: Vec<i64> = outcome.closed.iter().map(|b| b.bucket_end()).collect();
        let mut sorted = ends.clone();
        sorted.sort();
        assert_eq!(ends, sorted);
        assert_eq!(outcome.closed[0].timeframe, Timeframe::M1);
        assert_eq!(outcome.closed[2].timeframe, Timeframe::M15);
    }

    #[test]
    fn test_symbols_are_independent() {
        let agg = make_aggregator(vec![Timeframe::M1]);
        agg.process(&make_tick("EURUSD", 1.0, 1.0, T0));
        agg.process(&make_tick("GBPUSD", 2.0, 2.0, T0));
        agg.process(&make_tick("EURUSD", 1.0, 1.0, T0 + MILLIS_PER_MINUTE));

        assert_eq!(agg.recent_bars(&Symbol::new("EURUSD"), Timeframe::M1, 10).len(), 1);
        assert!(agg.recent_bars(&Symbol::new("GBPUSD"), Timeframe::M1, 10).is_empty());
        assert_eq!(agg.symbols().len(), 2);
    }

    #[test]
    fn test_late_tick_counted() {
        let agg = make_aggregator(vec![Timeframe::M1]);
        agg.process(&make_tick("EURUSD", 1.0, 1.0, T0 + MILLIS_PER_MINUTE));
        let outcome = agg.process(&make_tick("EURUSD", 5.0, 5.0, T0 + 30_000));
        assert_eq!(outcome.late_timeframes, 1);
        assert_eq!(agg.metrics.late_bar_ticks.load(Ordering::Relaxed), 1);

        let bar = agg.forming_bar(&Symbol::new("EURUSD"), Timeframe::M1).unwrap();
        assert_eq!(bar.high, 1.0);
    }

    #[test]
    fn test_switch_timeframe_resamples_history() {
        let agg = make_aggregator(vec![Timeframe::M1]);
        let symbol = Symbol::new("EURUSD");
        // 31 minutes of ticks: minutes 0..=29 closed, minute 30 forming
        for m in 0..=30 {
            let price = 1.0 + m as f64 * 0.01;
            agg.process(&make_tick("EURUSD", price, price, T0 + m * MILLIS_PER_MINUTE));
        }

        let count = agg.switch_timeframe(&symbol, Timeframe::M15).unwrap();
        assert_eq!(count, 2);

        let bars = agg.recent_bars(&symbol, Timeframe::M15, 10);
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].bucket_start, T0);
        assert!((bars[0].open - 1.0).abs() < 1e-9);
        assert!((bars[0].close - 1.14).abs() < 1e-9);
        assert_eq!(bars[0].tick_count, 15);
        assert!(bars.iter().all(|b| b.state == BarState::Closed));
        assert!(agg.forming_bar(&symbol, Timeframe::M15).is_none());
        assert!(agg.timeframes(&symbol).contains(&Timeframe::M15));

        // The next tick opens a fresh forming bar on the new timeframe
        agg.process(&make_tick("EURUSD", 2.0, 2.0, T0 + 31 * MILLIS_PER_MINUTE));
        assert_eq!(
            agg.forming_bar(&symbol, Timeframe::M15).unwrap().bucket_start,
            T0 + 30 * MILLIS_PER_MINUTE
        );
    }

    #[test]
    fn test_switch_to_tracked_timeframe_keeps_native_history() {
        let agg = Aggregator::new(
            AggregatorConfig {
                timeframes: vec![Timeframe::M1, Timeframe::M5],
                history_capacity: 10,
                ..AggregatorConfig::default()
            },
            Arc::new(PipelineMetrics::new()),
        );
        let symbol = Symbol::new("EURUSD");
        for m in 0..60 {
            agg.process(&make_tick("EURUSD", 1.0, 1.0, T0 + m * MILLIS_PER_MINUTE));
        }
        let native = agg.recent_bars(&symbol, Timeframe::M5, 10);
        assert_eq!(native.len(), 10);

        // the M1 ring only covers minutes 49..=58: one complete M5 bucket
        let derived = agg.switch_timeframe(&symbol, Timeframe::M5).unwrap();
        assert_eq!(derived, 1);

        let bars = agg.recent_bars(&symbol, Timeframe::M5, 10);
        assert_eq!(bars, native);
        assert!(agg.forming_bar(&symbol, Timeframe::M5).is_none());
    }

    #[test]
    fn test_switch_timeframe_without_source() {
        let agg = make_aggregator(vec![Timeframe::H4]);
        agg.process(&make_tick("EURUSD", 1.0, 1.0, T0));
        assert!(matches!(
            agg.switch_timeframe(&Symbol::new("EURUSD"), Timeframe::H1),
            Err(AggregatorError::NoSourceTimeframe { .. })
        ));
        assert!(matches!(
            agg.switch_timeframe(&Symbol::new("GBPUSD"), Timeframe::H1),
            Err(AggregatorError::UnknownSymbol(_))
        ));
    }

    #[test]
    fn test_range_query_returns_copies() {
        let agg = make_aggregator(vec![Timeframe::M1]);
        for m in 0..5 {
            agg.process(&make_tick("EURUSD", 1.0, 1.0, T0 + m * MILLIS_PER_MINUTE));
        }
        let mut bars = agg.bars_in_range(&Symbol::new("EURUSD"), Timeframe::M1, T0, T0 + 2 * MILLIS_PER_MINUTE);
        assert_eq!(bars.len(), 2);
        bars[0].close = 99.0;
        let again = agg.bars_in_range(&Symbol::new("EURUSD"), Timeframe::M1, T0, T0 + 2 * MILLIS_PER_MINUTE);
        assert_eq!(again[0].close, 1.0);
    }
}
