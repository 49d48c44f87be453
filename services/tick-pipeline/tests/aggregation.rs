//! Bar formation over a realistic tick stream
//!
//! - exact bucket alignment
//! - 5 000 ticks spread over 83 minutes close exactly 83 M1 bars
//! - every bar opens at the mid of its first tick
//! - no tick is lost between closed and forming bars

use std::sync::Arc;

use market_types::ids::Symbol;
use market_types::tick::Tick;
use tick_pipeline::aggregator::{Aggregator, AggregatorConfig};
use tick_pipeline::candles::{GapPolicy, Timeframe};
use tick_pipeline::metrics::PipelineMetrics;

const T0: i64 = 1_737_388_800_000;

fn make_tick(i: i64) -> Tick {
    let bid = 1.0850 + (i % 97) as f64 * 1e-5;
    Tick {
        symbol: Symbol::new("EURUSD"),
        bid,
        ask: bid + 0.0002,
        timestamp: T0 + i * 83 * 60_000 / 4_999,
        volume: None,
        source: "feed".to_string(),
    }
}

fn make_aggregator(timeframes: Vec<Timeframe>) -> Aggregator {
    let config = AggregatorConfig {
        timeframes,
        history_capacity: 500,
        gap_policy: GapPolicy::Skip,
    };
    Aggregator::new(config, Arc::new(PipelineMetrics::new()))
}

#[test]
fn test_minute_bucket_alignment() {
    assert_eq!(Timeframe::M1.bucket_start(1_737_388_825_000), 1_737_388_800_000);
    assert_eq!(Timeframe::M1.bucket_start(1_737_388_800_000), 1_737_388_800_000);
    assert_eq!(Timeframe::M1.bucket_start(1_737_388_859_999), 1_737_388_800_000);
}

#[test]
fn test_83_minutes_close_83_bars() {
    let aggregator = make_aggregator(vec![Timeframe::M1]);
    let symbol = Symbol::new("EURUSD");
    let ticks: Vec<Tick> = (0..5_000).map(make_tick).collect();

    let mut emitted = Vec::new();
    for tick in &ticks {
        emitted.extend(aggregator.process(tick).closed);
    }

    assert_eq!(emitted.len(), 83);
    let history = aggregator.recent_bars(&symbol, Timeframe::M1, 500);
    assert_eq!(history, emitted);

    let forming = aggregator.forming_bar(&symbol, Timeframe::M1).unwrap();
    assert_eq!(forming.bucket_start, T0 + 83 * 60_000);
    assert!(!forming.is_closed());

    for (k, bar) in history.iter().enumerate() {
        assert_eq!(bar.bucket_start, T0 + k as i64 * 60_000);
        assert!(bar.is_closed());
        assert!(bar.is_valid());

        let first = ticks
            .iter()
            .find(|t| Timeframe::M1.bucket_start(t.timestamp) == bar.bucket_start)
            .unwrap();
        assert_eq!(bar.open, first.mid());

        let last = ticks
            .iter()
            .rev()
            .find(|t| Timeframe::M1.bucket_start(t.timestamp) == bar.bucket_start)
            .unwrap();
        assert_eq!(bar.close, last.mid());
    }

    let counted: u64 = history.iter().map(|b| b.tick_count).sum::<u64>() + forming.tick_count;
    assert_eq!(counted, 5_000);
}

#[test]
fn test_coarser_timeframes_follow_the_same_stream() {
    let aggregator = make_aggregator(vec![Timeframe::M1, Timeframe::M5, Timeframe::M15, Timeframe::H1]);
    let symbol = Symbol::new("EURUSD");
    for i in 0..5_000 {
        aggregator.process(&make_tick(i));
    }

    // 83 minutes: 16 complete M5, 5 complete M15, 1 complete H1
    assert_eq!(aggregator.recent_bars(&symbol, Timeframe::M5, 500).len(), 16);
    assert_eq!(aggregator.recent_bars(&symbol, Timeframe::M15, 500).len(), 5);
    assert_eq!(aggregator.recent_bars(&symbol, Timeframe::H1, 500).len(), 1);

    let m1 = aggregator.recent_bars(&symbol, Timeframe::M1, 500);
    let h1 = &aggregator.recent_bars(&symbol, Timeframe::H1, 1)[0];
    let hour = &m1[..60];
    assert_eq!(h1.open, hour[0].open);
    assert_eq!(h1.close, hour[59].close);
    assert_eq!(h1.high, hour.iter().map(|b| b.high).fold(f64::MIN, f64::max));
    assert_eq!(h1.low, hour.iter().map(|b| b.low).fold(f64::MAX, f64::min));
}

#[test]
fn test_switch_timeframe_derives_complete_buckets_only() {
    let aggregator = make_aggregator(vec![Timeframe::M1]);
    let symbol = Symbol::new("EURUSD");
    for i in 0..5_000 {
        aggregator.process(&make_tick(i));
    }

    let derived = aggregator.switch_timeframe(&symbol, Timeframe::M15).unwrap();
    assert_eq!(derived, 5);
    let bars = aggregator.recent_bars(&symbol, Timeframe::M15, 500);
    assert_eq!(bars.len(), 5);
    assert!(bars.iter().all(|b| b.is_closed()));
    assert_eq!(bars[0].bucket_start, T0);
}

#[test]
fn test_switch_to_daily_ignores_partial_day() {
    let aggregator = make_aggregator(vec![Timeframe::M1]);
    let symbol = Symbol::new("EURUSD");
    let evening = Timeframe::D1.bucket_start(T0) + 20 * 3_600_000;
    for minute in 0..=300 {
        let mut tick = make_tick(0);
        tick.timestamp = evening + minute * 60_000;
        aggregator.process(&tick);
    }

    let derived = aggregator.switch_timeframe(&symbol, Timeframe::D1).unwrap();
    assert_eq!(derived, 0);
    assert!(aggregator.recent_bars(&symbol, Timeframe::D1, 10).is_empty());
}
