//! OHLC Bar Builder
//!
//! Builds OHLC bars from tick mid prices for one (symbol, timeframe) pair.
//!
//! Bucket boundaries are aligned to the epoch: a tick at `t` belongs to the
//! bucket starting at `floor(t / Δ) · Δ`. Each builder holds exactly one
//! forming bar and a bounded ring of closed bars. Closed bars are never
//! mutated; a tick for an earlier bucket than the forming one is reported
//! as late and ignored.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use market_types::ids::Symbol;
use market_types::time::{align_down, MILLIS_PER_DAY, MILLIS_PER_HOUR, MILLIS_PER_MINUTE};
use serde::{Deserialize, Serialize};

/// Supported bar timeframes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    /// 1 minute
    #[serde(alias = "1m")]
    M1,
    /// 5 minutes
    #[serde(alias = "5m")]
    M5,
    /// 15 minutes
    #[serde(alias = "15m")]
    M15,
    /// 30 minutes
    #[serde(alias = "30m")]
    M30,
    /// 1 hour
    #[serde(alias = "1h")]
    H1,
    /// 4 hours
    #[serde(alias = "4h")]
    H4,
    /// 1 day
    #[serde(alias = "1d")]
    D1,
}

impl Timeframe {
    /// Duration of this timeframe in milliseconds.
    pub fn duration_millis(&self) -> i64 {
        match self {
            Timeframe::M1 => MILLIS_PER_MINUTE,
            Timeframe::M5 => 5 * MILLIS_PER_MINUTE,
            Timeframe::M15 => 15 * MILLIS_PER_MINUTE,
            Timeframe::M30 => 30 * MILLIS_PER_MINUTE,
            Timeframe::H1 => MILLIS_PER_HOUR,
            Timeframe::H4 => 4 * MILLIS_PER_HOUR,
            Timeframe::D1 => MILLIS_PER_DAY,
        }
    }

    /// All supported timeframes, finest first.
    pub fn all() -> &'static [Timeframe] {
        &[
            Timeframe::M1,
            Timeframe::M5,
            Timeframe::M15,
            Timeframe::M30,
            Timeframe::H1,
            Timeframe::H4,
            Timeframe::D1,
        ]
    }

    /// Bucket start for a timestamp (floor to this timeframe's boundary).
    pub fn bucket_start(&self, timestamp: i64) -> i64 {
        align_down(timestamp, self.duration_millis())
    }

    /// Whether bars of `self` can be merged exactly into bars of `coarser`.
    pub fn divides(&self, coarser: Timeframe) -> bool {
        coarser.duration_millis() % self.duration_millis() == 0
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "M1",
            Timeframe::M5 => "M5",
            Timeframe::M15 => "M15",
            Timeframe::M30 => "M30",
            Timeframe::H1 => "H1",
            Timeframe::H4 => "H4",
            Timeframe::D1 => "D1",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "M1" | "1m" => Ok(Timeframe::M1),
            "M5" | "5m" => Ok(Timeframe::M5),
            "M15" | "15m" => Ok(Timeframe::M15),
            "M30" | "30m" => Ok(Timeframe::M30),
            "H1" | "1h" => Ok(Timeframe::H1),
            "H4" | "4h" => Ok(Timeframe::H4),
            "D1" | "1d" => Ok(Timeframe::D1),
            other => Err(format!("unknown timeframe: {other}")),
        }
    }
}

/// Lifecycle state of a bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarState {
    Forming,
    Closed,
}

/// A single OHLC bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    /// Epoch ms, aligned to `timeframe`.
    pub bucket_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub tick_count: u64,
    pub state: BarState,
}

impl Bar {
    /// Open a forming bar from the first tick of its bucket.
    fn open_at(symbol: Symbol, timeframe: Timeframe, bucket_start: i64, price: f64, volume: f64) -> Self {
        Self {
            symbol,
            timeframe,
            bucket_start,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
            tick_count: 1,
            state: BarState::Forming,
        }
    }

    /// Flat zero-volume bar carrying `prev_close` through a quiet bucket.
    fn flat(symbol: Symbol, timeframe: Timeframe, bucket_start: i64, prev_close: f64) -> Self {
        Self {
            symbol,
            timeframe,
            bucket_start,
            open: prev_close,
            high: prev_close,
            low: prev_close,
            close: prev_close,
            volume: 0.0,
            tick_count: 0,
            state: BarState::Closed,
        }
    }

    fn update(&mut self, price: f64, volume: f64) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
        self.volume += volume;
        self.tick_count += 1;
    }

    /// First millisecond after this bar's bucket.
    pub fn bucket_end(&self) -> i64 {
        self.bucket_start + self.timeframe.duration_millis()
    }

    pub fn is_closed(&self) -> bool {
        self.state == BarState::Closed
    }

    /// Validate bar integrity (OHLC invariants and alignment).
    pub fn is_valid(&self) -> bool {
        self.low <= self.open
            && self.low <= self.close
            && self.open <= self.high
            && self.close <= self.high
            && self.volume >= 0.0
            && self.timeframe.bucket_start(self.bucket_start) == self.bucket_start
    }
}

/// How to treat buckets in which no tick arrived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapPolicy {
    /// Emit nothing: the interval shows up as a gap in the history.
    #[default]
    Skip,
    /// Emit flat zero-volume bars at the previous close.
    CarryForward,
}

/// Result of feeding one tick into a builder.
#[derive(Debug, Default)]
pub struct TickApplication {
    /// Bars sealed by this tick, oldest first (includes carried-forward fills).
    pub closed: Vec<Bar>,
    /// The tick belonged to a bucket older than the forming bar.
    pub late: bool,
}

/// Builds bars for a single timeframe on a single symbol.
#[derive(Debug, Clone)]
pub struct CandleBuilder {
    timeframe: Timeframe,
    symbol: Symbol,
    /// Bar for the current bucket (not yet closed).
    forming: Option<Bar>,
    /// Closed bars, oldest first.
    closed: VecDeque<Bar>,
    /// Max closed bars to retain.
    capacity: usize,
    gap_policy: GapPolicy,
}

impl CandleBuilder {
    pub fn new(timeframe: Timeframe, symbol: Symbol, capacity: usize, gap_policy: GapPolicy) -> Self {
        Self {
            timeframe,
            symbol,
            forming: None,
            closed: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
            gap_policy,
        }
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// Apply a tick at `price` with `volume` observed at `timestamp`.
    pub fn apply(&mut self, price: f64, volume: f64, timestamp: i64) -> TickApplication {
        let bucket = self.timeframe.bucket_start(timestamp);
        let mut result = TickApplication::default();

        let forming_bucket = self.forming.as_ref().map(|bar| bar.bucket_start);
        match forming_bucket {
            Some(current) if bucket == current => {
                if let Some(bar) = self.forming.as_mut() {
                    bar.update(price, volume);
                }
                return result;
            }
            Some(current) if bucket < current => {
                result.late = true;
                return result;
            }
            Some(_) => {
                if let Some(sealed) = self.seal_forming() {
                    let prev_close = sealed.close;
                    let gap_from = sealed.bucket_end();
                    result.closed.push(sealed);
                    if self.gap_policy == GapPolicy::CarryForward {
                        result.closed.extend(self.fill_gap(prev_close, gap_from, bucket));
                    }
                }
            }
            None => {}
        }

        self.forming = Some(Bar::open_at(
            self.symbol.clone(),
            self.timeframe,
            bucket,
            price,
            volume,
        ));
        result
    }

    /// Seal the forming bar into the closed ring.
    fn seal_forming(&mut self) -> Option<Bar> {
        let mut bar = self.forming.take()?;
        bar.state = BarState::Closed;
        self.push_closed(bar.clone());
        Some(bar)
    }

    /// Flat bars for every empty bucket in `[from, to)`.
    ///
    /// Only the most recent `capacity` fills are produced; older ones would
    /// be evicted from the ring immediately.
    fn fill_gap(&mut self, prev_close: f64, from: i64, to: i64) -> Vec<Bar> {
        let step = self.timeframe.duration_millis();
        let missing = ((to - from) / step).max(0) as usize;
        let skip = missing.saturating_sub(self.capacity);
        let mut fills = Vec::with_capacity(missing - skip);
        let mut t = from + skip as i64 * step;
        while t < to {
            let bar = Bar::flat(self.symbol.clone(), self.timeframe, t, prev_close);
            self.push_closed(bar.clone());
            fills.push(bar);
            t += step;
        }
        fills
    }

    fn push_closed(&mut self, bar: Bar) {
        self.closed.push_back(bar);
        while self.closed.len() > self.capacity {
            self.closed.pop_front();
        }
    }

    /// The most recent `limit` closed bars, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<Bar> {
        let skip = self.closed.len().saturating_sub(limit);
        self.closed.iter().skip(skip).cloned().collect()
    }

    /// Closed bars with `from <= bucket_start < to`, oldest first.
    pub fn range(&self, from: i64, to: i64) -> Vec<Bar> {
        self.closed
            .iter()
            .filter(|bar| bar.bucket_start >= from && bar.bucket_start < to)
            .cloned()
            .collect()
    }

    /// All retained closed bars, oldest first.
    pub fn closed(&self) -> impl Iterator<Item = &Bar> {
        self.closed.iter()
    }

    /// The forming bar, if any tick has arrived for the current bucket.
    pub fn forming(&self) -> Option<&Bar> {
        self.forming.as_ref()
    }

    /// Fold `derived` bars into the closed history and discard the forming
    /// bar. Bars already built natively win for the same bucket.
    ///
    /// The next tick opens a fresh forming bar.
    pub fn merge_history(&mut self, derived: Vec<Bar>) {
        self.forming = None;
        let mut merged: BTreeMap<i64, Bar> = derived
            .into_iter()
            .map(|bar| (bar.bucket_start, bar))
            .collect();
        for bar in self.closed.drain(..) {
            merged.insert(bar.bucket_start, bar);
        }
        let skip = merged.len().saturating_sub(self.capacity);
        self.closed.extend(merged.into_values().skip(skip));
    }
}

/// Merge closed `source` bars into `target`-sized buckets.
///
/// Only complete target buckets are produced. The leading bucket counts as
/// complete only when the first source bar starts exactly at its start. A
/// trailing bucket counts as complete when its last source bar ends exactly
/// at the bucket end, or when `next_bucket_start` (the source's forming
/// bucket) already lies beyond it.
///
/// Returns `None` if the source timeframe does not divide `target`.
pub fn resample(source: &[Bar], target: Timeframe, next_bucket_start: Option<i64>) -> Option<Vec<Bar>> {
    let first = source.first()?;
    if !first.timeframe.divides(target) {
        return None;
    }

    let mut out: Vec<Bar> = Vec::new();
    let mut current: Option<Bar> = None;
    let mut leading_partial = false;
    let mut last_end = 0i64;

    for bar in source.iter().filter(|bar| bar.is_closed()) {
        let bucket = target.bucket_start(bar.bucket_start);
        match current.as_mut() {
            Some(acc) if acc.bucket_start == bucket => {
                acc.high = acc.high.max(bar.high);
                acc.low = acc.low.min(bar.low);
                acc.close = bar.close;
                acc.volume += bar.volume;
                acc.tick_count += bar.tick_count;
            }
            _ => {
                match current.take() {
                    Some(done) if !leading_partial => out.push(done),
                    Some(_) => leading_partial = false,
                    None => leading_partial = bar.bucket_start != bucket,
                }
                current = Some(Bar {
                    symbol: bar.symbol.clone(),
                    timeframe: target,
                    bucket_start: bucket,
                    open: bar.open,
                    high: bar.high,
                    low: bar.low,
                    close: bar.close,
                    volume: bar.volume,
                    tick_count: bar.tick_count,
                    state: BarState::Closed,
                });
            }
        }
        last_end = bar.bucket_end();
    }

    if let Some(trailing) = current {
        let target_end = trailing.bucket_start + target.duration_millis();
        let complete = !leading_partial
            && (last_end == target_end || next_bucket_start.is_some_and(|next| next >= target_end));
        if complete {
            out.push(trailing);
        }
    }

    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_737_388_800_000; // 2025-01-20 16:00:00 UTC, minute aligned

    fn minutes(n: i64) -> i64 {
        n * MILLIS_PER_MINUTE
    }

    fn builder(tf: Timeframe) -> CandleBuilder {
        CandleBuilder::new(tf, Symbol::new("EURUSD"), 500, GapPolicy::Skip)
    }

    #[test]
    fn test_timeframe_duration() {
        assert_eq!(Timeframe::M1.duration_millis(), 60_000);
        assert_eq!(Timeframe::H4.duration_millis(), 14_400_000);
        assert_eq!(Timeframe::D1.duration_millis(), 86_400_000);
    }

    #[test]
    fn test_bucket_alignment_example() {
        assert_eq!(Timeframe::M1.bucket_start(1_737_388_825_000), 1_737_388_800_000);
    }

    #[test]
    fn test_timeframe_alignment() {
        let ts = T0 + minutes(5) + 30_000;
        assert_eq!(Timeframe::M1.bucket_start(ts), T0 + minutes(5));
        assert_eq!(Timeframe::M5.bucket_start(ts), T0 + minutes(5));
        assert_eq!(Timeframe::M15.bucket_start(ts), T0);
    }

    #[test]
    fn test_timeframe_parse() {
        assert_eq!("M15".parse::<Timeframe>().unwrap(), Timeframe::M15);
        assert_eq!("4h".parse::<Timeframe>().unwrap(), Timeframe::H4);
        assert!("W1".parse::<Timeframe>().is_err());
        let tf: Timeframe = serde_json::from_str("\"1d\"").unwrap();
        assert_eq!(tf, Timeframe::D1);
    }

    #[test]
    fn test_divides() {
        assert!(Timeframe::M1.divides(Timeframe::H4));
        assert!(Timeframe::M5.divides(Timeframe::M15));
        assert!(!Timeframe::H4.divides(Timeframe::H1));
    }

    #[test]
    fn test_first_tick_opens_forming_bar() {
        let mut b = builder(Timeframe::M1);
        let applied = b.apply(1.1000, 1.0, T0 + 1_000);
        assert!(applied.closed.is_empty());

        let forming = b.forming().unwrap();
        assert_eq!(forming.state, BarState::Forming);
        assert_eq!(forming.open, 1.1000);
        assert_eq!(forming.high, 1.1000);
        assert_eq!(forming.low, 1.1000);
        assert_eq!(forming.close, 1.1000);
        assert_eq!(forming.bucket_start, T0);
    }

    #[test]
    fn test_forming_bar_updates_in_place() {
        let mut b = builder(Timeframe::M1);
        b.apply(1.1000, 1.0, T0);
        b.apply(1.1010, 2.0, T0 + 10_000);
        b.apply(1.0990, 3.0, T0 + 20_000);
        b.apply(1.1005, 1.0, T0 + 59_999);

        let bar = b.forming().unwrap();
        assert_eq!(bar.open, 1.1000);
        assert_eq!(bar.high, 1.1010);
        assert_eq!(bar.low, 1.0990);
        assert_eq!(bar.close, 1.1005);
        assert_eq!(bar.volume, 7.0);
        assert_eq!(bar.tick_count, 4);
        assert!(bar.is_valid());
        assert!(b.recent(10).is_empty());
    }

    #[test]
    fn test_bucket_rollover_seals_bar() {
        let mut b = builder(Timeframe::M1);
        b.apply(1.1000, 1.0, T0);
        b.apply(1.1010, 1.0, T0 + 30_000);

        let applied = b.apply(1.1020, 1.0, T0 + minutes(1));
        assert_eq!(applied.closed.len(), 1);
        let sealed = &applied.closed[0];
        assert_eq!(sealed.state, BarState::Closed);
        assert_eq!(sealed.close, 1.1010);
        assert_eq!(sealed.bucket_start, T0);

        let forming = b.forming().unwrap();
        assert_eq!(forming.bucket_start, T0 + minutes(1));
        assert_eq!(forming.open, 1.1020);
        assert_eq!(b.recent(10), vec![sealed.clone()]);
    }

    #[test]
    fn test_late_tick_does_not_touch_history() {
        let mut b = builder(Timeframe::M1);
        b.apply(1.1000, 1.0, T0);
        b.apply(1.2000, 1.0, T0 + minutes(1));
        let before = b.recent(10);

        let applied = b.apply(9.9999, 1.0, T0 + 5_000);
        assert!(applied.late);
        assert!(applied.closed.is_empty());
        assert_eq!(b.recent(10), before);
        assert_eq!(b.forming().unwrap().high, 1.2000);
    }

    #[test]
    fn test_gap_skip_leaves_hole() {
        let mut b = builder(Timeframe::M1);
        b.apply(1.0, 1.0, T0);
        let applied = b.apply(2.0, 1.0, T0 + minutes(5));
        assert_eq!(applied.closed.len(), 1);
        assert_eq!(b.recent(10).len(), 1);
    }

    #[test]
    fn test_gap_carry_forward_fills_flat_bars() {
        let mut b = CandleBuilder::new(Timeframe::M1, Symbol::new("EURUSD"), 500, GapPolicy::CarryForward);
        b.apply(1.0, 1.0, T0);
        b.apply(1.5, 1.0, T0 + 1_000);
        let applied = b.apply(2.0, 1.0, T0 + minutes(4));

        // sealed bar + 3 flat fills (minutes 1, 2, 3)
        assert_eq!(applied.closed.len(), 4);
        for (i, fill) in applied.closed.iter().skip(1).enumerate() {
            assert_eq!(fill.bucket_start, T0 + minutes(i as i64 + 1));
            assert_eq!(fill.open, 1.5);
            assert_eq!(fill.close, 1.5);
            assert_eq!(fill.volume, 0.0);
            assert_eq!(fill.tick_count, 0);
        }
    }

    #[test]
    fn test_carry_forward_caps_fills_at_capacity() {
        let mut b = CandleBuilder::new(Timeframe::M1, Symbol::new("EURUSD"), 3, GapPolicy::CarryForward);
        b.apply(1.0, 1.0, T0);
        let applied = b.apply(2.0, 1.0, T0 + minutes(100));
        assert_eq!(applied.closed.len(), 4); // sealed + 3 most recent fills
        assert_eq!(applied.closed.last().unwrap().bucket_start, T0 + minutes(99));
        assert_eq!(b.recent(10).len(), 3);
    }

    #[test]
    fn test_history_ring_evicts_oldest() {
        let mut b = CandleBuilder::new(Timeframe::M1, Symbol::new("EURUSD"), 3, GapPolicy::Skip);
        for i in 0..6 {
            b.apply(1.0 + i as f64, 1.0, T0 + minutes(i));
        }
        let recent = b.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].bucket_start, T0 + minutes(2));
        assert_eq!(recent[2].bucket_start, T0 + minutes(4));
    }

    #[test]
    fn test_range_query() {
        let mut b = builder(Timeframe::M1);
        for i in 0..10 {
            b.apply(1.0, 1.0, T0 + minutes(i));
        }
        let bars = b.range(T0 + minutes(2), T0 + minutes(5));
        let starts: Vec<i64> = bars.iter().map(|bar| bar.bucket_start).collect();
        assert_eq!(starts, vec![T0 + minutes(2), T0 + minutes(3), T0 + minutes(4)]);
    }

    #[test]
    fn test_resample_complete_buckets_only() {
        let mut b = builder(Timeframe::M1);
        // 12 minutes of data: minutes 0..=11, forming bar at minute 12
        for i in 0..=12 {
            b.apply(100.0 + i as f64, 1.0, T0 + minutes(i));
            b.apply(99.0 + i as f64, 1.0, T0 + minutes(i) + 30_000);
        }
        let source: Vec<Bar> = b.closed().cloned().collect();
        assert_eq!(source.len(), 12);

        // M5: buckets [0,5) and [5,10) complete; [10,15) only has minutes 10, 11
        let m5 = resample(&source, Timeframe::M5, None).unwrap();
        assert_eq!(m5.len(), 2);
        assert_eq!(m5[0].bucket_start, T0);
        assert_eq!(m5[0].open, 100.0);
        assert_eq!(m5[0].close, 103.0);
        assert_eq!(m5[0].high, 104.0);
        assert_eq!(m5[0].low, 99.0);
        assert_eq!(m5[0].volume, 10.0);
        assert_eq!(m5[0].tick_count, 10);
        assert!(m5.iter().all(|bar| bar.is_closed() && bar.is_valid()));
    }

    #[test]
    fn test_resample_trailing_bucket_complete_when_source_moved_on() {
        let mut b = builder(Timeframe::M1);
        for i in 0..5 {
            b.apply(1.0, 1.0, T0 + minutes(i));
        }
        let source: Vec<Bar> = b.closed().cloned().collect();
        assert_eq!(source.len(), 4); // minute 4 still forming

        let none_beyond = resample(&source, Timeframe::M5, Some(T0 + minutes(4))).unwrap();
        assert!(none_beyond.is_empty());

        let beyond = resample(&source, Timeframe::M5, Some(T0 + minutes(5))).unwrap();
        assert_eq!(beyond.len(), 1);
    }

    #[test]
    fn test_resample_rejects_non_divisible() {
        let mut b = builder(Timeframe::H4);
        b.apply(1.0, 1.0, T0);
        b.apply(1.0, 1.0, T0 + 4 * MILLIS_PER_HOUR);
        let source: Vec<Bar> = b.closed().cloned().collect();
        assert!(resample(&source, Timeframe::H1, None).is_none());
    }

    #[test]
    fn test_resample_drops_partial_leading_bucket() {
        let mut b = builder(Timeframe::M1);
        // history starts at minute 3: the [0,5) bucket is missing minutes 0..3
        for i in 3..=15 {
            b.apply(100.0 + i as f64, 1.0, T0 + minutes(i));
        }
        let source: Vec<Bar> = b.closed().cloned().collect();

        let m5 = resample(&source, Timeframe::M5, None).unwrap();
        let starts: Vec<i64> = m5.iter().map(|bar| bar.bucket_start).collect();
        assert_eq!(starts, vec![T0 + minutes(5), T0 + minutes(10)]);
        assert_eq!(m5[0].open, 105.0);
        assert_eq!(m5[0].tick_count, 5);
    }

    #[test]
    fn test_resample_single_partial_day_yields_nothing() {
        let mut b = builder(Timeframe::M1);
        // 20:00 on one day until 01:00 on the next
        let start = Timeframe::D1.bucket_start(T0) + 20 * MILLIS_PER_HOUR;
        for i in 0..=300 {
            b.apply(1.0, 1.0, start + minutes(i));
        }
        let source: Vec<Bar> = b.closed().cloned().collect();
        let next = b.forming().map(|bar| bar.bucket_start);

        let d1 = resample(&source, Timeframe::D1, next).unwrap();
        assert!(d1.is_empty());
    }

    #[test]
    fn test_merge_history_discards_forming() {
        let mut b = builder(Timeframe::M5);
        b.apply(1.0, 1.0, T0);
        b.merge_history(Vec::new());
        assert!(b.forming().is_none());
        assert!(b.recent(10).is_empty());
    }

    #[test]
    fn test_merge_history_keeps_native_bars() {
        let mut b = builder(Timeframe::M5);
        for i in 0..4 {
            b.apply(2.0, 1.0, T0 + minutes(5 * i));
        }
        assert_eq!(b.recent(10).len(), 3);

        let derived = vec![
            Bar::flat(Symbol::new("EURUSD"), Timeframe::M5, T0 - minutes(10), 1.0),
            Bar::flat(Symbol::new("EURUSD"), Timeframe::M5, T0 - minutes(5), 1.0),
            Bar::flat(Symbol::new("EURUSD"), Timeframe::M5, T0, 1.0),
        ];
        b.merge_history(derived);

        let bars = b.recent(10);
        let starts: Vec<i64> = bars.iter().map(|bar| bar.bucket_start).collect();
        assert_eq!(
            starts,
            vec![T0 - minutes(10), T0 - minutes(5), T0, T0 + minutes(5), T0 + minutes(10)]
        );
        assert_eq!(bars[2].close, 2.0);
        assert!(b.forming().is_none());
    }
}

// ── Property-Based Tests ────────────────────────────────────────────
