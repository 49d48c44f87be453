//! Events published to downstream consumers
//!
//! Two kinds: a tick update for every accepted tick and a bar close for
//! every bar sealed. Both serialize to JSON with a `type` tag.

use market_types::ids::Symbol;
use market_types::tick::Tick;
use serde::{Deserialize, Serialize};

use crate::candles::{Bar, Timeframe};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickUpdate {
    pub symbol: Symbol,
    pub bid: f64,
    pub ask: f64,
    pub timestamp: i64,
}

impl From<&Tick> for TickUpdate {
    fn from(tick: &Tick) -> Self {
        Self {
            symbol: tick.symbol.clone(),
            bid: tick.bid,
            ask: tick.ask,
            timestamp: tick.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarClose {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub bucket_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl From<&Bar> for BarClose {
    fn from(bar: &Bar) -> Self {
        Self {
            symbol: bar.symbol.clone(),
            timeframe: bar.timeframe,
            bucket_start: bar.bucket_start,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
        }
    }
}

impl BarClose {
    pub fn bucket_end(&self) -> i64 {
        self.bucket_start + self.timeframe.duration_millis()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketEvent {
    TickUpdate(TickUpdate),
    BarClose(BarClose),
}

impl MarketEvent {
    pub fn symbol(&self) -> &Symbol {
        match self {
            MarketEvent::TickUpdate(update) => &update.symbol,
            MarketEvent::BarClose(bar) => &bar.symbol,
        }
    }

    /// Event time: the tick timestamp, or the end of the closed bucket.
    pub fn timestamp(&self) -> i64 {
        match self {
            MarketEvent::TickUpdate(update) => update.timestamp,
            MarketEvent::BarClose(bar) => bar.bucket_end(),
        }
    }

    pub fn timeframe(&self) -> Option<Timeframe> {
        match self {
            MarketEvent::TickUpdate(_) => None,
            MarketEvent::BarClose(bar) => Some(bar.timeframe),
        }
    }

    /// Topic name: `ticks.{symbol}` or `bars.{symbol}.{timeframe}`.
    pub fn topic(&self) -> String {
        match self {
            MarketEvent::TickUpdate(update) => format!("ticks.{}", update.symbol),
            MarketEvent::BarClose(bar) => format!("bars.{}.{}", bar.symbol, bar.timeframe),
        }
    }

    pub fn event_type_label(&self) -> &'static str {
        match self {
            MarketEvent::TickUpdate(_) => "tick_update",
            MarketEvent::BarClose(_) => "bar_close",
        }
    }
}
