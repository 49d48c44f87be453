//! Price tick types
//!
//! `RawTick` is what a feed adapter hands to the pipeline: every field is
//! optional so that missing data can be rejected with a precise reason.
//! `Tick` is the validated form used by every downstream stage.

use serde::{Deserialize, Serialize};

use crate::ids::Symbol;

/// Unvalidated tick as received from a feed adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawTick {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub bid: Option<f64>,
    #[serde(default)]
    pub ask: Option<f64>,
    /// Epoch milliseconds.
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub source: Option<String>,
}

impl RawTick {
    /// Fully populated raw tick.
    pub fn new(
        symbol: impl Into<String>,
        bid: f64,
        ask: f64,
        timestamp: i64,
        volume: Option<f64>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            symbol: Some(symbol.into()),
            bid: Some(bid),
            ask: Some(ask),
            timestamp: Some(timestamp),
            volume,
            source: Some(source.into()),
        }
    }
}

/// A validated bid/ask observation.
///
/// Invariant: `0 < bid <= ask`, both finite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: Symbol,
    pub bid: f64,
    pub ask: f64,
    /// Epoch milliseconds.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    pub source: String,
}

impl Tick {
    /// Mid price used for bar fields.
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }

    /// Identity used to absorb feed retransmits.
    pub fn fingerprint(&self) -> TickFingerprint {
        TickFingerprint {
            timestamp: self.timestamp,
            bid_bits: self.bid.to_bits(),
            ask_bits: self.ask.to_bits(),
        }
    }
}

/// Per-symbol dedup key: (timestamp, bid, ask) compared bit-exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TickFingerprint {
    pub timestamp: i64,
    pub bid_bits: u64,
    pub ask_bits: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(bid: f64, ask: f64) -> Tick {
        Tick {
            symbol: Symbol::new("EURUSD"),
            bid,
            ask,
            timestamp: 1_737_388_825_000,
            volume: None,
            source: "OANDA".to_string(),
        }
    }

    #[test]
    fn test_mid_and_spread() {
        let t = tick(1.0, 1.5);
        assert_eq!(t.mid(), 1.25);
        assert_eq!(t.spread(), 0.5);
    }

    #[test]
    fn test_fingerprint_equality() {
        assert_eq!(tick(1.1, 1.2).fingerprint(), tick(1.1, 1.2).fingerprint());
        assert_ne!(tick(1.1, 1.2).fingerprint(), tick(1.1, 1.3).fingerprint());
    }

    #[test]
    fn test_raw_tick_missing_fields_deserialize() {
        let raw: RawTick = serde_json::from_str(r#"{"symbol":"EURUSD","bid":1.1}"#).unwrap();
        assert_eq!(raw.symbol.as_deref(), Some("EURUSD"));
        assert_eq!(raw.ask, None);
        assert_eq!(raw.timestamp, None);
    }

    #[test]
    fn test_tick_serialization_skips_missing_volume() {
        let json = serde_json::to_string(&tick(1.1, 1.2)).unwrap();
        assert!(!json.contains("volume"));
        let back: Tick = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tick(1.1, 1.2));
    }
}
