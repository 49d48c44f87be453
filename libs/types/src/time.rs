//! Millisecond epoch helpers
//!
//! All pipeline timestamps are Unix epoch milliseconds in UTC.

use chrono::{DateTime, NaiveDate, Utc};

pub const MILLIS_PER_SECOND: i64 = 1_000;
pub const MILLIS_PER_MINUTE: i64 = 60 * MILLIS_PER_SECOND;
pub const MILLIS_PER_HOUR: i64 = 60 * MILLIS_PER_MINUTE;
pub const MILLIS_PER_DAY: i64 = 24 * MILLIS_PER_HOUR;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Floor `timestamp` to a multiple of `interval` (both in ms).
///
/// Uses Euclidean division so pre-epoch timestamps floor downwards too.
pub fn align_down(timestamp: i64, interval: i64) -> i64 {
    timestamp.div_euclid(interval) * interval
}

/// Calendar day a timestamp belongs to, for a day boundary `offset_ms`
/// after midnight UTC.
pub fn day_of(timestamp: i64, offset_ms: i64) -> NaiveDate {
    let shifted = timestamp - offset_ms;
    let days = shifted.div_euclid(MILLIS_PER_DAY);
    epoch_day(days)
}

/// First millisecond of `day` under the same boundary convention.
pub fn day_start_millis(day: NaiveDate, offset_ms: i64) -> i64 {
    let days = day.signed_duration_since(epoch_day(0)).num_days();
    days * MILLIS_PER_DAY + offset_ms
}

/// Convert epoch milliseconds to a UTC datetime, if representable.
pub fn to_datetime(timestamp: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(timestamp)
}

fn epoch_day(days: i64) -> NaiveDate {
    NaiveDate::default() + chrono::Duration::days(days)
}


// ── Property-Based Tests ────────────────────────────────────────────
