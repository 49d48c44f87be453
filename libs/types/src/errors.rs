//! Tick rejection taxonomy
//!
//! Every tick refused at the ingestion boundary carries exactly one reason.
//! Reasons are counted individually so no rejection is silent.

use serde::Serialize;
use thiserror::Error;

/// Why a tick was not accepted into the pipeline.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    #[error("required field missing: {0}")]
    MissingField(&'static str),

    #[error("symbol is not valid")]
    InvalidSymbol,

    #[error("price is not a finite number")]
    NonFinitePrice,

    #[error("price must be positive")]
    NonPositivePrice,

    #[error("crossed quote: bid above ask")]
    CrossedQuote,

    #[error("volume must be a finite non-negative number")]
    InvalidVolume,

    #[error("timestamp too far in the future")]
    FutureTimestamp,

    #[error("timestamp older than the maximum tick age")]
    StaleTimestamp,

    #[error("duplicate tick within the dedup window")]
    Duplicate,

    #[error("tick arrived later than the ordering tolerance")]
    LateTick,

    #[error("ingestion queue full")]
    QueueFull,

    #[error("pipeline is not accepting ticks")]
    ShuttingDown,
}

impl RejectReason {
    /// Stable label used as a metrics key.
    pub fn label(&self) -> &'static str {
        match self {
            RejectReason::MissingField(_) => "missing_field",
            RejectReason::InvalidSymbol => "invalid_symbol",
            RejectReason::NonFinitePrice => "non_finite_price",
            RejectReason::NonPositivePrice => "non_positive_price",
            RejectReason::CrossedQuote => "crossed_quote",
            RejectReason::InvalidVolume => "invalid_volume",
            RejectReason::FutureTimestamp => "future_timestamp",
            RejectReason::StaleTimestamp => "stale_timestamp",
            RejectReason::Duplicate => "duplicate",
            RejectReason::LateTick => "late_tick",
            RejectReason::QueueFull => "queue_full",
            RejectReason::ShuttingDown => "shutting_down",
        }
    }

    /// Malformed input, as opposed to flow-control drops.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            RejectReason::MissingField(_)
                | RejectReason::InvalidSymbol
                | RejectReason::NonFinitePrice
                | RejectReason::NonPositivePrice
                | RejectReason::CrossedQuote
                | RejectReason::InvalidVolume
                | RejectReason::FutureTimestamp
                | RejectReason::StaleTimestamp
        )
    }
}
