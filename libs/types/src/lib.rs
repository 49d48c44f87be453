//! Types library for the market-data pipeline
//!
//! Core definitions shared by the ingestion, aggregation, storage and
//! distribution layers.
//!
//! # Modules
//! - `ids`: Identifiers (Symbol, SubscriberId)
//! - `tick`: Raw and validated price ticks
//! - `time`: Millisecond epoch helpers
//! - `errors`: Tick rejection taxonomy

pub mod errors;
pub mod ids;
pub mod tick;
pub mod time;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::errors::*;
    pub use crate::ids::*;
    pub use crate::tick::*;
    pub use crate::time::*;
}
