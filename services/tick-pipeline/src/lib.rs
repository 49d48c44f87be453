//! Tick Pipeline
//!
//! Real-time market-data pipeline:
//! - Tick validation, deduplication and ordering
//! - Multi-timeframe OHLC aggregation
//! - Live fan-out to subscribers with bounded queues
//! - Daily-partitioned tick storage with locked rotation
//! - Background compression, archival and retention
//! - Throughput, latency and feed-health monitoring
//!
//! # Architecture
//!
//! ```text
//!        Feed adapter
//!             │
//!        ┌────▼────┐
//!        │ Ingest  │  ← validates, dedupes, shards by symbol
//!        └────┬────┘
//!             │  worker pool
//!   ┌─────────┼──────────────┐
//!   │         │              │
//! ┌─▼──────┐ ┌▼───────────┐ ┌▼────────┐
//! │Candles │ │  Storage   │ │ Monitor │
//! └─┬──────┘ └──────┬─────┘ └─────────┘
//!   │               │
//! ┌─▼───────────┐ ┌─▼──────────┐
//! │ Distributor │ │ Compressor │
//! └─────────────┘ └────────────┘
//! ```

pub mod aggregator;
pub mod api;
pub mod candles;
pub mod compressor;
pub mod config;
pub mod distributor;
pub mod error;
pub mod events;
pub mod ingestion;
pub mod metrics;
pub mod monitor;
pub mod pipeline;
pub mod storage;

pub use config::PipelineConfig;
pub use error::PipelineError;
pub use pipeline::Pipeline;

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
