//! Pipeline configuration
//!
//! Loaded from a JSON file; every field has a default so a partial file (or
//! none at all) is valid. `validate()` rejects combinations the pipeline
//! cannot run with.

use std::fs;
use std::path::{Path, PathBuf};

use market_types::time::MILLIS_PER_DAY;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregator::AggregatorConfig;
use crate::compressor::CompressionConfig;
use crate::distributor::DistributorConfig;
use crate::ingestion::IngesterConfig;
use crate::monitor::MonitorConfig;
use crate::storage::StorageConfig;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "TICK_PIPELINE_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// HTTP control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub ingestion: IngesterConfig,
    pub aggregation: AggregatorConfig,
    pub distribution: DistributorConfig,
    pub storage: StorageConfig,
    pub compression: CompressionConfig,
    pub monitor: MonitorConfig,
    pub api: ApiConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long workers get to drain their queues.
    pub drain_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 10_000,
        }
    }
}

impl PipelineConfig {
    /// Load and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_slice(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Config from `path`, else `$TICK_PIPELINE_CONFIG`, else defaults.
    pub fn resolve(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        match path.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from)) {
            Some(path) => Self::load(&path),
            None => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        let ingest = &self.ingestion;
        if ingest.worker_count == 0 {
            return invalid("ingestion.worker_count must be at least 1");
        }
        if ingest.queue_capacity == 0 {
            return invalid("ingestion.queue_capacity must be at least 1");
        }
        if ingest.dedup_window_ms < 0 || ingest.late_tolerance_ms < 0 || ingest.max_future_skew_ms < 0 {
            return invalid("ingestion windows must be non-negative");
        }
        if ingest.max_tick_age_ms.is_some_and(|age| age <= 0) {
            return invalid("ingestion.max_tick_age_ms must be positive when set");
        }
        if !(ingest.price_spike_threshold.is_finite() && ingest.price_spike_threshold > 0.0) {
            return invalid("ingestion.price_spike_threshold must be a positive number");
        }

        if self.aggregation.timeframes.is_empty() {
            return invalid("aggregation.timeframes must not be empty");
        }
        if self.aggregation.history_capacity == 0 {
            return invalid("aggregation.history_capacity must be at least 1");
        }

        if self.distribution.subscriber_queue_capacity == 0 {
            return invalid("distribution.subscriber_queue_capacity must be at least 1");
        }

        let storage = &self.storage;
        if !(0..MILLIS_PER_DAY).contains(&storage.day_boundary_offset_ms) {
            return invalid("storage.day_boundary_offset_ms must be within one day");
        }
        if storage.lock_timeout_ms == 0 {
            return invalid("storage.lock_timeout_ms must be positive");
        }
        if storage.flush_interval_ms == 0 {
            return invalid("storage.flush_interval_ms must be positive");
        }

        let compression = &self.compression;
        if compression.concurrency == 0 {
            return invalid("compression.concurrency must be at least 1");
        }
        if compression.interval_secs == 0 {
            return invalid("compression.interval_secs must be positive");
        }
        if compression.compress_after_days < 1 {
            return invalid("compression.compress_after_days must be at least 1");
        }
        if let Some(archive) = compression.archive_after_days {
            if archive < compression.compress_after_days {
                return invalid("compression.archive_after_days must not precede compress_after_days");
            }
        }
        if let Some(retention) = compression.retention_days {
            let floor = compression
                .archive_after_days
                .unwrap_or(compression.compress_after_days);
            if retention < floor {
                return invalid("compression.retention_days must not precede earlier tiers");
            }
        }

        if self.monitor.interval_ms == 0 || self.monitor.stale_after_ms <= 0 {
            return invalid("monitor intervals must be positive");
        }

        if self.api.enabled && self.api.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            return invalid("api.bind_addr must be a socket address");
        }

        Ok(())
    }
}
