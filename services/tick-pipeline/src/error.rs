use thiserror::Error;

use crate::aggregator::AggregatorError;
use crate::config::ConfigError;
use crate::storage::StorageError;

/// Errors surfaced by the pipeline as a whole.
///
/// Per-tick problems never show up here: they are `RejectReason`s, counted
/// and returned to the submitter.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Aggregator(#[from] AggregatorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pipeline already started")]
    AlreadyStarted,

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
