use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use market_types::errors::RejectReason;
use serde_json::json;
use thiserror::Error;

use crate::aggregator::AggregatorError;
use crate::error::PipelineError;
use crate::storage::StorageError;

/// Error returned by HTTP handlers, rendered as `{error, message}` JSON.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Tick rejected: {0}")]
    Rejected(RejectReason),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Storage(StorageError::PartitionNotFound { symbol, day }) => {
                ApiError::NotFound(format!("partition {symbol}/{day}"))
            }
            PipelineError::Storage(e @ StorageError::RotationTooFarAhead { .. }) => {
                ApiError::BadRequest(e.to_string())
            }
            PipelineError::Storage(e) if e.is_lock_timeout() => ApiError::ServiceUnavailable(e.to_string()),
            PipelineError::Aggregator(AggregatorError::UnknownSymbol(symbol)) => {
                ApiError::NotFound(format!("no bars for {symbol}"))
            }
            PipelineError::Aggregator(e @ AggregatorError::NoSourceTimeframe { .. }) => {
                ApiError::Conflict(e.to_string())
            }
            other => ApiError::Internal(other.into()),
        }
    }
}

impl From<RejectReason> for ApiError {
    fn from(reason: RejectReason) -> Self {
        match reason {
            RejectReason::QueueFull | RejectReason::ShuttingDown => {
                ApiError::ServiceUnavailable(reason.to_string())
            }
            reason => ApiError::Rejected(reason),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, code) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, "BAD_REQUEST"),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, "NOT_FOUND"),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg, "CONFLICT"),
            ApiError::Rejected(reason) => {
                let body = Json(json!({
                    "error": "TICK_REJECTED",
                    "message": reason.to_string(),
                    "reason": reason.label(),
                }));
                return (StatusCode::UNPROCESSABLE_ENTITY, body).into_response();
            }
            ApiError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, msg, "SERVICE_UNAVAILABLE")
            }
            ApiError::Internal(err) => {
                tracing::error!(error = %err, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    "INTERNAL_ERROR",
                )
            }
        };

        let body = Json(json!({
            "error": code,
            "message": message
        }));

        (status, body).into_response()
    }
}
