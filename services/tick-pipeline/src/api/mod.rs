//! HTTP status and control surface

mod error;
mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::pipeline::Pipeline;

pub use error::ApiError;
pub use handlers::{BarsResponse, RotateRequest};

pub fn create_router(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/stats", get(handlers::stats))
        .route("/compression/sweep", post(handlers::sweep))
        .route("/partitions/:symbol", get(handlers::partitions))
        .route("/partitions/:symbol/rotate", post(handlers::rotate))
        .route("/bars/:symbol/:timeframe", get(handlers::bars))
        .route("/symbols/:symbol/timeframe", put(handlers::switch_timeframe))
        .route("/ticks", post(handlers::submit_tick))
        .layer(TraceLayer::new_for_http())
        .with_state(pipeline)
}
