use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::NaiveDate;
use market_types::ids::Symbol;
use market_types::tick::RawTick;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::ApiError;
use crate::candles::{Bar, Timeframe};
use crate::compressor::SweepReport;
use crate::metrics::MetricsSnapshot;
use crate::monitor::{HealthReport, HealthStatus};
use crate::pipeline::Pipeline;
use crate::storage::{PartitionMeta, RotationOutcome};

const DEFAULT_BAR_LIMIT: usize = 100;

/// Symbols arrive in path form (`BTC_USDT`) or plain when they have no `/`.
fn parse_symbol(raw: &str) -> Result<Symbol, ApiError> {
    Symbol::from_path_component(raw).ok_or_else(|| ApiError::BadRequest(format!("invalid symbol: {raw}")))
}

fn parse_timeframe(raw: &str) -> Result<Timeframe, ApiError> {
    raw.parse().map_err(ApiError::BadRequest)
}

pub async fn health(State(pipeline): State<Arc<Pipeline>>) -> (StatusCode, Json<HealthReport>) {
    let report = pipeline.health();
    let status = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, Json(report))
}

pub async fn stats(State(pipeline): State<Arc<Pipeline>>) -> Json<MetricsSnapshot> {
    Json(pipeline.stats())
}

pub async fn sweep(State(pipeline): State<Arc<Pipeline>>) -> Result<Json<SweepReport>, ApiError> {
    Ok(Json(pipeline.sweep_now().await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct RotateRequest {
    pub day: Option<NaiveDate>,
}

pub async fn rotate(
    State(pipeline): State<Arc<Pipeline>>,
    Path(symbol): Path<String>,
    body: Option<Json<RotateRequest>>,
) -> Result<Json<RotationOutcome>, ApiError> {
    let symbol = parse_symbol(&symbol)?;
    let day = body.and_then(|Json(req)| req.day);
    Ok(Json(pipeline.force_rotate(symbol, day).await?))
}

pub async fn partitions(
    State(pipeline): State<Arc<Pipeline>>,
    Path(symbol): Path<String>,
) -> Result<Json<Vec<PartitionMeta>>, ApiError> {
    let symbol = parse_symbol(&symbol)?;
    Ok(Json(pipeline.list_partitions(symbol).await?))
}

#[derive(Debug, Deserialize)]
pub struct BarsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct BarsResponse {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub bars: Vec<Bar>,
    pub forming: Option<Bar>,
}

pub async fn bars(
    State(pipeline): State<Arc<Pipeline>>,
    Path((symbol, timeframe)): Path<(String, String)>,
    Query(query): Query<BarsQuery>,
) -> Result<Json<BarsResponse>, ApiError> {
    let symbol = parse_symbol(&symbol)?;
    let timeframe = parse_timeframe(&timeframe)?;
    let limit = query.limit.unwrap_or(DEFAULT_BAR_LIMIT);
    let (bars, forming) = pipeline.bars(&symbol, timeframe, limit);
    Ok(Json(BarsResponse {
        symbol,
        timeframe,
        bars,
        forming,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SwitchTimeframeRequest {
    pub timeframe: String,
}

pub async fn switch_timeframe(
    State(pipeline): State<Arc<Pipeline>>,
    Path(symbol): Path<String>,
    Json(req): Json<SwitchTimeframeRequest>,
) -> Result<Json<Value>, ApiError> {
    let symbol = parse_symbol(&symbol)?;
    let timeframe = parse_timeframe(&req.timeframe)?;
    let derived = pipeline.switch_timeframe(&symbol, timeframe)?;
    Ok(Json(json!({
        "symbol": symbol,
        "timeframe": timeframe,
        "derived_bars": derived,
    })))
}

pub async fn submit_tick(
    State(pipeline): State<Arc<Pipeline>>,
    Json(raw): Json<RawTick>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    pipeline.submit(raw)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))))
}
