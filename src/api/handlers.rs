//! HTTP API handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use metrics_exporter_prometheus::PrometheusHandle;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::engine::EngineHandle;
use crate::error::{EngineError, OrderError, PositionError};
use crate::trading::order::{Order, OrderRequest};
use crate::trading::position::{Direction, Position, PositionStatus};
use crate::trading::tracker::PositionTracker;

/// Application state shared with handlers.
#[derive(Clone)]
pub struct AppState {
    /// Whether recovery finished and the engine loop is running.
    pub ready: Arc<AtomicBool>,
    /// Position state, read directly.
    pub tracker: Arc<PositionTracker>,
    /// Commands into the engine loop.
    pub engine: EngineHandle,
    /// Prometheus renderer, when the recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Create new app state.
    pub fn new(
        tracker: Arc<PositionTracker>,
        engine: EngineHandle,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
            tracker,
            engine,
            metrics,
        }
    }

    /// Set ready state.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Check if ready.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Engine errors as HTTP responses.
#[derive(Debug)]
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::Position(PositionError::NotFound(_)) => StatusCode::NOT_FOUND,
            EngineError::Position(_) => StatusCode::CONFLICT,
            EngineError::Order(OrderError::Validation(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::Order(OrderError::RiskRejected(_)) => StatusCode::FORBIDDEN,
            EngineError::Order(_) => StatusCode::BAD_GATEWAY,
            EngineError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self.0, "API request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Status: "ok".
    pub status: &'static str,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    /// Whether service is ready.
    pub ready: bool,
    /// Positions currently tracked.
    pub positions: usize,
}

/// Position as shown to operators.
#[derive(Debug, Serialize)]
pub struct PositionView {
    /// Market condition id.
    pub condition_id: String,
    /// Held outcome.
    pub direction: Direction,
    /// Lifecycle state.
    pub status: PositionStatus,
    /// Entry price.
    pub entry_price: Decimal,
    /// Shares held.
    pub size: Decimal,
    /// Payout if won, once settled.
    pub expected_payout: Option<Decimal>,
    /// Realized PnL, once settled.
    pub pnl: Option<Decimal>,
    /// Number of redemption attempts.
    pub attempts: usize,
    /// Outcome of the most recent attempt.
    pub last_outcome: Option<String>,
    /// Operator acknowledged the failure.
    pub acknowledged: bool,
}

impl From<&Position> for PositionView {
    fn from(p: &Position) -> Self {
        Self {
            condition_id: p.condition_id.clone(),
            direction: p.direction,
            status: p.status,
            entry_price: p.entry_price,
            size: p.size,
            expected_payout: p.expected_payout(),
            pnl: p.pnl(),
            attempts: p.redemption_attempts.len(),
            last_outcome: p.redemption_attempts.last().map(|a| a.outcome.to_string()),
            acknowledged: p.acknowledged,
        }
    }
}

/// Settlement signal body.
#[derive(Debug, Deserialize)]
pub struct SettlementRequest {
    /// Resolved market.
    pub condition_id: String,
    /// Winning outcome.
    pub winner: Direction,
}

/// Settlement signal answer.
#[derive(Debug, Serialize)]
pub struct SettlementResponse {
    /// Whether a redemption was started.
    pub redeeming: bool,
}

/// Cancel answer.
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    /// Whether a running redemption was signalled.
    pub cancelled: bool,
}

/// Health check handler - always returns 200.
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

/// Readiness check handler - returns 200 if ready, 503 otherwise.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let response = ReadyResponse {
        ready: state.is_ready(),
        positions: state.tracker.positions().len(),
    };

    if response.ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Prometheus exposition.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed".to_string()),
    }
}

/// All tracked positions.
pub async fn list_positions(State(state): State<AppState>) -> Json<Vec<PositionView>> {
    Json(state.tracker.positions().iter().map(PositionView::from).collect())
}

/// One position with its full attempt history.
pub async fn get_position(
    State(state): State<AppState>,
    Path(condition_id): Path<String>,
) -> Result<Json<Position>, ApiError> {
    state
        .tracker
        .get(&condition_id)
        .map(Json)
        .ok_or_else(|| EngineError::from(PositionError::NotFound(condition_id)).into())
}

/// Operator retry of a failed redemption.
pub async fn retry_position(
    State(state): State<AppState>,
    Path(condition_id): Path<String>,
) -> Result<Json<PositionView>, ApiError> {
    let position = state.engine.retry(&condition_id).await?;
    Ok(Json(PositionView::from(&position)))
}

/// Stop a running redemption after its current tier.
pub async fn cancel_redemption(
    State(state): State<AppState>,
    Path(condition_id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let cancelled = state.engine.cancel_redemption(&condition_id).await?;
    Ok(Json(CancelResponse { cancelled }))
}

/// Acknowledge a failed redemption so it can be archived.
pub async fn acknowledge_position(
    State(state): State<AppState>,
    Path(condition_id): Path<String>,
) -> Result<Json<PositionView>, ApiError> {
    let position = state.tracker.acknowledge(&condition_id)?;
    Ok(Json(PositionView::from(&position)))
}

/// Market settlement signal.
pub async fn settle_market(
    State(state): State<AppState>,
    Json(request): Json<SettlementRequest>,
) -> Result<Json<SettlementResponse>, ApiError> {
    let redeeming = state
        .engine
        .market_settled(&request.condition_id, request.winner)
        .await?;
    Ok(Json(SettlementResponse { redeeming }))
}

/// Submit an order.
pub async fn submit_order(
    State(state): State<AppState>,
    Json(request): Json<OrderRequest>,
) -> Result<(StatusCode, Json<Order>), ApiError> {
    let order = state.engine.submit_order(request).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// Cancel an order.
pub async fn cancel_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.engine.cancel_order(&order_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
