// =============================================================================
// REST API Endpoints — Axum 0.7 admin and monitoring surface
// =============================================================================
//
// Read endpoints are open; mutating endpoints require the Bearer token.
// Mutations never touch engine state directly — they enqueue AdminCommands
// onto the manager's event stream and answer 202.
//
// Errors use the typed shape {status, code, message, timestamp}.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::engine::{AdminCommand, EngineEvent};
use crate::types::ExecutionMode;

// =============================================================================
// Error shape
// =============================================================================

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "ENGINE_UNAVAILABLE",
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "BAD_REQUEST",
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "status": self.status.as_u16(),
            "code": self.code,
            "message": self.message,
            "timestamp": Utc::now(),
        });
        (self.status, Json(body)).into_response()
    }
}

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Read surface ────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        .route("/api/v1/portfolio", get(portfolio))
        .route("/api/v1/trades/active", get(active_trade))
        .route("/api/v1/trades/completed", get(completed_trades))
        .route("/api/v1/watchlist", get(watchlist))
        .route("/api/v1/risk", get(risk_status))
        .route("/api/v1/hours", get(hours_status))
        // ── Mutating surface (authenticated) ────────────────────────
        .route("/api/v1/control/breaker/trip", post(trip_breaker))
        .route("/api/v1/control/breaker/reset", post(reset_breaker))
        .route("/api/v1/control/force-close", post(force_close))
        .route("/api/v1/control/mode", post(set_mode))
        .route("/api/v1/control/ack-exit-failure", post(ack_exit_failure))
        // ── SSE stream ──────────────────────────────────────────────
        .route("/api/v1/stream", get(crate::api::sse::stream))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Read handlers
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "stateVersion": state.current_state_version(),
        "serverTime": Utc::now().timestamp_millis(),
        "uptimeSecs": state.start_time.elapsed().as_secs(),
    }))
}

async fn portfolio(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.portfolio_overview())
}

async fn active_trade(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.active_trade.read().clone())
}

async fn completed_trades(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.completed_trades.read().clone())
}

async fn watchlist(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.watchlist.summaries())
}

async fn risk_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let portfolio = state.portfolio.read();
    let config = state.runtime_config.read();
    Json(serde_json::json!({
        "circuitBreakerTripped": portfolio.circuit_breaker_tripped,
        "circuitBreakerReason": portfolio.circuit_breaker_reason,
        "dailyRealizedPnl": portfolio.daily_realized_pnl,
        "drawdown": portfolio.drawdown(),
        "totalExposure": portfolio.total_exposure(),
        "limits": {
            "maxDailyLoss": config.max_daily_loss,
            "maxDrawdown": config.max_drawdown,
            "maxExposurePct": config.max_exposure_pct,
            "maxPositionRisk": config.max_position_risk,
            "minRr": config.effective_min_rr(),
            "safeReset": config.safe_reset,
        },
        "recentEvents": state.recent_risk_events.read().clone(),
    }))
}

async fn hours_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.hours.status(Utc::now()))
}

// =============================================================================
// Mutating handlers
// =============================================================================

fn enqueue(state: &AppState, command: AdminCommand) -> Result<Response, ApiError> {
    state
        .engine_tx
        .send(EngineEvent::Admin(command))
        .map_err(|_| ApiError::unavailable("engine event stream closed"))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "accepted": true, "timestamp": Utc::now() })),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TripBreakerBody {
    reason: Option<String>,
}

async fn trip_breaker(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(body): Json<TripBreakerBody>,
) -> Result<Response, ApiError> {
    let reason = body.reason.unwrap_or_else(|| "operator action".to_string());
    info!(reason = %reason, "breaker trip requested via API");
    enqueue(&state, AdminCommand::TripBreaker { reason })
}

async fn reset_breaker(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    info!("breaker reset requested via API");
    enqueue(&state, AdminCommand::ResetBreaker)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForceCloseBody {
    trade_id: String,
    reason: Option<String>,
}

async fn force_close(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(body): Json<ForceCloseBody>,
) -> Result<Response, ApiError> {
    if body.trade_id.is_empty() {
        return Err(ApiError::bad_request("tradeId is required"));
    }
    info!(trade_id = %body.trade_id, "force close requested via API");
    enqueue(
        &state,
        AdminCommand::ForceClose {
            trade_id: body.trade_id,
            reason: body.reason.unwrap_or_else(|| "operator action".to_string()),
        },
    )
}

#[derive(Debug, Deserialize)]
struct SetModeBody {
    mode: ExecutionMode,
}

async fn set_mode(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(body): Json<SetModeBody>,
) -> Result<Response, ApiError> {
    info!(mode = %body.mode, "execution mode change requested via API");
    enqueue(&state, AdminCommand::SetMode(body.mode))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AckExitFailureBody {
    trade_id: String,
}

async fn ack_exit_failure(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(body): Json<AckExitFailureBody>,
) -> Result<Response, ApiError> {
    if body.trade_id.is_empty() {
        return Err(ApiError::bad_request("tradeId is required"));
    }
    enqueue(
        &state,
        AdminCommand::AcknowledgeExitFailure {
            trade_id: body.trade_id,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_config::RuntimeConfig;
    use tokio::sync::mpsc;

    fn state_with_rx() -> (Arc<AppState>, mpsc::UnboundedReceiver<EngineEvent>) {
        let mut config = RuntimeConfig::default();
        config.kv_snapshot_path = String::new();
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(AppState::new(config, tx)), rx)
    }

    #[tokio::test]
    async fn mutations_enqueue_admin_commands() {
        let (state, mut rx) = state_with_rx();

        enqueue(&state, AdminCommand::ResetBreaker).unwrap();
        match rx.try_recv().unwrap() {
            EngineEvent::Admin(AdminCommand::ResetBreaker) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn enqueue_fails_when_engine_gone() {
        let (state, rx) = state_with_rx();
        drop(rx);
        let err = enqueue(&state, AdminCommand::ResetBreaker).unwrap_err();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn api_error_shape() {
        let err = ApiError::bad_request("tradeId is required");
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
