// =============================================================================
// Ingestion HTTP surface — §6.1
// =============================================================================
//
// `POST /broadcast-trade`, `POST /execute-trade`, `POST /heartbeat`, and
// `GET /health` are the only routes this engine exposes; everything else
// (auth, subscriptions, the dashboard read API) lives in collaborators this
// repo doesn't own (§1 out-of-scope list). Built the way the original's
// `api/rest.rs` built its route table — one `Router` assembled in `router()`,
// CORS layered on top — but trimmed to this surface and with the rate-limit
// middleware applied per route class instead of globally.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{info, instrument};

use crate::app_state::AppState;
use crate::dispatcher::BroadcastResponse;
use crate::middleware::rate_limit::{self, RateLimiter};
use crate::types::TradeIntent;

use super::auth::{ApiKeyAuth, JwtAuth};

pub fn router(state: Arc<AppState>) -> Router {
    let broadcast_limiter = RateLimiter::broadcast();
    let trade_limiter = RateLimiter::trade();

    let broadcast_route = Router::new()
        .route("/broadcast-trade", post(broadcast_trade))
        .layer(axum::middleware::from_fn_with_state(broadcast_limiter, rate_limit::enforce));

    let trade_route = Router::new()
        .route("/execute-trade", post(execute_trade))
        .layer(axum::middleware::from_fn_with_state(trade_limiter, rate_limit::enforce));

    Router::new()
        .route("/health", get(health))
        .route("/heartbeat", post(heartbeat))
        .merge(broadcast_route)
        .merge(trade_route)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// =============================================================================
// GET /health
// =============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.uptime_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// POST /heartbeat — role MONITOR, unlimited rate, no trading effect
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatPayload {
    #[allow(dead_code)]
    status: String,
    #[allow(dead_code)]
    ai_status: String,
}

#[instrument(skip(state, _auth, payload))]
async fn heartbeat(
    State(state): State<Arc<AppState>>,
    _auth: ApiKeyAuth,
    Json(payload): Json<HeartbeatPayload>,
) -> impl IntoResponse {
    let now = chrono::Utc::now().timestamp_millis();
    state.record_heartbeat(now);
    info!(status = %payload.status, ai_status = %payload.ai_status, "heartbeat received");
    StatusCode::NO_CONTENT
}

// =============================================================================
// POST /broadcast-trade — role MONITOR, 10/min/IP
// =============================================================================

#[instrument(skip(state, _auth, intent), fields(symbol = %intent.symbol))]
async fn broadcast_trade(
    State(state): State<Arc<AppState>>,
    _auth: ApiKeyAuth,
    Json(intent): Json<TradeIntent>,
) -> impl IntoResponse {
    let response: BroadcastResponse = state.dispatcher.broadcast(intent).await;
    Json(response)
}

// =============================================================================
// POST /execute-trade — role USER, 30/min/IP, user inferred from JWT
// =============================================================================

#[derive(Debug, Serialize)]
struct ExecuteResponse {
    status: &'static str,
    detail: String,
    trade_id: Option<uuid::Uuid>,
}

#[instrument(skip(state, auth, intent), fields(user_id = %auth.user_id, symbol = %intent.symbol))]
async fn execute_trade(
    State(state): State<Arc<AppState>>,
    auth: JwtAuth,
    Json(intent): Json<TradeIntent>,
) -> impl IntoResponse {
    let user = match state.user_store.get(auth.user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(ExecuteResponse { status: "REJECTED".into(), detail: "user not found".into(), trade_id: None }),
            )
                .into_response();
        }
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ExecuteResponse { status: "REJECTED".into(), detail: e.to_string(), trade_id: None }),
            )
                .into_response();
        }
    };

    let Some(creds) = user.credentials else {
        return (
            StatusCode::FORBIDDEN,
            Json(ExecuteResponse { status: "REJECTED".into(), detail: "no exchange credentials on file".into(), trade_id: None }),
        )
            .into_response();
    };

    let global = state.config.read().clone();
    let config = crate::config::resolve_effective_config(&global, Some(&user.overrides));
    let session_timezone = global.session_timezone.clone();

    match state
        .orchestrator
        .execute_for_user(auth.user_id, &creds, &config, intent, &session_timezone)
        .await
    {
        Ok(outcome) => Json(ExecuteResponse { status: "ACCEPTED".into(), detail: outcome.summary, trade_id: outcome.trade_id })
            .into_response(),
        Err(e) => e.into_response(),
    }
}
