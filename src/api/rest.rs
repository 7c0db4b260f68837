// =============================================================================
// Admin REST API — Axum
// =============================================================================
//
// All endpoints live under `/api/v1/`. The health endpoint is public; every
// other endpoint admits through the `AdminAuth` extractor, which validates
// the bearer token and resolves the engine configuration the handler then
// acts under. All mutating endpoints are idempotent under repeated calls,
// and system-mode writes are refused outright while TRADING_MODE is LIVE.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AdminAuth;
use crate::app_state::AppState;
use crate::monitor;
use crate::proposals;
use crate::risk;
use crate::types::{SystemMode, TradingMode};

/// Build the full REST router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated reads ─────────────────────────────────────
        .route("/api/v1/state", get(engine_state))
        .route("/api/v1/trades", get(trades))
        .route("/api/v1/proposals", get(recent_proposals))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/logs", get(system_logs))
        .route("/api/v1/gainloss", get(gain_loss))
        // ── Authenticated admin actions ─────────────────────────────
        .route("/api/v1/system-mode", post(set_system_mode))
        .route("/api/v1/risk/reset", post(reset_risk))
        .route("/api/v1/portfolio/repair", post(repair_portfolio))
        .route("/api/v1/proposals/run", post(run_proposal_once))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "uptime_secs": state.uptime_secs(),
        "server_time": Utc::now().to_rfc3339(),
    }))
}

// =============================================================================
// Engine state (authenticated)
// =============================================================================

async fn engine_state(
    auth: AdminAuth,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let config = auth.config;
    let system_mode = match risk::system_mode(&state.store).await {
        Ok(m) => m,
        Err(e) => return internal_error(e),
    };
    let open_count = state.store.count_active_trades().await.unwrap_or(0);
    let open_orders = state
        .store
        .open_orders()
        .await
        .map(|o| o.len())
        .unwrap_or(0);
    let proposal_count = state.store.count_proposals().await.unwrap_or(0);
    let broker_event_count = state.store.count_broker_events().await.unwrap_or(0);
    let heartbeat = state
        .store
        .get_setting(crate::config::keys::LAST_TRADE_CYCLE_HEARTBEAT)
        .await
        .ok()
        .flatten();
    let last_error = state
        .store
        .get_setting(crate::config::keys::LAST_TRADE_CYCLE_ERROR)
        .await
        .ok()
        .flatten();

    Json(serde_json::json!({
        "trading_mode": config.mode.as_str(),
        "system_mode": system_mode.as_str(),
        "regime": state.regime.current().map(|r| r.as_str()),
        "open_trades": open_count,
        "open_orders": open_orders,
        "proposal_count": proposal_count,
        "broker_event_count": broker_event_count,
        "max_open_positions": config.max_open_positions,
        "last_trade_cycle_heartbeat": heartbeat,
        "last_trade_cycle_error": last_error,
        "uptime_secs": state.uptime_secs(),
    }))
    .into_response()
}

async fn positions(_auth: AdminAuth, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.all_positions().await {
        Ok(positions) => Json(positions).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn system_logs(_auth: AdminAuth, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.recent_system_logs(100).await {
        Ok(logs) => Json(logs).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn gain_loss(_auth: AdminAuth, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let end = crate::clock::eastern_date(Utc::now());
    let start = end - chrono::Duration::days(30);
    match state
        .broker
        .get_gain_loss(&state.account_id, start, end)
        .await
    {
        Ok(items) => Json(items).into_response(),
        Err(e) => internal_error(anyhow::anyhow!(e)),
    }
}

async fn trades(_auth: AdminAuth, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.recent_trades(100).await {
        Ok(trades) => Json(trades).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn recent_proposals(
    _auth: AdminAuth,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match state.store.recent_proposals(100).await {
        Ok(proposals) => Json(proposals).into_response(),
        Err(e) => internal_error(e),
    }
}

// =============================================================================
// System mode (authenticated; disabled in LIVE)
// =============================================================================

#[derive(Deserialize)]
struct SystemModeRequest {
    mode: String,
    reason: Option<String>,
}

async fn set_system_mode(
    auth: AdminAuth,
    State(state): State<Arc<AppState>>,
    Json(request): Json<SystemModeRequest>,
) -> impl IntoResponse {
    // Mode flips over HTTP are a paper-trading affordance only.
    if auth.config.mode == TradingMode::Live {
        warn!("system-mode write rejected: engine is LIVE");
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({ "error": "system-mode writes are disabled in LIVE mode" })),
        )
            .into_response();
    }

    let new_mode: SystemMode = match request.mode.parse() {
        Ok(m) => m,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e })),
            )
                .into_response();
        }
    };

    let reason = request.reason.unwrap_or_else(|| "admin request".to_string());
    match risk::set_system_mode(&state.store, new_mode, &reason, None).await {
        Ok(changed) => {
            info!(mode = %new_mode, changed, "system mode set via API");
            Json(serde_json::json!({ "mode": new_mode.as_str(), "changed": changed }))
                .into_response()
        }
        Err(e) => internal_error(e),
    }
}

async fn reset_risk(_auth: AdminAuth, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match risk::reset_risk_state(&state.store).await {
        Ok(()) => Json(serde_json::json!({ "risk_state": "NORMAL" })).into_response(),
        Err(e) => internal_error(e),
    }
}

// =============================================================================
// Manual triggers (authenticated)
// =============================================================================

async fn repair_portfolio(
    auth: AdminAuth,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match monitor::repair_portfolio(&state, &auth.config, Utc::now()).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn run_proposal_once(
    _auth: AdminAuth,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let outcome = proposals::generate_proposal(&state, Utc::now()).await;
    Json(serde_json::json!({
        "proposal": outcome.proposal,
        "candidate_score": outcome.candidate.map(|c| c.breakdown.composite),
    }))
    .into_response()
}

fn internal_error(e: anyhow::Error) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": e.to_string() })),
    )
        .into_response()
}
