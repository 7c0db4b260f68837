// =============================================================================
// Vertex — Options Vertical-Spread Trading Engine — Main Entry Point
// =============================================================================
//
// The engine starts in DRY_RUN unless the store says otherwise. Switching to
// SANDBOX_PAPER or LIVE is a settings change, never a default.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod broker;
mod clock;
mod config;
mod cycle;
mod executor;
mod monitor;
mod notify;
mod occ;
mod price_window;
mod proposals;
mod reconcile;
mod regime;
mod risk;
mod snapshot;
mod store;
mod types;

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::broker::BrokerClient;
use crate::config::{keys, EngineConfig};
use crate::notify::Notifier;
use crate::store::Store;
use crate::types::TradingMode;

/// Trade-cycle cadence during market hours.
const CYCLE_INTERVAL_SECS: u64 = 45;
/// Continuous order-sync cadence.
const ORDER_SYNC_INTERVAL_SECS: u64 = 30;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Vertex trading engine starting up");

    // ── 2. Store ─────────────────────────────────────────────────────────
    let db_path = std::env::var("VERTEX_DB_PATH").unwrap_or_else(|_| "vertex.db".to_string());
    let store = Store::open(&db_path).await?;
    seed_default_settings(&store).await?;

    let engine_config = EngineConfig::resolve(&store).await?;
    info!(
        mode = %engine_config.mode,
        max_open_positions = engine_config.max_open_positions,
        min_score = engine_config.thresholds.min_score,
        "engine configuration resolved"
    );
    if engine_config.mode == TradingMode::Live {
        warn!("LIVE TRADING MODE — REAL MONEY AT RISK");
    }

    // ── 3. Broker client ─────────────────────────────────────────────────
    let broker_token = std::env::var("VERTEX_BROKER_TOKEN").unwrap_or_default();
    let account_id = std::env::var("VERTEX_ACCOUNT_ID").unwrap_or_default();
    if broker_token.is_empty() && engine_config.mode != TradingMode::DryRun {
        warn!("VERTEX_BROKER_TOKEN is not set — broker calls will be rejected");
    }
    let broker = BrokerClient::new(broker_token, engine_config.mode);

    // ── 4. Shared state ──────────────────────────────────────────────────
    let notifier = Notifier::new(std::env::var("VERTEX_WEBHOOK_URL").ok());
    let state = Arc::new(AppState::new(store, broker, account_id, notifier));

    // ── 5. Admin API server ──────────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr = std::env::var("VERTEX_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let bind_addr_clone = bind_addr.clone();

    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr_clone)
            .await
            .expect("failed to bind API server");
        info!(addr = %bind_addr_clone, "admin API listening");
        axum::serve(listener, app).await.expect("API server failed");
    });

    // ── 6. Trade-cycle loop ──────────────────────────────────────────────
    let cycle_state = state.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(CYCLE_INTERVAL_SECS));
        loop {
            interval.tick().await;

            let now = Utc::now();
            if !clock::is_market_hours(now) {
                continue;
            }

            if let Err(e) = cycle::trade_cycle(&cycle_state, now).await {
                error!(error = %e, "trade cycle errored");
            }
        }
    });

    // ── 7. Continuous order-sync loop ────────────────────────────────────
    let sync_state = state.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(ORDER_SYNC_INTERVAL_SECS));
        loop {
            interval.tick().await;

            let config = match EngineConfig::resolve(&sync_state.store).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "config resolution failed in sync loop");
                    continue;
                }
            };
            if let Err(e) = reconcile::sync_orders(&sync_state, &config).await {
                warn!(error = %e, "order sync failed, retrying next interval");
            }
        }
    });

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping");
    info!("Vertex shut down complete");
    Ok(())
}

/// Seed sensible defaults for settings that have never been written, so a
/// fresh database boots into a safe DRY_RUN configuration.
async fn seed_default_settings(store: &Store) -> anyhow::Result<()> {
    store
        .set_setting_if_absent(keys::TRADING_MODE, TradingMode::DryRun.as_str())
        .await?;
    store.set_setting_if_absent(keys::MAX_OPEN_POSITIONS, "3").await?;
    store.set_setting_if_absent(keys::DEFAULT_TRADE_QUANTITY, "1").await?;
    store.set_setting_if_absent(keys::MIN_SCORE, "0.65").await?;
    store.set_setting_if_absent(keys::MIN_CREDIT_FRACTION, "0.18").await?;
    store.set_setting_if_absent(keys::MIN_DTE, "7").await?;
    store.set_setting_if_absent(keys::MAX_DTE, "45").await?;
    store.set_setting_if_absent(keys::DAILY_LOSS_LIMIT, "500").await?;
    Ok(())
}
