// =============================================================================
// Durable store — sqlite via sqlx
// =============================================================================
//
// The store is the single source of durable truth. Broker state is
// reconciled into it once per sync; every mutation goes through the typed
// methods below so status monotonicity is enforced in exactly one place.
// =============================================================================

pub mod models;

mod logs;
mod orders;
mod portfolio;
mod proposals;
mod settings;
mod trades;

use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

/// Schema, applied idempotently at startup. One statement per entry.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS trades (
        id TEXT PRIMARY KEY,
        proposal_id TEXT NOT NULL,
        symbol TEXT NOT NULL,
        expiration TEXT NOT NULL,
        strategy TEXT NOT NULL,
        short_strike REAL NOT NULL,
        long_strike REAL NOT NULL,
        width REAL NOT NULL,
        quantity INTEGER NOT NULL,
        entry_price REAL,
        exit_price REAL,
        max_profit REAL,
        max_loss REAL,
        realized_pnl REAL,
        max_seen_profit_fraction REAL NOT NULL DEFAULT 0,
        iv_entry REAL,
        status TEXT NOT NULL,
        exit_reason TEXT,
        broker_order_id_open TEXT,
        broker_order_id_close TEXT,
        opened_at TEXT,
        closed_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS proposals (
        id TEXT PRIMARY KEY,
        symbol TEXT NOT NULL,
        expiration TEXT NOT NULL,
        short_strike REAL NOT NULL,
        long_strike REAL NOT NULL,
        width REAL NOT NULL,
        quantity INTEGER NOT NULL,
        strategy TEXT NOT NULL,
        credit_target REAL NOT NULL,
        score REAL NOT NULL,
        score_ivr REAL NOT NULL DEFAULT 0,
        score_vertical_skew REAL NOT NULL DEFAULT 0,
        score_term_structure REAL NOT NULL DEFAULT 0,
        score_delta_fitness REAL NOT NULL DEFAULT 0,
        score_ev REAL NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        kind TEXT NOT NULL,
        linked_trade_id TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS orders (
        id TEXT PRIMARY KEY,
        proposal_id TEXT NOT NULL,
        trade_id TEXT,
        side TEXT NOT NULL,
        client_order_id TEXT NOT NULL UNIQUE,
        broker_order_id TEXT,
        status TEXT NOT NULL,
        avg_fill_price REAL,
        filled_quantity REAL,
        remaining_quantity REAL,
        snapshot_id TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_orders_broker_id ON orders (broker_order_id)",
    "CREATE TABLE IF NOT EXISTS portfolio_positions (
        symbol TEXT NOT NULL,
        expiration TEXT NOT NULL,
        option_type TEXT NOT NULL,
        strike REAL NOT NULL,
        side TEXT NOT NULL,
        quantity INTEGER NOT NULL,
        cost_basis_per_contract REAL,
        bid REAL,
        ask REAL,
        last REAL,
        snapshot_id TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (symbol, expiration, option_type, strike, side)
    )",
    "CREATE TABLE IF NOT EXISTS snapshots (
        id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL,
        as_of TEXT NOT NULL,
        position_count INTEGER NOT NULL,
        order_count INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS account_balances (
        snapshot_id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL,
        cash REAL NOT NULL,
        buying_power REAL NOT NULL,
        equity REAL NOT NULL,
        margin_requirement REAL NOT NULL,
        as_of TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS risk_state (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS broker_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        operation TEXT NOT NULL,
        symbol TEXT,
        expiration TEXT,
        order_id TEXT,
        status_code INTEGER,
        ok INTEGER NOT NULL,
        duration_ms INTEGER NOT NULL,
        mode TEXT NOT NULL,
        error_message TEXT,
        strategy TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS system_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        log_type TEXT NOT NULL,
        message TEXT NOT NULL,
        details TEXT,
        created_at TEXT NOT NULL
    )",
];

/// Handle to the sqlite store. Cheap to clone (shares the pool).
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `path` and apply the schema.
    pub async fn open(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .with_context(|| format!("bad sqlite path: {path}"))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open sqlite store at {path}"))?;

        let store = Self { pool };
        store.init_schema().await?;
        info!(path, "store opened");
        Ok(store)
    }

    /// In-memory store for tests. Capped at a single connection so every
    /// query sees the same memory database.
    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("failed to open in-memory sqlite store")?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .with_context(|| format!("schema statement failed: {}", &stmt[..60.min(stmt.len())]))?;
        }
        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish()
    }
}

/// Current wall-clock timestamp in the RFC-3339 form every table uses.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
