// =============================================================================
// Persisted entities — row structs and sqlite row mapping
// =============================================================================
//
// Enums are stored as their canonical TEXT form and parsed back through
// FromStr at the row boundary, so a corrupted cell surfaces as an error
// instead of a silently misread status.
// =============================================================================

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::types::{
    OptionType, OrderSide, OrderStatus, PositionSide, ProposalKind, ProposalStatus, Strategy,
    TradeStatus,
};

/// A managed spread position. The engine only ever evaluates or closes trades
/// it created itself.
#[derive(Debug, Clone, Serialize)]
pub struct Trade {
    pub id: String,
    pub proposal_id: String,
    pub symbol: String,
    /// YYYY-MM-DD.
    pub expiration: String,
    pub strategy: Strategy,
    pub short_strike: f64,
    pub long_strike: f64,
    pub width: f64,
    pub quantity: i64,
    pub entry_price: Option<f64>,
    pub exit_price: Option<f64>,
    pub max_profit: Option<f64>,
    pub max_loss: Option<f64>,
    pub realized_pnl: Option<f64>,
    /// Trailing peak of the profit fraction, persisted so TRAIL_PROFIT
    /// survives restarts.
    pub max_seen_profit_fraction: f64,
    pub iv_entry: Option<f64>,
    pub status: TradeStatus,
    pub exit_reason: Option<String>,
    pub broker_order_id_open: Option<String>,
    pub broker_order_id_close: Option<String>,
    pub opened_at: Option<String>,
    pub closed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Trade {
    pub fn expiration_date(&self) -> Result<NaiveDate> {
        NaiveDate::parse_from_str(&self.expiration, "%Y-%m-%d")
            .with_context(|| format!("trade {} has bad expiration '{}'", self.id, self.expiration))
    }

    /// Signed premium contribution in dollars: positive for credit spreads,
    /// negative for debit spreads. None until the entry price is known.
    pub fn premium_contribution(&self) -> Option<f64> {
        let entry = self.entry_price?;
        let sign = if self.strategy.is_credit() { 1.0 } else { -1.0 };
        Some(sign * entry * self.quantity as f64 * 100.0)
    }
}

/// A scored candidate snapshot persisted by the proposal pipeline, or an
/// exit intent linked to an existing trade.
#[derive(Debug, Clone, Serialize)]
pub struct Proposal {
    pub id: String,
    pub symbol: String,
    pub expiration: String,
    pub short_strike: f64,
    pub long_strike: f64,
    pub width: f64,
    pub quantity: i64,
    pub strategy: Strategy,
    /// Signed: positive for a credit target, negative for a debit paid.
    pub credit_target: f64,
    pub score: f64,
    pub score_ivr: f64,
    pub score_vertical_skew: f64,
    pub score_term_structure: f64,
    pub score_delta_fitness: f64,
    pub score_ev: f64,
    pub status: ProposalStatus,
    pub kind: ProposalKind,
    pub linked_trade_id: Option<String>,
    pub created_at: String,
}

/// A broker order tracked locally. `client_order_id` is generated before
/// placement and is the primary reconciliation anchor; the broker's own id
/// is a fallback match only.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRecord {
    pub id: String,
    pub proposal_id: String,
    pub trade_id: Option<String>,
    pub side: OrderSide,
    pub client_order_id: String,
    pub broker_order_id: Option<String>,
    pub status: OrderStatus,
    pub avg_fill_price: Option<f64>,
    pub filled_quantity: Option<f64>,
    pub remaining_quantity: Option<f64>,
    pub snapshot_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A broker-held option leg, keyed by (symbol, expiration, option type,
/// strike, side). Every row carries the snapshot id of the sync that wrote it.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PortfolioPosition {
    pub symbol: String,
    pub expiration: String,
    pub option_type: OptionType,
    pub strike: f64,
    pub side: PositionSide,
    pub quantity: i64,
    pub cost_basis_per_contract: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub last: Option<f64>,
    pub snapshot_id: String,
    pub updated_at: String,
}

impl PortfolioPosition {
    /// Rebuild the OCC wire symbol for this leg.
    pub fn occ_symbol(&self) -> Result<String> {
        let expiration = NaiveDate::parse_from_str(&self.expiration, "%Y-%m-%d")
            .with_context(|| format!("position has bad expiration '{}'", self.expiration))?;
        Ok(crate::occ::encode(
            &self.symbol,
            expiration,
            self.option_type,
            self.strike,
        ))
    }
}

/// Point-in-time sync header. Positions and orders written by the same sync
/// carry this row's id.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotRow {
    pub id: String,
    pub account_id: String,
    pub as_of: String,
    pub position_count: i64,
    pub order_count: i64,
}

/// Account balances captured alongside a snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct AccountBalances {
    pub snapshot_id: String,
    pub account_id: String,
    pub cash: f64,
    pub buying_power: f64,
    pub equity: f64,
    pub margin_requirement: f64,
    pub as_of: String,
}

/// Append-only record of one broker interaction.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerEventRecord {
    pub operation: String,
    pub symbol: Option<String>,
    pub expiration: Option<String>,
    pub order_id: Option<String>,
    pub status_code: Option<i64>,
    pub ok: bool,
    pub duration_ms: i64,
    pub mode: String,
    pub error_message: Option<String>,
    pub strategy: Option<String>,
    pub created_at: String,
}

/// Structured system log row.
#[derive(Debug, Clone, Serialize)]
pub struct SystemLogRecord {
    pub log_type: String,
    pub message: String,
    pub details: Option<String>,
    pub created_at: String,
}

// -----------------------------------------------------------------------------
// Row mapping
// -----------------------------------------------------------------------------

fn parse_enum<T: std::str::FromStr<Err = String>>(raw: String, column: &str) -> Result<T> {
    raw.parse::<T>()
        .map_err(|e| anyhow::anyhow!("column {column}: {e}"))
}

pub(crate) fn trade_from_row(row: &SqliteRow) -> Result<Trade> {
    Ok(Trade {
        id: row.try_get("id")?,
        proposal_id: row.try_get("proposal_id")?,
        symbol: row.try_get("symbol")?,
        expiration: row.try_get("expiration")?,
        strategy: parse_enum(row.try_get("strategy")?, "strategy")?,
        short_strike: row.try_get("short_strike")?,
        long_strike: row.try_get("long_strike")?,
        width: row.try_get("width")?,
        quantity: row.try_get("quantity")?,
        entry_price: row.try_get("entry_price")?,
        exit_price: row.try_get("exit_price")?,
        max_profit: row.try_get("max_profit")?,
        max_loss: row.try_get("max_loss")?,
        realized_pnl: row.try_get("realized_pnl")?,
        max_seen_profit_fraction: row.try_get("max_seen_profit_fraction")?,
        iv_entry: row.try_get("iv_entry")?,
        status: parse_enum(row.try_get("status")?, "status")?,
        exit_reason: row.try_get("exit_reason")?,
        broker_order_id_open: row.try_get("broker_order_id_open")?,
        broker_order_id_close: row.try_get("broker_order_id_close")?,
        opened_at: row.try_get("opened_at")?,
        closed_at: row.try_get("closed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn proposal_from_row(row: &SqliteRow) -> Result<Proposal> {
    Ok(Proposal {
        id: row.try_get("id")?,
        symbol: row.try_get("symbol")?,
        expiration: row.try_get("expiration")?,
        short_strike: row.try_get("short_strike")?,
        long_strike: row.try_get("long_strike")?,
        width: row.try_get("width")?,
        quantity: row.try_get("quantity")?,
        strategy: parse_enum(row.try_get("strategy")?, "strategy")?,
        credit_target: row.try_get("credit_target")?,
        score: row.try_get("score")?,
        score_ivr: row.try_get("score_ivr")?,
        score_vertical_skew: row.try_get("score_vertical_skew")?,
        score_term_structure: row.try_get("score_term_structure")?,
        score_delta_fitness: row.try_get("score_delta_fitness")?,
        score_ev: row.try_get("score_ev")?,
        status: parse_enum(row.try_get("status")?, "status")?,
        kind: parse_enum(row.try_get("kind")?, "kind")?,
        linked_trade_id: row.try_get("linked_trade_id")?,
        created_at: row.try_get("created_at")?,
    })
}

pub(crate) fn order_from_row(row: &SqliteRow) -> Result<OrderRecord> {
    Ok(OrderRecord {
        id: row.try_get("id")?,
        proposal_id: row.try_get("proposal_id")?,
        trade_id: row.try_get("trade_id")?,
        side: parse_enum(row.try_get("side")?, "side")?,
        client_order_id: row.try_get("client_order_id")?,
        broker_order_id: row.try_get("broker_order_id")?,
        status: parse_enum(row.try_get("status")?, "status")?,
        avg_fill_price: row.try_get("avg_fill_price")?,
        filled_quantity: row.try_get("filled_quantity")?,
        remaining_quantity: row.try_get("remaining_quantity")?,
        snapshot_id: row.try_get("snapshot_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn position_from_row(row: &SqliteRow) -> Result<PortfolioPosition> {
    Ok(PortfolioPosition {
        symbol: row.try_get("symbol")?,
        expiration: row.try_get("expiration")?,
        option_type: parse_enum(row.try_get("option_type")?, "option_type")?,
        strike: row.try_get("strike")?,
        side: parse_enum(row.try_get("side")?, "side")?,
        quantity: row.try_get("quantity")?,
        cost_basis_per_contract: row.try_get("cost_basis_per_contract")?,
        bid: row.try_get("bid")?,
        ask: row.try_get("ask")?,
        last: row.try_get("last")?,
        snapshot_id: row.try_get("snapshot_id")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn snapshot_from_row(row: &SqliteRow) -> Result<SnapshotRow> {
    Ok(SnapshotRow {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        as_of: row.try_get("as_of")?,
        position_count: row.try_get("position_count")?,
        order_count: row.try_get("order_count")?,
    })
}

pub(crate) fn system_log_from_row(row: &SqliteRow) -> Result<SystemLogRecord> {
    Ok(SystemLogRecord {
        log_type: row.try_get("log_type")?,
        message: row.try_get("message")?,
        details: row.try_get("details")?,
        created_at: row.try_get("created_at")?,
    })
}
