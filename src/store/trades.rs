// =============================================================================
// Trade persistence
// =============================================================================

use anyhow::{Context, Result};

use super::models::{trade_from_row, Trade};
use super::{now_rfc3339, Store};
use crate::types::TradeStatus;

impl Store {
    pub async fn insert_trade(&self, trade: &Trade) -> Result<()> {
        sqlx::query(
            "INSERT INTO trades (id, proposal_id, symbol, expiration, strategy, short_strike,
                long_strike, width, quantity, entry_price, exit_price, max_profit, max_loss,
                realized_pnl, max_seen_profit_fraction, iv_entry, status, exit_reason,
                broker_order_id_open, broker_order_id_close, opened_at, closed_at,
                created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&trade.id)
        .bind(&trade.proposal_id)
        .bind(&trade.symbol)
        .bind(&trade.expiration)
        .bind(trade.strategy.as_str())
        .bind(trade.short_strike)
        .bind(trade.long_strike)
        .bind(trade.width)
        .bind(trade.quantity)
        .bind(trade.entry_price)
        .bind(trade.exit_price)
        .bind(trade.max_profit)
        .bind(trade.max_loss)
        .bind(trade.realized_pnl)
        .bind(trade.max_seen_profit_fraction)
        .bind(trade.iv_entry)
        .bind(trade.status.as_str())
        .bind(&trade.exit_reason)
        .bind(&trade.broker_order_id_open)
        .bind(&trade.broker_order_id_close)
        .bind(&trade.opened_at)
        .bind(&trade.closed_at)
        .bind(&trade.created_at)
        .bind(&trade.updated_at)
        .execute(self.pool())
        .await
        .with_context(|| format!("failed to insert trade {}", trade.id))?;
        Ok(())
    }

    /// Full-row update by id; `updated_at` is stamped here.
    pub async fn update_trade(&self, trade: &Trade) -> Result<()> {
        sqlx::query(
            "UPDATE trades SET entry_price = ?, exit_price = ?, max_profit = ?, max_loss = ?,
                realized_pnl = ?, max_seen_profit_fraction = ?, iv_entry = ?, status = ?,
                exit_reason = ?, broker_order_id_open = ?, broker_order_id_close = ?,
                opened_at = ?, closed_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(trade.entry_price)
        .bind(trade.exit_price)
        .bind(trade.max_profit)
        .bind(trade.max_loss)
        .bind(trade.realized_pnl)
        .bind(trade.max_seen_profit_fraction)
        .bind(trade.iv_entry)
        .bind(trade.status.as_str())
        .bind(&trade.exit_reason)
        .bind(&trade.broker_order_id_open)
        .bind(&trade.broker_order_id_close)
        .bind(&trade.opened_at)
        .bind(&trade.closed_at)
        .bind(now_rfc3339())
        .bind(&trade.id)
        .execute(self.pool())
        .await
        .with_context(|| format!("failed to update trade {}", trade.id))?;
        Ok(())
    }

    pub async fn get_trade(&self, id: &str) -> Result<Option<Trade>> {
        let row = sqlx::query("SELECT * FROM trades WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(trade_from_row).transpose()
    }

    pub async fn get_trade_by_proposal(&self, proposal_id: &str) -> Result<Option<Trade>> {
        let row = sqlx::query("SELECT * FROM trades WHERE proposal_id = ?")
            .bind(proposal_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(trade_from_row).transpose()
    }

    /// Trades in status OPEN — the monitor's working set.
    pub async fn open_trades(&self) -> Result<Vec<Trade>> {
        let rows = sqlx::query("SELECT * FROM trades WHERE status = ? ORDER BY created_at")
            .bind(TradeStatus::Open.as_str())
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(trade_from_row).collect()
    }

    /// Trades that still hold (or are about to hold) a position: everything
    /// not CLOSED or CANCELLED.
    pub async fn active_trades(&self) -> Result<Vec<Trade>> {
        let rows = sqlx::query(
            "SELECT * FROM trades WHERE status NOT IN (?, ?) ORDER BY created_at",
        )
        .bind(TradeStatus::Closed.as_str())
        .bind(TradeStatus::Cancelled.as_str())
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(trade_from_row).collect()
    }

    pub async fn count_active_trades(&self) -> Result<i64> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM trades WHERE status NOT IN (?, ?)")
                .bind(TradeStatus::Closed.as_str())
                .bind(TradeStatus::Cancelled.as_str())
                .fetch_one(self.pool())
                .await?;
        Ok(row.0)
    }

    /// Sum of realized PnL for trades closed on or after the given RFC-3339
    /// instant. Drives the daily-loss accounting.
    pub async fn realized_pnl_since(&self, since: &str) -> Result<f64> {
        let row: (Option<f64>,) = sqlx::query_as(
            "SELECT SUM(realized_pnl) FROM trades WHERE status = ? AND closed_at >= ?",
        )
        .bind(TradeStatus::Closed.as_str())
        .bind(since)
        .fetch_one(self.pool())
        .await?;
        Ok(row.0.unwrap_or(0.0))
    }

    pub async fn recent_trades(&self, limit: i64) -> Result<Vec<Trade>> {
        let rows = sqlx::query("SELECT * FROM trades ORDER BY created_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(trade_from_row).collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Strategy;

    fn sample_trade(id: &str, status: TradeStatus) -> Trade {
        Trade {
            id: id.to_string(),
            proposal_id: format!("prop-{id}"),
            symbol: "SPY".to_string(),
            expiration: "2025-01-17".to_string(),
            strategy: Strategy::BullPutCredit,
            short_strike: 580.0,
            long_strike: 575.0,
            width: 5.0,
            quantity: 1,
            entry_price: Some(1.0),
            exit_price: None,
            max_profit: Some(1.0),
            max_loss: Some(4.0),
            realized_pnl: None,
            max_seen_profit_fraction: 0.0,
            iv_entry: None,
            status,
            exit_reason: None,
            broker_order_id_open: None,
            broker_order_id_close: None,
            opened_at: Some(now_rfc3339()),
            closed_at: None,
            created_at: now_rfc3339(),
            updated_at: now_rfc3339(),
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_roundtrip() {
        let store = Store::open_in_memory().await.unwrap();
        let trade = sample_trade("t1", TradeStatus::Open);
        store.insert_trade(&trade).await.unwrap();

        let got = store.get_trade("t1").await.unwrap().unwrap();
        assert_eq!(got.symbol, "SPY");
        assert_eq!(got.strategy, Strategy::BullPutCredit);
        assert_eq!(got.status, TradeStatus::Open);
        assert_eq!(got.quantity, 1);
        assert!((got.width - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn open_trades_excludes_closed() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_trade(&sample_trade("t1", TradeStatus::Open)).await.unwrap();
        store.insert_trade(&sample_trade("t2", TradeStatus::Closed)).await.unwrap();
        store.insert_trade(&sample_trade("t3", TradeStatus::ClosingPending)).await.unwrap();

        let open = store.open_trades().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, "t1");

        assert_eq!(store.count_active_trades().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn update_persists_peak_and_status() {
        let store = Store::open_in_memory().await.unwrap();
        let mut trade = sample_trade("t1", TradeStatus::Open);
        store.insert_trade(&trade).await.unwrap();

        trade.max_seen_profit_fraction = 0.62;
        trade.status = TradeStatus::ClosingPending;
        trade.exit_reason = Some("PROFIT_TARGET".to_string());
        store.update_trade(&trade).await.unwrap();

        let got = store.get_trade("t1").await.unwrap().unwrap();
        assert!((got.max_seen_profit_fraction - 0.62).abs() < 1e-9);
        assert_eq!(got.status, TradeStatus::ClosingPending);
        assert_eq!(got.exit_reason.as_deref(), Some("PROFIT_TARGET"));
    }

    #[tokio::test]
    async fn realized_pnl_since_sums_closed_only() {
        let store = Store::open_in_memory().await.unwrap();
        let mut t1 = sample_trade("t1", TradeStatus::Closed);
        t1.realized_pnl = Some(-120.0);
        t1.closed_at = Some("2025-01-17T15:00:00+00:00".to_string());
        store.insert_trade(&t1).await.unwrap();

        let mut t2 = sample_trade("t2", TradeStatus::Closed);
        t2.realized_pnl = Some(52.0);
        t2.closed_at = Some("2025-01-17T16:00:00+00:00".to_string());
        store.insert_trade(&t2).await.unwrap();

        let total = store
            .realized_pnl_since("2025-01-17T00:00:00+00:00")
            .await
            .unwrap();
        assert!((total - (-68.0)).abs() < 1e-9);
    }

    #[test]
    fn premium_contribution_signs() {
        let mut t = sample_trade("t1", TradeStatus::Open);
        assert!((t.premium_contribution().unwrap() - 100.0).abs() < 1e-9);

        t.strategy = Strategy::BullCallDebit;
        t.entry_price = Some(2.0);
        t.quantity = 2;
        assert!((t.premium_contribution().unwrap() - (-400.0)).abs() < 1e-9);
    }
}
