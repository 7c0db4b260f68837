// =============================================================================
// Local order persistence
// =============================================================================
//
// At most one local order per client_order_id (UNIQUE constraint). Status
// writes flow through `advance_order_status`, which enforces the monotonic
// DAG so a terminal status can never be clobbered by a late PENDING/PLACED.
// =============================================================================

use anyhow::{Context, Result};
use tracing::warn;

use super::models::{order_from_row, OrderRecord};
use super::{now_rfc3339, Store};
use crate::types::OrderStatus;

impl Store {
    pub async fn insert_order(&self, order: &OrderRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO orders (id, proposal_id, trade_id, side, client_order_id,
                broker_order_id, status, avg_fill_price, filled_quantity, remaining_quantity,
                snapshot_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&order.id)
        .bind(&order.proposal_id)
        .bind(&order.trade_id)
        .bind(order.side.as_str())
        .bind(&order.client_order_id)
        .bind(&order.broker_order_id)
        .bind(order.status.as_str())
        .bind(order.avg_fill_price)
        .bind(order.filled_quantity)
        .bind(order.remaining_quantity)
        .bind(&order.snapshot_id)
        .bind(&order.created_at)
        .bind(&order.updated_at)
        .execute(self.pool())
        .await
        .with_context(|| format!("failed to insert order {}", order.id))?;
        Ok(())
    }

    pub async fn get_order(&self, id: &str) -> Result<Option<OrderRecord>> {
        let row = sqlx::query("SELECT * FROM orders WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    pub async fn get_order_by_client_id(&self, client_order_id: &str) -> Result<Option<OrderRecord>> {
        let row = sqlx::query("SELECT * FROM orders WHERE client_order_id = ?")
            .bind(client_order_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    pub async fn get_order_by_broker_id(&self, broker_order_id: &str) -> Result<Option<OrderRecord>> {
        let row = sqlx::query("SELECT * FROM orders WHERE broker_order_id = ?")
            .bind(broker_order_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    /// The entry order created for a proposal, if any.
    pub async fn entry_order_for_proposal(&self, proposal_id: &str) -> Result<Option<OrderRecord>> {
        let row = sqlx::query(
            "SELECT * FROM orders WHERE proposal_id = ? AND side = 'ENTRY'
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(proposal_id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    /// Orders that have not yet reached a terminal status.
    pub async fn open_orders(&self) -> Result<Vec<OrderRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM orders WHERE status NOT IN (?, ?, ?) ORDER BY created_at",
        )
        .bind(OrderStatus::Filled.as_str())
        .bind(OrderStatus::Cancelled.as_str())
        .bind(OrderStatus::Rejected.as_str())
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(order_from_row).collect()
    }

    /// Apply a reconciled update to a local order. Status advancement is
    /// monotonic: an illegal regression is logged and dropped while the fill
    /// fields still refresh. Returns the stored order after the write.
    pub async fn apply_order_update(
        &self,
        order_id: &str,
        status: OrderStatus,
        broker_order_id: Option<&str>,
        avg_fill_price: Option<f64>,
        filled_quantity: Option<f64>,
        remaining_quantity: Option<f64>,
        snapshot_id: Option<&str>,
    ) -> Result<OrderRecord> {
        let current = self
            .get_order(order_id)
            .await?
            .with_context(|| format!("order {order_id} vanished during update"))?;

        let next_status = if current.status.can_advance(status) {
            status
        } else {
            warn!(
                order_id,
                from = %current.status,
                to = %status,
                "order status regression rejected"
            );
            current.status
        };

        sqlx::query(
            "UPDATE orders SET status = ?, broker_order_id = COALESCE(?, broker_order_id),
                avg_fill_price = COALESCE(?, avg_fill_price),
                filled_quantity = COALESCE(?, filled_quantity),
                remaining_quantity = COALESCE(?, remaining_quantity),
                snapshot_id = COALESCE(?, snapshot_id),
                updated_at = ?
             WHERE id = ?",
        )
        .bind(next_status.as_str())
        .bind(broker_order_id)
        .bind(avg_fill_price)
        .bind(filled_quantity)
        .bind(remaining_quantity)
        .bind(snapshot_id)
        .bind(now_rfc3339())
        .bind(order_id)
        .execute(self.pool())
        .await
        .with_context(|| format!("failed to update order {order_id}"))?;

        self.get_order(order_id)
            .await?
            .with_context(|| format!("order {order_id} vanished after update"))
    }

    /// Link an order to the trade it produced (set on entry fill).
    pub async fn set_order_trade(&self, order_id: &str, trade_id: &str) -> Result<()> {
        sqlx::query("UPDATE orders SET trade_id = ?, updated_at = ? WHERE id = ?")
            .bind(trade_id)
            .bind(now_rfc3339())
            .bind(order_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Best-effort bulk stamp: tag every order matching this broker id with
    /// the snapshot that most recently observed it.
    pub async fn stamp_orders_by_broker_id(&self, broker_order_id: &str, snapshot_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE orders SET snapshot_id = ?, updated_at = ? WHERE broker_order_id = ?",
        )
        .bind(snapshot_id)
        .bind(now_rfc3339())
        .bind(broker_order_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}
