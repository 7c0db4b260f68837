// =============================================================================
// Portfolio positions, snapshots, and balances
// =============================================================================
//
// Positions mirror broker truth and are replaced wholesale by each snapshot
// sync: rows present in the fetch are upserted with the new snapshot id,
// rows absent from it are deleted. Snapshot and balance rows are never
// deleted (historical audit).
// =============================================================================

use anyhow::{Context, Result};

use super::models::{position_from_row, snapshot_from_row, AccountBalances, PortfolioPosition, SnapshotRow};
use super::Store;
use crate::types::{OptionType, PositionSide};

impl Store {
    pub async fn upsert_position(&self, pos: &PortfolioPosition) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO portfolio_positions (symbol, expiration, option_type,
                strike, side, quantity, cost_basis_per_contract, bid, ask, last,
                snapshot_id, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&pos.symbol)
        .bind(&pos.expiration)
        .bind(pos.option_type.as_str())
        .bind(pos.strike)
        .bind(pos.side.as_str())
        .bind(pos.quantity)
        .bind(pos.cost_basis_per_contract)
        .bind(pos.bid)
        .bind(pos.ask)
        .bind(pos.last)
        .bind(&pos.snapshot_id)
        .bind(&pos.updated_at)
        .execute(self.pool())
        .await
        .context("failed to upsert portfolio position")?;
        Ok(())
    }

    /// Remove positions that the latest sync did not observe (closed at the
    /// broker). Returns the number of rows deleted.
    pub async fn delete_positions_not_in_snapshot(&self, snapshot_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM portfolio_positions WHERE snapshot_id != ?")
            .bind(snapshot_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn all_positions(&self) -> Result<Vec<PortfolioPosition>> {
        let rows = sqlx::query("SELECT * FROM portfolio_positions ORDER BY symbol, expiration, strike")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(position_from_row).collect()
    }

    pub async fn position_for_leg(
        &self,
        symbol: &str,
        expiration: &str,
        option_type: OptionType,
        strike: f64,
        side: PositionSide,
    ) -> Result<Option<PortfolioPosition>> {
        let row = sqlx::query(
            "SELECT * FROM portfolio_positions
             WHERE symbol = ? AND expiration = ? AND option_type = ? AND side = ?
               AND ABS(strike - ?) < 0.0001",
        )
        .bind(symbol)
        .bind(expiration)
        .bind(option_type.as_str())
        .bind(side.as_str())
        .bind(strike)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(position_from_row).transpose()
    }

    pub async fn insert_snapshot(&self, snapshot: &SnapshotRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO snapshots (id, account_id, as_of, position_count, order_count)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&snapshot.id)
        .bind(&snapshot.account_id)
        .bind(&snapshot.as_of)
        .bind(snapshot.position_count)
        .bind(snapshot.order_count)
        .execute(self.pool())
        .await
        .context("failed to insert snapshot row")?;
        Ok(())
    }

    pub async fn get_snapshot(&self, id: &str) -> Result<Option<SnapshotRow>> {
        let row = sqlx::query("SELECT * FROM snapshots WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(snapshot_from_row).transpose()
    }

    pub async fn count_snapshots(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM snapshots")
            .fetch_one(self.pool())
            .await?;
        Ok(row.0)
    }

    pub async fn insert_balances(&self, balances: &AccountBalances) -> Result<()> {
        sqlx::query(
            "INSERT INTO account_balances (snapshot_id, account_id, cash, buying_power,
                equity, margin_requirement, as_of)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&balances.snapshot_id)
        .bind(&balances.account_id)
        .bind(balances.cash)
        .bind(balances.buying_power)
        .bind(balances.equity)
        .bind(balances.margin_requirement)
        .bind(&balances.as_of)
        .execute(self.pool())
        .await
        .context("failed to insert account balances")?;
        Ok(())
    }
}
