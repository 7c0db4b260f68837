// =============================================================================
// Snapshot sync — one coherent point-in-time view of the account
// =============================================================================
//
// Balances, positions, and orders are fetched concurrently, written under a
// single fresh snapshot id, and stale position rows (keys the broker no
// longer reports) are deleted. Orders are matched through the reconciler so
// a fill observed here promotes its trade exactly as a targeted sync would.
// Broker orders that match nothing local are warnings, not errors — they
// are simply not ours.
// =============================================================================

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::broker::BrokerPosition;
use crate::config::EngineConfig;
use crate::occ;
use crate::reconcile::{self, ApplyResult};
use crate::store::models::{AccountBalances, PortfolioPosition, SnapshotRow};
use crate::store::now_rfc3339;
use crate::types::{PositionSide, TradingMode};

/// What one snapshot sync accomplished.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotResult {
    pub snapshot_id: String,
    pub as_of: String,
    pub position_count: u32,
    pub order_count: u32,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl SnapshotResult {
    pub fn is_coherent(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Run one snapshot sync against the given account.
pub async fn sync_broker_snapshot(
    state: &AppState,
    config: &EngineConfig,
    account_id: &str,
) -> Result<SnapshotResult> {
    let snapshot_id = Uuid::new_v4().to_string();
    let as_of = now_rfc3339();
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();

    // DRY_RUN holds no broker account; the snapshot row alone marks the
    // sync for observability.
    if config.mode == TradingMode::DryRun {
        write_snapshot_row(state, &snapshot_id, account_id, &as_of, 0, 0, &mut warnings).await;
        return Ok(SnapshotResult {
            snapshot_id,
            as_of,
            position_count: 0,
            order_count: 0,
            errors,
            warnings,
        });
    }

    let (balances, positions, orders) = tokio::join!(
        state.broker.get_balances(account_id),
        state.broker.get_positions(account_id),
        state.broker.get_all_orders(
            account_id,
            Some(crate::clock::eastern_date(Utc::now()) - chrono::Duration::days(7)),
            None,
        ),
    );

    // ── Positions ────────────────────────────────────────────────────────
    let mut position_count: u32 = 0;
    match positions {
        Ok(broker_positions) => {
            let (rows, mut parse_warnings) =
                position_rows(&broker_positions, &snapshot_id, &as_of);
            warnings.append(&mut parse_warnings);

            for row in &rows {
                state.store.upsert_position(row).await?;
                position_count += 1;
            }
            // Keys absent from this fetch are closed at the broker.
            let deleted = state
                .store
                .delete_positions_not_in_snapshot(&snapshot_id)
                .await?;
            if deleted > 0 {
                debug!(deleted, "stale positions removed");
            }
        }
        Err(e) => {
            // Do not delete anything on a failed fetch — stale truth beats
            // no truth.
            errors.push(format!("positions fetch failed: {e}"));
        }
    }

    // ── Orders ───────────────────────────────────────────────────────────
    let mut order_count: u32 = 0;
    match orders {
        Ok(broker_orders) => {
            for broker_order in &broker_orders {
                match reconcile::apply_broker_order(state, broker_order, Some(&snapshot_id)).await {
                    Ok(ApplyResult::Unmatched) => {
                        warnings.push(format!("unmatched broker order {}", broker_order.id));
                    }
                    Ok(_) => {
                        order_count += 1;
                        // Best-effort stamp of any older rows sharing this
                        // broker id.
                        if !broker_order.id.is_empty() {
                            let _ = state
                                .store
                                .stamp_orders_by_broker_id(&broker_order.id, &snapshot_id)
                                .await;
                        }
                    }
                    Err(e) => {
                        errors.push(format!("order {} reconcile failed: {e}", broker_order.id));
                    }
                }
            }
        }
        Err(e) => {
            errors.push(format!("orders fetch failed: {e}"));
        }
    }

    // ── Balances ─────────────────────────────────────────────────────────
    match balances {
        Ok(b) => {
            let row = AccountBalances {
                snapshot_id: snapshot_id.clone(),
                account_id: account_id.to_string(),
                cash: b.cash,
                buying_power: b.buying_power,
                equity: b.equity,
                margin_requirement: b.margin_requirement,
                as_of: as_of.clone(),
            };
            if let Err(e) = state.store.insert_balances(&row).await {
                warnings.push(format!("balance row write failed: {e}"));
            }
        }
        Err(e) => {
            errors.push(format!("balances fetch failed: {e}"));
        }
    }

    write_snapshot_row(
        state,
        &snapshot_id,
        account_id,
        &as_of,
        position_count,
        order_count,
        &mut warnings,
    )
    .await;

    info!(
        snapshot_id = %snapshot_id,
        position_count,
        order_count,
        errors = errors.len(),
        warnings = warnings.len(),
        "snapshot sync complete"
    );

    Ok(SnapshotResult {
        snapshot_id,
        as_of,
        position_count,
        order_count,
        errors,
        warnings,
    })
}

/// Snapshot-row write failure is tolerated (pre-migration schemas lacked
/// the table); the positions and orders above are already stamped.
async fn write_snapshot_row(
    state: &AppState,
    snapshot_id: &str,
    account_id: &str,
    as_of: &str,
    position_count: u32,
    order_count: u32,
    warnings: &mut Vec<String>,
) {
    let row = SnapshotRow {
        id: snapshot_id.to_string(),
        account_id: account_id.to_string(),
        as_of: as_of.to_string(),
        position_count: position_count as i64,
        order_count: order_count as i64,
    };
    if let Err(e) = state.store.insert_snapshot(&row).await {
        warn!(error = %e, "snapshot row write failed, continuing");
        warnings.push(format!("snapshot row write failed: {e}"));
    }
}

/// Convert broker option positions into keyed rows. Equity positions are
/// skipped (this engine only manages option spreads); undecodable option
/// symbols surface as warnings.
fn position_rows(
    broker_positions: &[BrokerPosition],
    snapshot_id: &str,
    as_of: &str,
) -> (Vec<PortfolioPosition>, Vec<String>) {
    let mut rows = Vec::new();
    let mut warnings = Vec::new();

    for position in broker_positions {
        if position.quantity == 0.0 {
            continue;
        }
        let Ok(parsed) = occ::decode(&position.symbol) else {
            // Equity or unknown symbol shape.
            if position.symbol.len() > 10 {
                warnings.push(format!("undecodable option symbol {}", position.symbol));
            }
            continue;
        };

        let side = if position.quantity > 0.0 {
            PositionSide::Long
        } else {
            PositionSide::Short
        };

        rows.push(PortfolioPosition {
            symbol: parsed.root,
            expiration: parsed.expiration.format("%Y-%m-%d").to_string(),
            option_type: parsed.option_type,
            strike: parsed.strike,
            side,
            quantity: position.quantity.abs().round() as i64,
            cost_basis_per_contract: position.cost_basis_per_contract,
            bid: None,
            ask: None,
            last: None,
            snapshot_id: snapshot_id.to_string(),
            updated_at: as_of.to_string(),
        });
    }

    (rows, warnings)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OptionType;

    fn broker_position(symbol: &str, quantity: f64) -> BrokerPosition {
        BrokerPosition {
            symbol: symbol.to_string(),
            quantity,
            cost_basis_per_contract: Some(-95.0),
            market_value: None,
        }
    }

    #[test]
    fn option_positions_decode_into_keyed_rows() {
        let positions = vec![
            broker_position("SPY   250117P00580000", -1.0),
            broker_position("SPY   250117P00575000", 1.0),
        ];
        let (rows, warnings) = position_rows(&positions, "snap-1", "2025-01-17T15:00:00+00:00");

        assert_eq!(rows.len(), 2);
        assert!(warnings.is_empty());

        let short = rows.iter().find(|r| r.side == PositionSide::Short).unwrap();
        assert_eq!(short.symbol, "SPY");
        assert_eq!(short.expiration, "2025-01-17");
        assert_eq!(short.option_type, OptionType::Put);
        assert!((short.strike - 580.0).abs() < 1e-9);
        assert_eq!(short.quantity, 1);
        assert_eq!(short.snapshot_id, "snap-1");

        let long = rows.iter().find(|r| r.side == PositionSide::Long).unwrap();
        assert!((long.strike - 575.0).abs() < 1e-9);
    }

    #[test]
    fn equity_positions_skipped_quietly() {
        let positions = vec![broker_position("SPY", 100.0)];
        let (rows, warnings) = position_rows(&positions, "snap-1", "now");
        assert!(rows.is_empty());
        assert!(warnings.is_empty());
    }

    #[test]
    fn zero_quantity_positions_skipped() {
        let positions = vec![broker_position("SPY   250117P00580000", 0.0)];
        let (rows, _) = position_rows(&positions, "snap-1", "now");
        assert!(rows.is_empty());
    }

    #[test]
    fn every_row_carries_the_snapshot_id() {
        let positions = vec![
            broker_position("SPY   250117P00580000", -2.0),
            broker_position("QQQ   250221C00510000", 3.0),
        ];
        let (rows, _) = position_rows(&positions, "snap-42", "now");
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.snapshot_id == "snap-42"));
        assert_eq!(rows[0].quantity, 2);
        assert_eq!(rows[1].quantity, 3);
    }
}
