// =============================================================================
// Order reconciliation — broker truth folded into local state
// =============================================================================
//
// The broker is the source of truth for order status. Local orders are
// matched by client order id first (the broker echoes it back as the order
// tag), broker order id second; anything matching neither is not ours and
// is skipped. Status advancement is monotonic, so reconciling the same
// payload any number of times converges to the same store state.
// =============================================================================

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::broker::BrokerOrder;
use crate::clock;
use crate::config::EngineConfig;
use crate::risk;
use crate::store::models::{OrderRecord, Proposal, Trade};
use crate::store::now_rfc3339;
use crate::types::{OrderSide, OrderStatus, ProposalStatus, TradeStatus, TradingMode};

/// Broker status strings normalize onto the local DAG. Unknown strings map
/// to PENDING so they can still advance later.
pub fn normalize_status(raw: &str) -> OrderStatus {
    match raw.to_ascii_lowercase().as_str() {
        "filled" => OrderStatus::Filled,
        "partially_filled" | "partial" => OrderStatus::Partial,
        "cancelled" | "canceled" => OrderStatus::Cancelled,
        "rejected" => OrderStatus::Rejected,
        "open" | "pending" | "new" => OrderStatus::Placed,
        _ => OrderStatus::Pending,
    }
}

/// Result of folding one broker order into the store.
#[derive(Debug)]
pub enum ApplyResult {
    /// No local order matches: not ours.
    Unmatched,
    /// Matched but nothing changed.
    Unchanged,
    /// Matched and updated; trade promotion ran.
    Updated(OrderRecord),
}

/// Summary of one full order-sync pass.
#[derive(Debug, Default, serde::Serialize)]
pub struct SyncReport {
    pub seen: u32,
    pub matched: u32,
    pub updated: u32,
    pub unmatched: u32,
}

// ---------------------------------------------------------------------------
// Sync passes
// ---------------------------------------------------------------------------

/// Pull the recent order window from the broker and reconcile every order.
pub async fn sync_orders(state: &AppState, config: &EngineConfig) -> Result<SyncReport> {
    let mut report = SyncReport::default();

    // DRY_RUN has no broker orders; simulated fills are reconciled at
    // placement time.
    if config.mode == TradingMode::DryRun {
        return Ok(report);
    }

    let today = clock::eastern_date(Utc::now());
    let from = today - chrono::Duration::days(7);
    let orders = state
        .broker
        .get_all_orders(&state.account_id, Some(from), Some(today))
        .await?;

    for broker_order in &orders {
        report.seen += 1;
        match apply_broker_order(state, broker_order, None).await? {
            ApplyResult::Unmatched => report.unmatched += 1,
            ApplyResult::Unchanged => report.matched += 1,
            ApplyResult::Updated(_) => {
                report.matched += 1;
                report.updated += 1;
            }
        }
    }

    debug!(
        seen = report.seen,
        matched = report.matched,
        updated = report.updated,
        unmatched = report.unmatched,
        "order sync complete"
    );
    Ok(report)
}

/// Targeted sync of a single broker order, used right after placement.
pub async fn sync_single_order(
    state: &AppState,
    config: &EngineConfig,
    broker_order_id: &str,
) -> Result<()> {
    if config.mode == TradingMode::DryRun {
        return Ok(());
    }

    let broker_order = state
        .broker
        .get_order(&state.account_id, broker_order_id)
        .await?;
    apply_broker_order(state, &broker_order, None).await?;
    Ok(())
}

/// Fold one broker-reported order into the store and, when it changed,
/// promote the linked trade/proposal.
pub async fn apply_broker_order(
    state: &AppState,
    broker_order: &BrokerOrder,
    snapshot_id: Option<&str>,
) -> Result<ApplyResult> {
    // Client order id is the anchor; broker id is the fallback match.
    let local = match &broker_order.client_order_id {
        Some(coid) => state.store.get_order_by_client_id(coid).await?,
        None => None,
    };
    let local = match local {
        Some(o) => Some(o),
        None if !broker_order.id.is_empty() => {
            state.store.get_order_by_broker_id(&broker_order.id).await?
        }
        None => None,
    };

    let Some(local) = local else {
        debug!(
            broker_order_id = %broker_order.id,
            "broker order matches no local order — not ours, skipping"
        );
        return Ok(ApplyResult::Unmatched);
    };

    let normalized = normalize_status(&broker_order.status);
    let changed = (local.status.can_advance(normalized) && normalized != local.status)
        || (broker_order.avg_fill_price.is_some()
            && broker_order.avg_fill_price != local.avg_fill_price)
        || (broker_order.filled_quantity.is_some()
            && broker_order.filled_quantity != local.filled_quantity);

    if !changed && snapshot_id.is_none() {
        return Ok(ApplyResult::Unchanged);
    }

    let updated = state
        .store
        .apply_order_update(
            &local.id,
            normalized,
            Some(broker_order.id.as_str()).filter(|s| !s.is_empty()),
            broker_order.avg_fill_price,
            broker_order.filled_quantity,
            broker_order.remaining_quantity,
            snapshot_id,
        )
        .await?;

    if changed {
        reconcile_order_with_trade(state, &updated).await?;
        Ok(ApplyResult::Updated(updated))
    } else {
        Ok(ApplyResult::Unchanged)
    }
}

// ---------------------------------------------------------------------------
// Trade promotion
// ---------------------------------------------------------------------------

/// Promote trade and proposal state after a local order changed. Safe to
/// call repeatedly with the same order state.
pub async fn reconcile_order_with_trade(state: &AppState, order: &OrderRecord) -> Result<()> {
    let proposal = state
        .store
        .get_proposal(&order.proposal_id)
        .await?
        .with_context(|| format!("order {} references missing proposal {}", order.id, order.proposal_id))?;

    let effectively_filled = order.status == OrderStatus::Filled
        || (order.filled_quantity.unwrap_or(0.0) > 0.0
            && order.remaining_quantity == Some(0.0));

    match order.side {
        OrderSide::Entry => {
            if effectively_filled {
                entry_filled(state, order, &proposal).await?;
            } else if matches!(order.status, OrderStatus::Cancelled | OrderStatus::Rejected) {
                // Terminal failure before a fill: the proposal dies and no
                // trade is created.
                if proposal.status == ProposalStatus::Ready {
                    state
                        .store
                        .set_proposal_status(&proposal.id, ProposalStatus::Invalidated)
                        .await?;
                    info!(proposal_id = %proposal.id, "entry order terminal without fill, proposal invalidated");
                }
            }
        }
        OrderSide::Exit => {
            if effectively_filled {
                exit_filled(state, order, &proposal).await?;
            } else if matches!(order.status, OrderStatus::Cancelled | OrderStatus::Rejected) {
                if proposal.status == ProposalStatus::Ready {
                    state
                        .store
                        .set_proposal_status(&proposal.id, ProposalStatus::Invalidated)
                        .await?;
                }
                // The trade stays open so the next monitor cycle can retry.
                if let Some(trade_id) = &order.trade_id {
                    if let Some(mut trade) = state.store.get_trade(trade_id).await? {
                        if trade.status == TradeStatus::ClosingPending {
                            trade.status = TradeStatus::Open;
                            state.store.update_trade(&trade).await?;
                            warn!(trade_id = %trade.id, "exit order terminal without fill, trade back to OPEN");
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

async fn entry_filled(state: &AppState, order: &OrderRecord, proposal: &Proposal) -> Result<()> {
    let entry_price = order
        .avg_fill_price
        .unwrap_or_else(|| proposal.credit_target.abs());

    match state.store.get_trade_by_proposal(&proposal.id).await? {
        None => {
            // Strategy is copied verbatim from the proposal — never inferred
            // or substituted.
            let is_credit = proposal.strategy.is_credit();
            let (max_profit, max_loss) = if is_credit {
                (entry_price, proposal.width - entry_price)
            } else {
                (proposal.width - entry_price, entry_price)
            };

            let trade = Trade {
                id: Uuid::new_v4().to_string(),
                proposal_id: proposal.id.clone(),
                symbol: proposal.symbol.clone(),
                expiration: proposal.expiration.clone(),
                strategy: proposal.strategy,
                short_strike: proposal.short_strike,
                long_strike: proposal.long_strike,
                width: proposal.width,
                quantity: proposal.quantity,
                entry_price: Some(entry_price),
                exit_price: None,
                max_profit: Some(max_profit),
                max_loss: Some(max_loss),
                realized_pnl: None,
                max_seen_profit_fraction: 0.0,
                iv_entry: None,
                status: TradeStatus::Open,
                exit_reason: None,
                broker_order_id_open: order.broker_order_id.clone(),
                broker_order_id_close: None,
                opened_at: Some(now_rfc3339()),
                closed_at: None,
                created_at: now_rfc3339(),
                updated_at: now_rfc3339(),
            };
            state.store.insert_trade(&trade).await?;
            state.store.set_order_trade(&order.id, &trade.id).await?;

            info!(
                trade_id = %trade.id,
                proposal_id = %proposal.id,
                strategy = %trade.strategy,
                entry_price,
                "entry filled, trade opened"
            );
        }
        Some(mut trade) => {
            if trade.status.is_terminal() {
                return Ok(());
            }
            trade.entry_price = Some(entry_price);
            if trade.status == TradeStatus::EntryPending {
                trade.status = TradeStatus::Open;
                trade.opened_at = Some(now_rfc3339());
            }
            if trade.broker_order_id_open.is_none() {
                trade.broker_order_id_open = order.broker_order_id.clone();
            }
            state.store.update_trade(&trade).await?;
        }
    }

    state
        .store
        .set_proposal_status(&proposal.id, ProposalStatus::Consumed)
        .await?;
    Ok(())
}

async fn exit_filled(state: &AppState, order: &OrderRecord, proposal: &Proposal) -> Result<()> {
    let trade_id = order
        .trade_id
        .clone()
        .or_else(|| proposal.linked_trade_id.clone())
        .with_context(|| format!("exit order {} has no trade reference", order.id))?;

    let Some(mut trade) = state.store.get_trade(&trade_id).await? else {
        warn!(order_id = %order.id, trade_id = %trade_id, "exit fill for unknown trade");
        return Ok(());
    };

    if trade.status == TradeStatus::Closed {
        // Already reconciled; keep this idempotent.
        return Ok(());
    }

    let exit_price = order.avg_fill_price.unwrap_or(0.0);
    // A trade that somehow closed without a recorded entry gets a zero PnL
    // rather than a hole: CLOSED rows always carry all three exit fields.
    let realized = match trade.entry_price {
        Some(entry) => {
            let per_spread = if trade.strategy.is_credit() {
                entry - exit_price
            } else {
                exit_price - entry
            };
            per_spread * trade.quantity as f64 * 100.0
        }
        None => 0.0,
    };

    trade.status = TradeStatus::Closed;
    trade.exit_price = Some(exit_price);
    trade.realized_pnl = Some(realized);
    trade.closed_at = Some(now_rfc3339());
    if trade.broker_order_id_close.is_none() {
        trade.broker_order_id_close = order.broker_order_id.clone();
    }
    // exit_reason set at submission time is preserved as-is.
    state.store.update_trade(&trade).await?;

    state
        .store
        .set_proposal_status(&proposal.id, ProposalStatus::Consumed)
        .await?;

    info!(
        trade_id = %trade.id,
        exit_price,
        realized_pnl = realized,
        exit_reason = ?trade.exit_reason,
        "exit filled, trade closed"
    );

    let config = EngineConfig::resolve(&state.store).await?;
    risk::record_exit_fill(&state.store, &config, &trade, realized, Utc::now()).await?;

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerClient;
    use crate::notify::Notifier;
    use crate::store::Store;
    use crate::types::{ProposalKind, Strategy};

    async fn test_state() -> AppState {
        let store = Store::open_in_memory().await.unwrap();
        let broker = BrokerClient::new("test-token", TradingMode::DryRun);
        AppState::new(store, broker, "acct-1".to_string(), Notifier::disabled())
    }

    fn proposal(id: &str, strategy: Strategy) -> Proposal {
        let (short, long) = if strategy.long_strike_offset() < 0.0 {
            (580.0, 575.0)
        } else {
            (580.0, 585.0)
        };
        Proposal {
            id: id.to_string(),
            symbol: "SPY".to_string(),
            expiration: "2025-01-17".to_string(),
            short_strike: short,
            long_strike: long,
            width: 5.0,
            quantity: 1,
            strategy,
            credit_target: if strategy.is_credit() { 0.65 } else { -2.0 },
            score: 0.7,
            score_ivr: 0.5,
            score_vertical_skew: 0.5,
            score_term_structure: 0.5,
            score_delta_fitness: 0.5,
            score_ev: 0.5,
            status: ProposalStatus::Ready,
            kind: ProposalKind::Entry,
            linked_trade_id: None,
            created_at: now_rfc3339(),
        }
    }

    fn order(id: &str, proposal_id: &str, side: OrderSide, client_id: &str) -> OrderRecord {
        OrderRecord {
            id: id.to_string(),
            proposal_id: proposal_id.to_string(),
            trade_id: None,
            side,
            client_order_id: client_id.to_string(),
            broker_order_id: None,
            status: OrderStatus::Pending,
            avg_fill_price: None,
            filled_quantity: None,
            remaining_quantity: None,
            snapshot_id: None,
            created_at: now_rfc3339(),
            updated_at: now_rfc3339(),
        }
    }

    fn broker_order(id: &str, client_id: Option<&str>, status: &str, avg: Option<f64>) -> BrokerOrder {
        BrokerOrder {
            id: id.to_string(),
            client_order_id: client_id.map(str::to_string),
            status: status.to_string(),
            avg_fill_price: avg,
            filled_quantity: avg.map(|_| 1.0),
            remaining_quantity: avg.map(|_| 0.0),
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn status_normalization_table() {
        assert_eq!(normalize_status("filled"), OrderStatus::Filled);
        assert_eq!(normalize_status("FILLED"), OrderStatus::Filled);
        assert_eq!(normalize_status("partially_filled"), OrderStatus::Partial);
        assert_eq!(normalize_status("partial"), OrderStatus::Partial);
        assert_eq!(normalize_status("cancelled"), OrderStatus::Cancelled);
        assert_eq!(normalize_status("canceled"), OrderStatus::Cancelled);
        assert_eq!(normalize_status("rejected"), OrderStatus::Rejected);
        assert_eq!(normalize_status("open"), OrderStatus::Placed);
        assert_eq!(normalize_status("pending"), OrderStatus::Placed);
        assert_eq!(normalize_status("new"), OrderStatus::Placed);
        assert_eq!(normalize_status("expired?"), OrderStatus::Pending);
    }

    #[tokio::test]
    async fn entry_fill_creates_trade_with_verbatim_strategy() {
        let state = test_state().await;
        let p = proposal("p1", Strategy::BearCallCredit);
        state.store.insert_proposal(&p).await.unwrap();
        state
            .store
            .insert_order(&order("o1", "p1", OrderSide::Entry, "c1"))
            .await
            .unwrap();

        let bo = broker_order("b1", Some("c1"), "filled", Some(0.65));
        let result = apply_broker_order(&state, &bo, None).await.unwrap();
        assert!(matches!(result, ApplyResult::Updated(_)));

        let trade = state.store.get_trade_by_proposal("p1").await.unwrap().unwrap();
        assert_eq!(trade.strategy, Strategy::BearCallCredit);
        assert_eq!(trade.entry_price, Some(0.65));
        assert_eq!(trade.status, TradeStatus::Open);
        assert!((trade.max_profit.unwrap() - 0.65).abs() < 1e-9);
        assert!((trade.max_loss.unwrap() - 4.35).abs() < 1e-9);

        let p = state.store.get_proposal("p1").await.unwrap().unwrap();
        assert_eq!(p.status, ProposalStatus::Consumed);
    }

    #[tokio::test]
    async fn reconciling_same_payload_twice_is_idempotent() {
        let state = test_state().await;
        state
            .store
            .insert_proposal(&proposal("p1", Strategy::BullPutCredit))
            .await
            .unwrap();
        state
            .store
            .insert_order(&order("o1", "p1", OrderSide::Entry, "c1"))
            .await
            .unwrap();

        let bo = broker_order("b1", Some("c1"), "filled", Some(1.00));
        apply_broker_order(&state, &bo, None).await.unwrap();
        let trade_after_first = state.store.get_trade_by_proposal("p1").await.unwrap().unwrap();

        apply_broker_order(&state, &bo, None).await.unwrap();
        let trade_after_second = state.store.get_trade_by_proposal("p1").await.unwrap().unwrap();

        // Exactly one trade, unchanged by the replay.
        assert_eq!(trade_after_first.id, trade_after_second.id);
        assert_eq!(trade_after_first.entry_price, trade_after_second.entry_price);
        assert_eq!(trade_after_second.status, TradeStatus::Open);
    }

    #[tokio::test]
    async fn entry_rejection_invalidates_proposal_without_trade() {
        let state = test_state().await;
        state
            .store
            .insert_proposal(&proposal("p1", Strategy::BullPutCredit))
            .await
            .unwrap();
        state
            .store
            .insert_order(&order("o1", "p1", OrderSide::Entry, "c1"))
            .await
            .unwrap();

        let bo = broker_order("b1", Some("c1"), "rejected", None);
        apply_broker_order(&state, &bo, None).await.unwrap();

        assert!(state.store.get_trade_by_proposal("p1").await.unwrap().is_none());
        let p = state.store.get_proposal("p1").await.unwrap().unwrap();
        assert_eq!(p.status, ProposalStatus::Invalidated);
    }

    #[tokio::test]
    async fn exit_fill_closes_trade_and_records_pnl() {
        let state = test_state().await;

        // Open trade: BULL_PUT_CREDIT entry 1.00 qty 1.
        let entry_p = proposal("p1", Strategy::BullPutCredit);
        state.store.insert_proposal(&entry_p).await.unwrap();
        state
            .store
            .insert_order(&order("o1", "p1", OrderSide::Entry, "c1"))
            .await
            .unwrap();
        apply_broker_order(&state, &broker_order("b1", Some("c1"), "filled", Some(1.00)), None)
            .await
            .unwrap();
        let trade = state.store.get_trade_by_proposal("p1").await.unwrap().unwrap();

        // Exit order linked to the trade, with the exit reason staged.
        let mut closing = trade.clone();
        closing.status = TradeStatus::ClosingPending;
        closing.exit_reason = Some("PROFIT_TARGET".to_string());
        state.store.update_trade(&closing).await.unwrap();

        let mut exit_p = proposal("p2", Strategy::BullPutCredit);
        exit_p.kind = ProposalKind::Exit;
        exit_p.linked_trade_id = Some(trade.id.clone());
        state.store.insert_proposal(&exit_p).await.unwrap();

        let mut exit_order = order("o2", "p2", OrderSide::Exit, "c2");
        exit_order.trade_id = Some(trade.id.clone());
        state.store.insert_order(&exit_order).await.unwrap();

        apply_broker_order(&state, &broker_order("b2", Some("c2"), "filled", Some(0.48)), None)
            .await
            .unwrap();

        let closed = state.store.get_trade(&trade.id).await.unwrap().unwrap();
        assert_eq!(closed.status, TradeStatus::Closed);
        assert_eq!(closed.exit_price, Some(0.48));
        // (1.00 - 0.48) * 1 * 100 = 52.
        assert!((closed.realized_pnl.unwrap() - 52.0).abs() < 1e-9);
        assert!(closed.closed_at.is_some());
        assert_eq!(closed.exit_reason.as_deref(), Some("PROFIT_TARGET"));

        let p2 = state.store.get_proposal("p2").await.unwrap().unwrap();
        assert_eq!(p2.status, ProposalStatus::Consumed);
    }

    #[tokio::test]
    async fn exit_rejection_reverts_trade_to_open() {
        let state = test_state().await;

        let entry_p = proposal("p1", Strategy::BullPutCredit);
        state.store.insert_proposal(&entry_p).await.unwrap();
        state
            .store
            .insert_order(&order("o1", "p1", OrderSide::Entry, "c1"))
            .await
            .unwrap();
        apply_broker_order(&state, &broker_order("b1", Some("c1"), "filled", Some(1.00)), None)
            .await
            .unwrap();
        let trade = state.store.get_trade_by_proposal("p1").await.unwrap().unwrap();

        let mut closing = trade.clone();
        closing.status = TradeStatus::ClosingPending;
        closing.exit_reason = Some("STOP_LOSS".to_string());
        state.store.update_trade(&closing).await.unwrap();

        let mut exit_p = proposal("p2", Strategy::BullPutCredit);
        exit_p.kind = ProposalKind::Exit;
        exit_p.linked_trade_id = Some(trade.id.clone());
        state.store.insert_proposal(&exit_p).await.unwrap();
        let mut exit_order = order("o2", "p2", OrderSide::Exit, "c2");
        exit_order.trade_id = Some(trade.id.clone());
        state.store.insert_order(&exit_order).await.unwrap();

        apply_broker_order(&state, &broker_order("b2", Some("c2"), "rejected", None), None)
            .await
            .unwrap();

        let reverted = state.store.get_trade(&trade.id).await.unwrap().unwrap();
        assert_eq!(reverted.status, TradeStatus::Open);
        let p2 = state.store.get_proposal("p2").await.unwrap().unwrap();
        assert_eq!(p2.status, ProposalStatus::Invalidated);
    }

    #[tokio::test]
    async fn unmatched_broker_order_is_skipped() {
        let state = test_state().await;
        let bo = broker_order("b-foreign", Some("not-ours"), "filled", Some(1.0));
        let result = apply_broker_order(&state, &bo, None).await.unwrap();
        assert!(matches!(result, ApplyResult::Unmatched));
        assert_eq!(state.store.count_proposals().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fallback_match_by_broker_id() {
        let state = test_state().await;
        state
            .store
            .insert_proposal(&proposal("p1", Strategy::BullPutCredit))
            .await
            .unwrap();
        let mut o = order("o1", "p1", OrderSide::Entry, "c1");
        o.broker_order_id = Some("b9".to_string());
        state.store.insert_order(&o).await.unwrap();
        state
            .store
            .apply_order_update("o1", OrderStatus::Placed, Some("b9"), None, None, None, None)
            .await
            .unwrap();

        // Broker omits the tag; the broker id still matches.
        let bo = broker_order("b9", None, "filled", Some(1.00));
        let result = apply_broker_order(&state, &bo, None).await.unwrap();
        assert!(matches!(result, ApplyResult::Updated(_)));
        assert!(state.store.get_trade_by_proposal("p1").await.unwrap().is_some());
    }
}
