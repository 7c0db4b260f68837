// =============================================================================
// Order executor — entry placement and position-derived exits
// =============================================================================
//
// Every placement, including per-leg fallbacks, carries a freshly generated
// client order id, and a local PENDING order row exists *before* the broker
// call — cancellation racing the ack leaves a row the next sync reconciles.
//
// DRY_RUN placements never reach the broker: a synthetic ack and fill are
// recorded locally and pushed through the same reconciliation path as real
// fills.
// =============================================================================

use std::time::Instant;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::broker::{
    BrokerError, LegAction, OrderLeg, SingleLegCloseRequest, SpreadOrderRequest, SpreadPricing,
};
use crate::config::EngineConfig;
use crate::occ;
use crate::reconcile;
use crate::risk;
use crate::store::models::{BrokerEventRecord, OrderRecord, PortfolioPosition, Proposal};
use crate::store::now_rfc3339;
use crate::types::{
    CloseTrigger, OrderSide, OrderStatus, PositionSide, ProposalKind, ProposalStatus, TradingMode,
};
use crate::store::models::Trade;

/// Outcome of a placement attempt.
#[derive(Debug, Clone)]
pub enum PlacementOutcome {
    /// Order acknowledged by the broker.
    Placed { order_id: String, broker_order_id: String },
    /// DRY_RUN synthetic ack.
    Simulated { order_id: String, broker_order_id: String },
    /// Placement failed; the reason explains why.
    Failed(String),
}

// ---------------------------------------------------------------------------
// Entry placement
// ---------------------------------------------------------------------------

/// Place the entry order for a READY proposal: a limit spread at the
/// proposal's credit/debit target.
pub async fn place_entry(
    state: &AppState,
    proposal: &Proposal,
    config: &EngineConfig,
) -> Result<PlacementOutcome> {
    if proposal.status != ProposalStatus::Ready {
        bail!("proposal {} is {}, not READY", proposal.id, proposal.status);
    }

    let expiration = chrono::NaiveDate::parse_from_str(&proposal.expiration, "%Y-%m-%d")
        .with_context(|| format!("proposal {} has bad expiration", proposal.id))?;
    let option_type = proposal.strategy.option_type();

    let short_symbol = occ::encode(&proposal.symbol, expiration, option_type, proposal.short_strike);
    let long_symbol = occ::encode(&proposal.symbol, expiration, option_type, proposal.long_strike);

    let legs = vec![
        OrderLeg {
            option_symbol: short_symbol,
            side: LegAction::SellToOpen,
            quantity: proposal.quantity,
        },
        OrderLeg {
            option_symbol: long_symbol,
            side: LegAction::BuyToOpen,
            quantity: proposal.quantity,
        },
    ];

    let pricing = if proposal.strategy.is_credit() {
        SpreadPricing::Credit(proposal.credit_target)
    } else {
        SpreadPricing::Debit(-proposal.credit_target)
    };

    let client_order_id = Uuid::new_v4().to_string();
    let order = new_order_row(&proposal.id, None, OrderSide::Entry, &client_order_id);
    state.store.insert_order(&order).await?;

    if config.mode == TradingMode::DryRun {
        return simulate_fill(state, &order, proposal.credit_target.abs(), proposal.quantity).await;
    }

    let request = SpreadOrderRequest {
        symbol: proposal.symbol.clone(),
        legs,
        pricing,
        client_order_id: client_order_id.clone(),
        tag: format!("entry-{}", proposal.id),
    };

    let started = Instant::now();
    let result = state
        .broker
        .place_spread_order(&state.account_id, &request)
        .await;
    let duration_ms = started.elapsed().as_millis() as i64;

    record_placement_event(
        state,
        "place_spread_order",
        &proposal.symbol,
        Some(&proposal.expiration),
        result.as_ref().ok().map(|a| a.id.as_str()),
        &result,
        duration_ms,
        config.mode,
        Some(proposal.strategy.as_str()),
    )
    .await;

    match result {
        Ok(ack) => {
            state
                .store
                .apply_order_update(
                    &order.id,
                    OrderStatus::Placed,
                    Some(&ack.id),
                    None,
                    None,
                    None,
                    None,
                )
                .await?;

            info!(
                proposal_id = %proposal.id,
                order_id = %order.id,
                broker_order_id = %ack.id,
                "entry order placed"
            );

            // Targeted sync so a fast fill promotes the trade immediately.
            if let Err(e) = reconcile::sync_single_order(state, config, &ack.id).await {
                warn!(error = %e, "targeted post-entry sync failed");
            }

            Ok(PlacementOutcome::Placed {
                order_id: order.id,
                broker_order_id: ack.id,
            })
        }
        Err(e) => {
            let message = e.to_string();
            state
                .store
                .apply_order_update(&order.id, OrderStatus::Rejected, None, None, None, None, None)
                .await?;

            if risk::is_benign_broker_rejection(&message) {
                // Routine closed-market rejection: the proposal stays READY
                // for the next cycle and nothing escalates.
                info!(proposal_id = %proposal.id, "entry rejected benignly (market closed)");
            } else {
                state
                    .store
                    .set_proposal_status(&proposal.id, ProposalStatus::Invalidated)
                    .await?;
                warn!(proposal_id = %proposal.id, error = %message, "entry placement failed");
            }

            Ok(PlacementOutcome::Failed(message))
        }
    }
}

// ---------------------------------------------------------------------------
// Exit placement
// ---------------------------------------------------------------------------

/// How a set of held legs should be closed.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitPlan {
    Nothing,
    SingleLeg(PortfolioPosition),
    /// All legs share (symbol, expiration): one multileg order.
    Multileg(Vec<PortfolioPosition>),
    /// Heterogeneous legs: close each with its own market order.
    PerLeg(Vec<PortfolioPosition>),
}

/// Classify held legs into an exit plan.
pub fn build_exit_plan(positions: &[PortfolioPosition]) -> ExitPlan {
    let held: Vec<PortfolioPosition> =
        positions.iter().filter(|p| p.quantity > 0).cloned().collect();

    match held.len() {
        0 => ExitPlan::Nothing,
        1 => ExitPlan::SingleLeg(held.into_iter().next().expect("len checked")),
        _ => {
            let first_key = (held[0].symbol.clone(), held[0].expiration.clone());
            if held
                .iter()
                .all(|p| (p.symbol.clone(), p.expiration.clone()) == first_key)
            {
                ExitPlan::Multileg(held)
            } else {
                ExitPlan::PerLeg(held)
            }
        }
    }
}

fn close_action(side: PositionSide) -> LegAction {
    match side {
        PositionSide::Long => LegAction::SellToClose,
        PositionSide::Short => LegAction::BuyToClose,
    }
}

/// Submit an exit for a trade. Builds the payload from the trade's held
/// positions, marks the trade CLOSING_PENDING with its exit reason, and
/// falls back from a rejected multileg to per-leg market orders.
pub async fn submit_exit(
    state: &AppState,
    trade: &Trade,
    trigger: CloseTrigger,
    reason: &str,
    config: &EngineConfig,
) -> Result<PlacementOutcome> {
    let positions = trade_positions(state, trade, config).await?;
    let plan = build_exit_plan(&positions);

    if plan == ExitPlan::Nothing {
        bail!("nothing to close for trade {}", trade.id);
    }

    info!(trade_id = %trade.id, trigger = %trigger, reason, "submitting exit");

    // Every exit intent gets its own proposal row so the orders it spawns
    // have an anchor, and a filled exit can mark it CONSUMED.
    let exit_proposal = exit_proposal_for(trade);
    state.store.insert_proposal(&exit_proposal).await?;

    // Flag the exit before any broker call; reconciliation reverts to OPEN
    // if every placement dies.
    let mut closing = trade.clone();
    closing.status = crate::types::TradeStatus::ClosingPending;
    closing.exit_reason = Some(reason.to_string());
    state.store.update_trade(&closing).await?;

    let outcome = match plan {
        ExitPlan::Nothing => unreachable!("handled above"),
        ExitPlan::SingleLeg(position) => {
            place_leg_close(state, trade, &exit_proposal, &position, config).await?
        }
        ExitPlan::Multileg(legs) => {
            place_multileg_exit(state, trade, &exit_proposal, &legs, config).await?
        }
        ExitPlan::PerLeg(legs) => {
            place_per_leg_exits(state, trade, &exit_proposal, &legs, config).await?
        }
    };

    match &outcome {
        PlacementOutcome::Placed { broker_order_id, .. }
        | PlacementOutcome::Simulated { broker_order_id, .. } => {
            let mut updated = state
                .store
                .get_trade(&trade.id)
                .await?
                .with_context(|| format!("trade {} vanished during exit", trade.id))?;
            if updated.broker_order_id_close.is_none() {
                updated.broker_order_id_close = Some(broker_order_id.clone());
                state.store.update_trade(&updated).await?;
            }
        }
        PlacementOutcome::Failed(message) => {
            // Exit never reached the broker: put the trade back so the next
            // monitor cycle retries.
            let mut reverted = closing.clone();
            reverted.status = crate::types::TradeStatus::Open;
            state.store.update_trade(&reverted).await?;
            state
                .store
                .set_proposal_status(&exit_proposal.id, ProposalStatus::Invalidated)
                .await?;
            warn!(trade_id = %trade.id, error = %message, "exit placement failed, trade back to OPEN");
        }
    }

    Ok(outcome)
}

/// The trade's two leg positions as the store (broker truth) knows them.
/// DRY_RUN fabricates both legs since no broker positions exist.
async fn trade_positions(
    state: &AppState,
    trade: &Trade,
    config: &EngineConfig,
) -> Result<Vec<PortfolioPosition>> {
    let option_type = trade.strategy.option_type();

    if config.mode == TradingMode::DryRun {
        let synth = |strike: f64, side: PositionSide| PortfolioPosition {
            symbol: trade.symbol.clone(),
            expiration: trade.expiration.clone(),
            option_type,
            strike,
            side,
            quantity: trade.quantity,
            cost_basis_per_contract: None,
            bid: None,
            ask: None,
            last: None,
            snapshot_id: "dry-run".to_string(),
            updated_at: now_rfc3339(),
        };
        return Ok(vec![
            synth(trade.short_strike, PositionSide::Short),
            synth(trade.long_strike, PositionSide::Long),
        ]);
    }

    let mut out = Vec::new();
    for (strike, side) in [
        (trade.short_strike, PositionSide::Short),
        (trade.long_strike, PositionSide::Long),
    ] {
        if let Some(p) = state
            .store
            .position_for_leg(&trade.symbol, &trade.expiration, option_type, strike, side)
            .await?
        {
            out.push(p);
        }
    }
    Ok(out)
}

async fn place_multileg_exit(
    state: &AppState,
    trade: &Trade,
    exit_proposal: &Proposal,
    legs: &[PortfolioPosition],
    config: &EngineConfig,
) -> Result<PlacementOutcome> {
    // Market-like limit: pay up to the full width to escape a credit
    // spread; accept a token credit to unload a debit spread.
    let pricing = if trade.strategy.is_credit() {
        SpreadPricing::Debit(trade.width)
    } else {
        SpreadPricing::Credit(0.01)
    };

    let order_legs: Vec<OrderLeg> = legs
        .iter()
        .map(|p| {
            Ok(OrderLeg {
                option_symbol: p.occ_symbol()?,
                side: close_action(p.side),
                quantity: p.quantity.min(trade.quantity),
            })
        })
        .collect::<Result<_>>()?;

    let client_order_id = Uuid::new_v4().to_string();
    let order = new_order_row(&exit_proposal.id, Some(&trade.id), OrderSide::Exit, &client_order_id);
    state.store.insert_order(&order).await?;

    if config.mode == TradingMode::DryRun {
        // Synthetic fill at entry keeps dry-run PnL neutral.
        return simulate_fill(state, &order, trade.entry_price.unwrap_or(0.0), trade.quantity).await;
    }

    let request = SpreadOrderRequest {
        symbol: trade.symbol.clone(),
        legs: order_legs,
        pricing,
        client_order_id: client_order_id.clone(),
        tag: format!("exit-{}", trade.id),
    };

    let started = Instant::now();
    let result = state
        .broker
        .place_spread_order(&state.account_id, &request)
        .await;
    let duration_ms = started.elapsed().as_millis() as i64;

    record_placement_event(
        state,
        "place_spread_order",
        &trade.symbol,
        Some(&trade.expiration),
        result.as_ref().ok().map(|a| a.id.as_str()),
        &result,
        duration_ms,
        config.mode,
        Some(trade.strategy.as_str()),
    )
    .await;

    match result {
        Ok(ack) => {
            state
                .store
                .apply_order_update(
                    &order.id,
                    OrderStatus::Placed,
                    Some(&ack.id),
                    None,
                    None,
                    None,
                    None,
                )
                .await?;
            info!(trade_id = %trade.id, broker_order_id = %ack.id, "multileg exit placed");

            if let Err(e) = reconcile::sync_single_order(state, config, &ack.id).await {
                warn!(error = %e, "targeted post-exit sync failed");
            }

            Ok(PlacementOutcome::Placed {
                order_id: order.id,
                broker_order_id: ack.id,
            })
        }
        Err(e) if is_rejection(&e) => {
            // Broker refused the multileg: mark it and fall back to closing
            // each leg with its own market order.
            state
                .store
                .apply_order_update(&order.id, OrderStatus::Rejected, None, None, None, None, None)
                .await?;
            warn!(trade_id = %trade.id, error = %e, "multileg exit rejected, falling back per-leg");
            place_per_leg_exits(state, trade, exit_proposal, legs, config).await
        }
        Err(e) => {
            state
                .store
                .apply_order_update(&order.id, OrderStatus::Rejected, None, None, None, None, None)
                .await?;
            Ok(PlacementOutcome::Failed(e.to_string()))
        }
    }
}

async fn place_per_leg_exits(
    state: &AppState,
    trade: &Trade,
    exit_proposal: &Proposal,
    legs: &[PortfolioPosition],
    config: &EngineConfig,
) -> Result<PlacementOutcome> {
    let mut first_ack: Option<(String, String)> = None;
    let mut failures: Vec<String> = Vec::new();

    for leg in legs {
        // Fresh client id per fallback leg.
        let client_order_id = Uuid::new_v4().to_string();
        let order = new_order_row(&exit_proposal.id, Some(&trade.id), OrderSide::Exit, &client_order_id);
        state.store.insert_order(&order).await?;

        if config.mode == TradingMode::DryRun {
            simulate_fill(state, &order, trade.entry_price.unwrap_or(0.0), leg.quantity).await?;
            if first_ack.is_none() {
                first_ack = Some((order.id.clone(), format!("sim-{client_order_id}")));
            }
            continue;
        }

        let request = SingleLegCloseRequest {
            symbol: trade.symbol.clone(),
            option_symbol: leg.occ_symbol()?,
            side: close_action(leg.side),
            quantity: leg.quantity.min(trade.quantity),
            client_order_id: client_order_id.clone(),
            tag: format!("exit-leg-{}", trade.id),
        };

        let started = Instant::now();
        let result = state
            .broker
            .place_single_leg_close_order(&state.account_id, &request)
            .await;
        let duration_ms = started.elapsed().as_millis() as i64;

        record_placement_event(
            state,
            "place_single_leg_close_order",
            &trade.symbol,
            Some(&trade.expiration),
            result.as_ref().ok().map(|a| a.id.as_str()),
            &result,
            duration_ms,
            config.mode,
            Some(trade.strategy.as_str()),
        )
        .await;

        match result {
            Ok(ack) => {
                state
                    .store
                    .apply_order_update(
                        &order.id,
                        OrderStatus::Placed,
                        Some(&ack.id),
                        None,
                        None,
                        None,
                        None,
                    )
                    .await?;
                if first_ack.is_none() {
                    first_ack = Some((order.id.clone(), ack.id.clone()));
                }
            }
            Err(e) => {
                state
                    .store
                    .apply_order_update(&order.id, OrderStatus::Rejected, None, None, None, None, None)
                    .await?;
                failures.push(e.to_string());
            }
        }
    }

    match first_ack {
        Some((order_id, broker_order_id)) => {
            if !failures.is_empty() {
                warn!(trade_id = %trade.id, failures = ?failures, "some per-leg exits failed");
            }
            if config.mode == TradingMode::DryRun {
                Ok(PlacementOutcome::Simulated { order_id, broker_order_id })
            } else {
                Ok(PlacementOutcome::Placed { order_id, broker_order_id })
            }
        }
        None => Ok(PlacementOutcome::Failed(failures.join("; "))),
    }
}

async fn place_leg_close(
    state: &AppState,
    trade: &Trade,
    exit_proposal: &Proposal,
    position: &PortfolioPosition,
    config: &EngineConfig,
) -> Result<PlacementOutcome> {
    place_per_leg_exits(state, trade, exit_proposal, std::slice::from_ref(position), config).await
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn new_order_row(
    proposal_id: &str,
    trade_id: Option<&str>,
    side: OrderSide,
    client_order_id: &str,
) -> OrderRecord {
    OrderRecord {
        id: Uuid::new_v4().to_string(),
        proposal_id: proposal_id.to_string(),
        trade_id: trade_id.map(str::to_string),
        side,
        client_order_id: client_order_id.to_string(),
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

fn exit_proposal_for(trade: &Trade) -> Proposal {
    Proposal {
        id: Uuid::new_v4().to_string(),
        symbol: trade.symbol.clone(),
        expiration: trade.expiration.clone(),
        short_strike: trade.short_strike,
        long_strike: trade.long_strike,
        width: trade.width,
        quantity: trade.quantity,
        strategy: trade.strategy,
        // Exit intent: pay up to width to escape a credit spread, accept a
        // token credit for a debit spread.
        credit_target: if trade.strategy.is_credit() {
            -trade.width
        } else {
            0.01
        },
        score: 0.0,
        score_ivr: 0.0,
        score_vertical_skew: 0.0,
        score_term_structure: 0.0,
        score_delta_fitness: 0.0,
        score_ev: 0.0,
        status: ProposalStatus::Ready,
        kind: ProposalKind::Exit,
        linked_trade_id: Some(trade.id.clone()),
        created_at: now_rfc3339(),
    }
}

/// DRY_RUN: synthetic ack + fill, pushed through the normal reconciliation
/// path so trades are created/closed exactly as they would be live.
async fn simulate_fill(
    state: &AppState,
    order: &OrderRecord,
    avg_fill_price: f64,
    quantity: i64,
) -> Result<PlacementOutcome> {
    let broker_order_id = format!("sim-{}", order.client_order_id);

    state
        .store
        .apply_order_update(
            &order.id,
            OrderStatus::Placed,
            Some(&broker_order_id),
            None,
            None,
            None,
            None,
        )
        .await?;
    let filled = state
        .store
        .apply_order_update(
            &order.id,
            OrderStatus::Filled,
            None,
            Some(avg_fill_price),
            Some(quantity as f64),
            Some(0.0),
            None,
        )
        .await?;

    reconcile::reconcile_order_with_trade(state, &filled).await?;

    info!(
        order_id = %order.id,
        broker_order_id = %broker_order_id,
        avg_fill_price,
        "dry-run fill simulated"
    );

    Ok(PlacementOutcome::Simulated {
        order_id: order.id.clone(),
        broker_order_id,
    })
}

fn is_rejection(error: &BrokerError) -> bool {
    matches!(error, BrokerError::Http { status, .. } if *status < 500)
}

#[allow(clippy::too_many_arguments)]
async fn record_placement_event(
    state: &AppState,
    operation: &str,
    symbol: &str,
    expiration: Option<&str>,
    broker_order_id: Option<&str>,
    result: &crate::broker::BrokerResult<crate::broker::PlacedOrder>,
    duration_ms: i64,
    mode: TradingMode,
    strategy: Option<&str>,
) {
    let (ok, status_code, error_message) = match result {
        Ok(_) => (true, Some(200), None),
        Err(BrokerError::Http { status, body }) => {
            (false, Some(*status as i64), Some(body.clone()))
        }
        Err(e) => (false, None, Some(e.to_string())),
    };

    let event = BrokerEventRecord {
        operation: operation.to_string(),
        symbol: Some(symbol.to_string()),
        expiration: expiration.map(str::to_string),
        order_id: broker_order_id.map(str::to_string),
        status_code,
        ok,
        duration_ms,
        mode: mode.as_str().to_string(),
        error_message,
        strategy: strategy.map(str::to_string),
        created_at: now_rfc3339(),
    };

    if let Err(e) = state.store.record_broker_event(&event).await {
        warn!(error = %e, "failed to record broker event");
    }
}
