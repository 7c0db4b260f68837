// =============================================================================
// Trade cycle — the periodic driver
// =============================================================================
//
// Tick order is fixed: snapshot sync refreshes broker truth, portfolio
// repair and close-rule evaluation submit any exits, the order sync folds
// fills in, and only then may a new entry go out behind the risk gate.
// Exits always outrank entries.
//
// Ticks are not reentrant: the cycle lock is try-acquired and an overlapping
// tick is skipped with a log line.
// =============================================================================

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::config::{keys, EngineConfig};
use crate::executor;
use crate::monitor;
use crate::proposals;
use crate::reconcile;
use crate::risk;
use crate::snapshot;
use crate::types::CloseTrigger;

/// What one tick did, for logs and the admin surface.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub skipped: Option<String>,
    pub snapshot_ok: bool,
    pub repaired_broken: u32,
    pub evaluated: u32,
    pub exits_submitted: u32,
    pub proposal_created: bool,
    pub entry_placed: bool,
}

/// Run one trade cycle. Returns early (with `skipped` set) when another
/// tick still holds the lock.
pub async fn trade_cycle(state: &AppState, now: DateTime<Utc>) -> Result<CycleReport> {
    let Ok(_guard) = state.cycle_lock.try_lock() else {
        warn!("previous trade cycle still running, skipping tick");
        return Ok(CycleReport {
            skipped: Some("previous cycle still running".to_string()),
            ..CycleReport::default()
        });
    };

    let result = run_tick(state, now).await;

    match &result {
        Ok(report) => {
            if let Err(e) = state
                .store
                .set_setting(keys::LAST_TRADE_CYCLE_HEARTBEAT, &now.to_rfc3339())
                .await
            {
                warn!(error = %e, "failed to write heartbeat");
            }
            debug!(?report, "trade cycle complete");
        }
        Err(e) => {
            error!(error = %e, "trade cycle failed");
            let _ = state
                .store
                .set_setting(keys::LAST_TRADE_CYCLE_ERROR, &format!("{now}: {e:#}"))
                .await;
        }
    }

    result
}

async fn run_tick(state: &AppState, now: DateTime<Utc>) -> Result<CycleReport> {
    let mut report = CycleReport::default();
    let config = EngineConfig::resolve(&state.store).await?;

    // ── 1. Snapshot sync (broker truth) ──────────────────────────────────
    let snap = snapshot::sync_broker_snapshot(state, &config, &state.account_id).await?;
    report.snapshot_ok = snap.is_coherent();
    if !report.snapshot_ok {
        // Broker truth is unavailable; acting on stale state risks double
        // submissions. Retry next tick.
        warn!(errors = ?snap.errors, warnings = ?snap.warnings, "snapshot incoherent, deferring tick");
        return Ok(report);
    }
    debug!(
        snapshot_id = %snap.snapshot_id,
        as_of = %snap.as_of,
        positions = snap.position_count,
        orders = snap.order_count,
        warnings = snap.warnings.len(),
        "snapshot refreshed"
    );

    // ── 2. Portfolio repair, then per-trade close rules ──────────────────
    let repair = monitor::repair_portfolio(state, &config, now).await?;
    report.repaired_broken = repair.broken;

    let open_trades = state.store.open_trades().await?;
    for trade in &open_trades {
        report.evaluated += 1;
        let evaluation = monitor::evaluate_open_trade(state, trade, &config, now).await;

        if evaluation.trigger == CloseTrigger::None {
            continue;
        }

        let reason = match (evaluation.trigger, &evaluation.reason) {
            (CloseTrigger::Emergency, Some(detail)) => format!("EMERGENCY: {detail}"),
            (CloseTrigger::Emergency, None) => "EMERGENCY".to_string(),
            (trigger, _) => trigger.as_str().to_string(),
        };

        info!(
            trade_id = %trade.id,
            trigger = %evaluation.trigger,
            reason = %reason,
            profit_fraction = ?evaluation.metrics.as_ref().and_then(|m| m.profit_fraction),
            "close rule triggered"
        );

        match executor::submit_exit(state, trade, evaluation.trigger, &reason, &config).await {
            Ok(_) => report.exits_submitted += 1,
            Err(e) => error!(trade_id = %trade.id, error = %e, "exit submission failed"),
        }
    }

    // ── 3. Fold order state (fills from the exits above included) ────────
    if let Err(e) = reconcile::sync_orders(state, &config).await {
        warn!(error = %e, "order sync failed, retrying next tick");
    }

    // ── 4. Risk gate, then at most one new entry ─────────────────────────
    let (can_open, block_reason) = risk::can_open_new_trade(&state.store, &config, now).await?;
    if !can_open {
        debug!(reason = ?block_reason, "entry gate closed");
        return Ok(report);
    }

    // A READY proposal left over from a benign rejection retries before any
    // new pipeline run.
    let proposal = match state.store.latest_ready_entry_proposal().await? {
        Some(existing) => Some(existing),
        None => {
            let outcome = proposals::generate_proposal(state, now).await;
            report.proposal_created = outcome.proposal.is_some();
            outcome.proposal
        }
    };

    if let Some(proposal) = proposal {
        match executor::place_entry(state, &proposal, &config).await {
            Ok(executor::PlacementOutcome::Placed { .. })
            | Ok(executor::PlacementOutcome::Simulated { .. }) => {
                report.entry_placed = true;
            }
            Ok(executor::PlacementOutcome::Failed(reason)) => {
                warn!(proposal_id = %proposal.id, reason = %reason, "entry not placed");
            }
            Err(e) => {
                error!(proposal_id = %proposal.id, error = %e, "entry placement errored");
            }
        }
    }

    Ok(report)
}
