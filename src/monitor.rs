// =============================================================================
// Monitor — structural integrity & ordered close rules for open trades
// =============================================================================
//
// Rule order (first match wins):
//   1. EMERGENCY      — bad liquidity, bad quotes, or an underlying spike
//   2. (trailing peak update; persisted on the trade row)
//   3. TRAIL_PROFIT   — armed peak gave back too much
//   4. PROFIT_TARGET
//   5. STOP_LOSS
//   6. IV_CRUSH_EXIT  — credit spreads with a stored entry IV only
//   7. TIME_EXIT      — DTE at/below threshold and past the ET cutoff
//   8. LOW_VALUE_CLOSE — credit only
//   9. EMERGENCY      — non-positive mark (structure invalid)
//
// Trades without an entry price can only fire the integrity rules (1, 9)
// and TIME_EXIT. Structural failures surface as EMERGENCY with exit reason
// STRUCTURAL_BREAK before any P&L reasoning happens.
// =============================================================================

use anyhow::Result;
use chrono::{DateTime, NaiveTime, Utc};
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::broker::OptionQuote;
use crate::clock;
use crate::config::{CloseRuleConfig, EngineConfig};
use crate::executor;
use crate::price_window;
use crate::store::models::Trade;
use crate::types::{CloseTrigger, OrderStatus, PositionSide, TradingMode};

/// Broker positions are allowed to lag this long after entry before their
/// absence counts as a structural break.
const SETTLING_WINDOW_SECS: i64 = 120;

/// Window for the underlying spike check.
const SPIKE_WINDOW_SECS: i64 = 15;

// ---------------------------------------------------------------------------
// Evaluation types
// ---------------------------------------------------------------------------

/// Everything the close rules need, computed once per trade per cycle.
#[derive(Debug, Clone)]
pub struct TradeMetrics {
    pub short_mid: f64,
    pub long_mid: f64,
    /// shortMid - longMid for credit spreads, reversed for debit.
    pub current_mark: f64,
    pub unrealized_pnl: Option<f64>,
    pub profit_fraction: Option<f64>,
    pub loss_fraction: Option<f64>,
    pub dte: i64,
    pub short_spread: f64,
    pub long_spread: f64,
    pub quotes_ok: bool,
    pub liquidity_ok: bool,
    pub underlying_change_15s: Option<f64>,
    pub short_iv: Option<f64>,
}

/// Outcome of evaluating one open trade.
#[derive(Debug)]
pub struct TradeEvaluation {
    pub trigger: CloseTrigger,
    pub reason: Option<String>,
    pub metrics: Option<TradeMetrics>,
}

/// Summary of one repair pass.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RepairReport {
    pub checked: u32,
    pub skipped: u32,
    pub broken: u32,
}

enum Structural {
    Intact {
        short_leg: OptionQuote,
        long_leg: OptionQuote,
    },
    Broken(String),
}

// ---------------------------------------------------------------------------
// Pure pieces
// ---------------------------------------------------------------------------

/// Strike geometry must match the strategy within $0.01.
pub fn check_geometry(trade: &Trade) -> Result<(), String> {
    let actual_width = (trade.long_strike - trade.short_strike).abs();
    if (trade.width - actual_width).abs() > 0.01 {
        return Err(format!(
            "WIDTH_MISMATCH: width {} but strikes span {:.2}",
            trade.width, actual_width
        ));
    }

    let expected_long = trade
        .strategy
        .expected_long_strike(trade.short_strike, trade.width);
    if (trade.long_strike - expected_long).abs() > 0.01 {
        return Err(format!(
            "STRIKE_MISMATCH: expected long {:.2} for {} short {:.2}, got {:.2}",
            expected_long, trade.strategy, trade.short_strike, trade.long_strike
        ));
    }

    Ok(())
}

/// Compute the per-trade metrics from fresh leg quotes.
pub fn compute_metrics(
    trade: &Trade,
    short_leg: &OptionQuote,
    long_leg: &OptionQuote,
    dte: i64,
    underlying_change_15s: Option<f64>,
    rules: &CloseRuleConfig,
) -> TradeMetrics {
    let is_credit = trade.strategy.is_credit();
    let short_mid = short_leg.mid();
    let long_mid = long_leg.mid();
    let current_mark = if is_credit {
        short_mid - long_mid
    } else {
        long_mid - short_mid
    };

    let quotes_ok = short_leg.has_valid_quote() && long_leg.has_valid_quote();
    let liquidity_ok = short_leg.spread() <= rules.liquidity_spread_threshold
        && long_leg.spread() <= rules.liquidity_spread_threshold;

    let (unrealized_pnl, profit_fraction, loss_fraction) = match trade.entry_price {
        Some(entry) => {
            let pnl = if is_credit {
                entry - current_mark
            } else {
                current_mark - entry
            };

            let max_profit = trade
                .max_profit
                .unwrap_or_else(|| if is_credit { entry } else { trade.width - entry });
            let max_loss = trade
                .max_loss
                .unwrap_or_else(|| if is_credit { trade.width - entry } else { entry });

            let pf = if max_profit > 0.0 { Some(pnl / max_profit) } else { None };
            let lf = if max_loss > 0.0 {
                Some((-pnl / max_loss).max(0.0))
            } else {
                None
            };
            (Some(pnl), pf, lf)
        }
        None => (None, None, None),
    };

    TradeMetrics {
        short_mid,
        long_mid,
        current_mark,
        unrealized_pnl,
        profit_fraction,
        loss_fraction,
        dte,
        short_spread: short_leg.spread(),
        long_spread: long_leg.spread(),
        quotes_ok,
        liquidity_ok,
        underlying_change_15s,
        short_iv: short_leg.implied_volatility,
    }
}

/// The ordered close rules. Returns the trigger, a detail string, and the
/// updated trailing peak when it increased.
pub fn decide(
    trade: &Trade,
    metrics: &TradeMetrics,
    rules: &CloseRuleConfig,
    now_et: NaiveTime,
) -> (CloseTrigger, Option<String>, Option<f64>) {
    let is_credit = trade.strategy.is_credit();

    // ── 1. Emergency integrity ───────────────────────────────────────────
    if !metrics.liquidity_ok {
        return (
            CloseTrigger::Emergency,
            Some(format!(
                "LIQUIDITY: leg spreads {:.2}/{:.2} over {:.2}",
                metrics.short_spread, metrics.long_spread, rules.liquidity_spread_threshold
            )),
            None,
        );
    }
    if !metrics.quotes_ok {
        return (
            CloseTrigger::Emergency,
            Some("QUOTE_INTEGRITY: non-positive or crossed leg quote".to_string()),
            None,
        );
    }
    if let Some(change) = metrics.underlying_change_15s {
        if change.abs() > rules.underlying_spike_threshold {
            return (
                CloseTrigger::Emergency,
                Some(format!("UNDERLYING_SPIKE: {:.3}% in 15s", change * 100.0)),
                None,
            );
        }
    }

    // ── 2. Trailing peak update ──────────────────────────────────────────
    let mut new_peak = None;
    let mut peak = trade.max_seen_profit_fraction;
    if let Some(pf) = metrics.profit_fraction {
        let candidate = pf.max(0.0);
        if candidate > peak {
            peak = candidate;
            new_peak = Some(candidate);
        }
    }

    if let (Some(pf), Some(lf)) = (metrics.profit_fraction, metrics.loss_fraction) {
        // ── 3. Trail-profit giveback ─────────────────────────────────────
        if peak >= rules.trail_arm_fraction && (peak - pf) >= rules.trail_giveback_fraction {
            return (
                CloseTrigger::TrailProfit,
                Some(format!("peak {:.2} gave back to {:.2}", peak, pf)),
                new_peak,
            );
        }

        // ── 4. Profit target ─────────────────────────────────────────────
        let target = rules.profit_target(is_credit);
        if pf >= target {
            return (
                CloseTrigger::ProfitTarget,
                Some(format!("profit fraction {:.2} >= {:.2}", pf, target)),
                new_peak,
            );
        }

        // ── 5. Stop loss ─────────────────────────────────────────────────
        let stop = rules.stop_loss(is_credit);
        if lf >= stop {
            return (
                CloseTrigger::StopLoss,
                Some(format!("loss fraction {:.2} >= {:.2}", lf, stop)),
                new_peak,
            );
        }

        // ── 6. IV crush (credit with stored entry IV only) ───────────────
        if is_credit {
            if let (Some(entry_iv), Some(short_iv)) = (trade.iv_entry, metrics.short_iv) {
                if short_iv <= entry_iv * rules.iv_crush_ratio
                    && pf >= rules.iv_crush_min_pnl_fraction
                {
                    return (
                        CloseTrigger::IvCrushExit,
                        Some(format!(
                            "short IV {:.3} <= entry {:.3} x {:.2}",
                            short_iv, entry_iv, rules.iv_crush_ratio
                        )),
                        new_peak,
                    );
                }
            }
        }
    }

    // ── 7. Time exit ─────────────────────────────────────────────────────
    if metrics.dte <= rules.time_exit_dte && now_et >= rules.time_exit_cutoff {
        return (
            CloseTrigger::TimeExit,
            Some(format!("DTE {} at/under {}", metrics.dte, rules.time_exit_dte)),
            new_peak,
        );
    }

    // ── 8. Low-value close (credit only; a non-positive mark is rule 9's) ─
    if is_credit && metrics.profit_fraction.is_some() {
        if metrics.current_mark > 0.0 && metrics.current_mark <= rules.low_value_close_threshold {
            return (
                CloseTrigger::LowValueClose,
                Some(format!("mark {:.2} at/under {:.2}", metrics.current_mark, rules.low_value_close_threshold)),
                new_peak,
            );
        }
    }

    // ── 9. Structure invalid ─────────────────────────────────────────────
    if metrics.current_mark <= 0.0 {
        return (
            CloseTrigger::Emergency,
            Some(format!("STRUCTURE_INVALID: mark {:.2}", metrics.current_mark)),
            new_peak,
        );
    }

    (CloseTrigger::None, None, new_peak)
}

/// Whether a broker/store error message indicates data corruption rather
/// than a transient fault. Corruption forces an emergency exit; everything
/// else waits for the next cycle.
pub fn error_is_structural(message: &str) -> bool {
    let lowered = message.to_lowercase();
    ["missing", "invalid", "mismatch"]
        .iter()
        .any(|needle| lowered.contains(needle))
}

// ---------------------------------------------------------------------------
// Async evaluation
// ---------------------------------------------------------------------------

/// Evaluate one open trade against live quotes. Broker hiccups yield NONE
/// (retry next cycle); corrupted data yields EMERGENCY.
pub async fn evaluate_open_trade(
    state: &AppState,
    trade: &Trade,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> TradeEvaluation {
    match evaluate_inner(state, trade, config, now).await {
        Ok(eval) => eval,
        Err(e) => {
            let message = format!("{e:#}");
            if error_is_structural(&message) {
                warn!(trade_id = %trade.id, error = %message, "structural error during evaluation");
                TradeEvaluation {
                    trigger: CloseTrigger::Emergency,
                    reason: Some(format!("STRUCTURAL_BREAK: {message}")),
                    metrics: None,
                }
            } else {
                warn!(trade_id = %trade.id, error = %message, "transient error during evaluation, retrying next cycle");
                TradeEvaluation {
                    trigger: CloseTrigger::None,
                    reason: None,
                    metrics: None,
                }
            }
        }
    }
}

async fn evaluate_inner(
    state: &AppState,
    trade: &Trade,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Result<TradeEvaluation> {
    let structural = structural_check(state, trade, config, now).await?;
    let (short_leg, long_leg) = match structural {
        Structural::Intact { short_leg, long_leg } => (short_leg, long_leg),
        Structural::Broken(reason) => {
            return Ok(TradeEvaluation {
                trigger: CloseTrigger::Emergency,
                reason: Some(format!("STRUCTURAL_BREAK: {reason}")),
                metrics: None,
            });
        }
    };

    // Underlying spike window.
    let underlying_change = match state.broker.get_underlying_quote(&trade.symbol).await {
        Ok(quote) if quote.is_valid() => {
            let window =
                price_window::record(&state.store, &trade.symbol, now.timestamp(), quote.last)
                    .await?;
            window.change_over(SPIKE_WINDOW_SECS)
        }
        Ok(_) | Err(_) => None,
    };

    // Work on one mutable copy so the IV backfill and the peak update never
    // clobber each other's write.
    let mut trade_row = trade.clone();

    // Backfill the entry IV while the trade is still settling, so the crush
    // baseline reflects entry conditions.
    if trade_row.iv_entry.is_none() && trade_age_secs(&trade_row, now) <= SETTLING_WINDOW_SECS {
        if let Some(iv) = short_leg.implied_volatility {
            trade_row.iv_entry = Some(iv);
            state.store.update_trade(&trade_row).await?;
        }
    }

    let dte = clock::dte(clock::eastern_date(now), trade_row.expiration_date()?);
    let metrics = compute_metrics(
        &trade_row,
        &short_leg,
        &long_leg,
        dte,
        underlying_change,
        &config.close_rules,
    );

    debug!(
        trade_id = %trade_row.id,
        short_mid = metrics.short_mid,
        long_mid = metrics.long_mid,
        mark = metrics.current_mark,
        unrealized = ?metrics.unrealized_pnl,
        dte = metrics.dte,
        "trade metrics computed"
    );

    let now_et = clock::to_eastern(now).time();
    let (trigger, reason, new_peak) = decide(&trade_row, &metrics, &config.close_rules, now_et);

    if let Some(peak) = new_peak {
        trade_row.max_seen_profit_fraction = peak;
        state.store.update_trade(&trade_row).await?;
        debug!(trade_id = %trade_row.id, peak, "trailing peak advanced");
    }

    Ok(TradeEvaluation {
        trigger,
        reason,
        metrics: Some(metrics),
    })
}

/// Pre-P&L structural integrity: geometry, chain legs, broker positions
/// (after the settling window), and the entry order's fill status.
async fn structural_check(
    state: &AppState,
    trade: &Trade,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Result<Structural> {
    if let Err(reason) = check_geometry(trade) {
        return Ok(Structural::Broken(reason));
    }

    let expiration = trade.expiration_date()?;
    let chain = state.broker.get_option_chain(&trade.symbol, expiration).await?;

    let option_type = trade.strategy.option_type();
    let find_leg = |strike: f64| {
        chain
            .iter()
            .find(|o| o.option_type == option_type && (o.strike - strike).abs() < 0.01)
            .cloned()
    };

    let Some(short_leg) = find_leg(trade.short_strike) else {
        return Ok(Structural::Broken(format!(
            "LEG_MISSING: {} {} {:.2} not in chain",
            trade.symbol, option_type, trade.short_strike
        )));
    };
    let Some(long_leg) = find_leg(trade.long_strike) else {
        return Ok(Structural::Broken(format!(
            "LEG_MISSING: {} {} {:.2} not in chain",
            trade.symbol, option_type, trade.long_strike
        )));
    };

    let age = trade_age_secs(trade, now);
    if age > SETTLING_WINDOW_SECS {
        // DRY_RUN has no broker-side positions to verify against.
        if config.mode != TradingMode::DryRun {
            for (strike, side) in [
                (trade.short_strike, PositionSide::Short),
                (trade.long_strike, PositionSide::Long),
            ] {
                let position = state
                    .store
                    .position_for_leg(&trade.symbol, &trade.expiration, option_type, strike, side)
                    .await?;
                match position {
                    None => {
                        return Ok(Structural::Broken(format!(
                            "POSITION_MISSING: {side} leg {:.2} absent from broker positions",
                            strike
                        )));
                    }
                    Some(p) if p.quantity.abs() < trade.quantity => {
                        return Ok(Structural::Broken(format!(
                            "QUANTITY_MISMATCH: {side} leg {:.2} holds {} of {}",
                            strike, p.quantity, trade.quantity
                        )));
                    }
                    Some(_) => {}
                }
            }
        }

        if let Some(entry_order) = state
            .store
            .entry_order_for_proposal(&trade.proposal_id)
            .await?
        {
            if entry_order.status != OrderStatus::Filled {
                return Ok(Structural::Broken(format!(
                    "ENTRY_ORDER_NOT_FILLED: order {} is {}",
                    entry_order.id, entry_order.status
                )));
            }
        }
    }

    Ok(Structural::Intact { short_leg, long_leg })
}

fn trade_age_secs(trade: &Trade, now: DateTime<Utc>) -> i64 {
    trade
        .opened_at
        .as_deref()
        .or(Some(trade.created_at.as_str()))
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|opened| (now - opened.with_timezone(&Utc)).num_seconds())
        .unwrap_or(i64::MAX)
}

// ---------------------------------------------------------------------------
// Portfolio repair
// ---------------------------------------------------------------------------

/// Run the structural check across every open trade and submit emergency
/// exits for the broken ones. Runs at the top of each monitor cycle and
/// from the admin endpoint.
pub async fn repair_portfolio(
    state: &AppState,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Result<RepairReport> {
    let mut report = RepairReport::default();
    let open = state.store.open_trades().await?;

    for trade in open {
        if trade.entry_price.is_none() {
            report.skipped += 1;
            continue;
        }
        report.checked += 1;

        let broken_reason = match structural_check(state, &trade, config, now).await {
            Ok(Structural::Broken(reason)) => Some(reason),
            Ok(Structural::Intact { .. }) => None,
            Err(e) => {
                let message = format!("{e:#}");
                if error_is_structural(&message) {
                    Some(message)
                } else {
                    warn!(trade_id = %trade.id, error = %message, "repair check errored, skipping");
                    continue;
                }
            }
        };

        if let Some(reason) = broken_reason {
            report.broken += 1;
            error!(trade_id = %trade.id, reason = %reason, "structural break, submitting emergency exit");

            let full_reason = format!("STRUCTURAL_BREAK: {reason}");
            if let Err(e) =
                executor::submit_exit(state, &trade, CloseTrigger::Emergency, &full_reason, config)
                    .await
            {
                error!(trade_id = %trade.id, error = %e, "emergency exit submission failed");
            }

            state
                .notifier
                .send(
                    "emergency_exit",
                    serde_json::json!({ "tradeId": trade.id, "reason": full_reason }),
                )
                .await;
        }
    }

    info!(
        checked = report.checked,
        skipped = report.skipped,
        broken = report.broken,
        "portfolio repair complete"
    );
    Ok(report)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::now_rfc3339;
    use crate::types::{OptionType, Strategy, TradeStatus};

    fn trade(strategy: Strategy, entry: Option<f64>) -> Trade {
        let (short, long) = match strategy {
            Strategy::BullPutCredit | Strategy::BullCallDebit => (580.0, 575.0),
            Strategy::BearCallCredit | Strategy::BearPutDebit => (580.0, 585.0),
        };
        let (max_profit, max_loss) = match (strategy.is_credit(), entry) {
            (true, Some(e)) => (Some(e), Some(5.0 - e)),
            (false, Some(e)) => (Some(5.0 - e), Some(e)),
            _ => (None, None),
        };
        Trade {
            id: "t1".to_string(),
            proposal_id: "p1".to_string(),
            symbol: "SPY".to_string(),
            expiration: "2025-01-17".to_string(),
            strategy,
            short_strike: short,
            long_strike: long,
            width: 5.0,
            quantity: 1,
            entry_price: entry,
            exit_price: None,
            max_profit,
            max_loss,
            realized_pnl: None,
            max_seen_profit_fraction: 0.0,
            iv_entry: None,
            status: TradeStatus::Open,
            exit_reason: None,
            broker_order_id_open: None,
            broker_order_id_close: None,
            opened_at: Some(now_rfc3339()),
            closed_at: None,
            created_at: now_rfc3339(),
            updated_at: now_rfc3339(),
        }
    }

    fn leg(strike: f64, bid: f64, ask: f64, iv: Option<f64>) -> OptionQuote {
        OptionQuote {
            symbol: format!("SPY   250117P{:08}", (strike * 1000.0) as u64),
            strike,
            option_type: OptionType::Put,
            bid,
            ask,
            last: None,
            delta: Some(-0.28),
            implied_volatility: iv,
            expiration_date: "2025-01-17".to_string(),
        }
    }

    fn metrics_for(trade: &Trade, short: &OptionQuote, long: &OptionQuote) -> TradeMetrics {
        compute_metrics(trade, short, long, 14, None, &CloseRuleConfig::default())
    }

    fn afternoon() -> NaiveTime {
        NaiveTime::from_hms_opt(13, 0, 0).unwrap()
    }

    #[test]
    fn profit_target_credit_scenario() {
        // Entry 1.00, mark 0.45 -> profit fraction 0.55 >= 0.50.
        let t = trade(Strategy::BullPutCredit, Some(1.0));
        let short = leg(580.0, 0.40, 0.50, Some(0.20));
        let long = leg(575.0, 0.18, 0.22, Some(0.20));
        let m = metrics_for(&t, &short, &long);

        assert!((m.current_mark - 0.25).abs() < 1e-9 || m.current_mark > 0.0);
        let m = TradeMetrics {
            current_mark: 0.45,
            unrealized_pnl: Some(0.55),
            profit_fraction: Some(0.55),
            loss_fraction: Some(0.0),
            ..m
        };

        let (trigger, _, peak) = decide(&t, &m, &CloseRuleConfig::default(), afternoon());
        assert_eq!(trigger, CloseTrigger::ProfitTarget);
        assert_eq!(peak, Some(0.55));
    }

    #[test]
    fn stop_loss_credit_scenario() {
        // Entry 1.00, mark 1.60 -> loss fraction 0.15 >= 0.10.
        let t = trade(Strategy::BullPutCredit, Some(1.0));
        let short = leg(580.0, 1.80, 1.90, Some(0.25));
        let long = leg(575.0, 0.23, 0.27, Some(0.24));
        let m = metrics_for(&t, &short, &long);

        assert!((m.current_mark - 1.60).abs() < 1e-9);
        assert!((m.unrealized_pnl.unwrap() + 0.60).abs() < 1e-9);
        assert!((m.loss_fraction.unwrap() - 0.15).abs() < 1e-9);

        let (trigger, _, _) = decide(&t, &m, &CloseRuleConfig::default(), afternoon());
        assert_eq!(trigger, CloseTrigger::StopLoss);
    }

    #[test]
    fn trail_profit_giveback_scenario() {
        // Peak 0.62, current 0.48; arm 0.40, giveback 0.10.
        let mut t = trade(Strategy::BullPutCredit, Some(1.0));
        t.max_seen_profit_fraction = 0.62;

        let short = leg(580.0, 0.60, 0.64, Some(0.20));
        let long = leg(575.0, 0.09, 0.11, Some(0.20));
        let m = metrics_for(&t, &short, &long);
        // mark = 0.62 - 0.10 = 0.52 -> pnl 0.48 -> pf 0.48.
        assert!((m.profit_fraction.unwrap() - 0.48).abs() < 1e-9);

        let (trigger, reason, peak) = decide(&t, &m, &CloseRuleConfig::default(), afternoon());
        assert_eq!(trigger, CloseTrigger::TrailProfit);
        assert!(reason.unwrap().contains("0.62"));
        // Peak did not advance.
        assert_eq!(peak, None);
    }

    #[test]
    fn trail_not_armed_below_arm_fraction() {
        let mut t = trade(Strategy::BullPutCredit, Some(1.0));
        t.max_seen_profit_fraction = 0.30;

        let short = leg(580.0, 0.78, 0.82, Some(0.20));
        let long = leg(575.0, 0.04, 0.06, Some(0.20));
        let m = metrics_for(&t, &short, &long);
        // pf = 1.0 - 0.75 = 0.25; peak 0.30 below arm 0.40.
        let (trigger, _, _) = decide(&t, &m, &CloseRuleConfig::default(), afternoon());
        assert_eq!(trigger, CloseTrigger::None);
    }

    #[test]
    fn structural_break_geometry_scenario() {
        // Long 571 instead of 575 for a 5-wide bull put off 580.
        let mut t = trade(Strategy::BullPutCredit, Some(1.0));
        t.long_strike = 571.0;
        t.width = 5.0;

        let err = check_geometry(&t).unwrap_err();
        assert!(err.contains("MISMATCH"));
    }

    #[test]
    fn geometry_accepts_rounding_noise() {
        let mut t = trade(Strategy::BullPutCredit, Some(1.0));
        t.long_strike = 575.005;
        assert!(check_geometry(&t).is_ok());
    }

    #[test]
    fn emergency_on_bad_liquidity_wins_over_profit() {
        let t = trade(Strategy::BullPutCredit, Some(1.0));
        // Spread 0.80 on the short leg with default threshold 0.60, while
        // the position also shows a profit.
        let short = leg(580.0, 0.10, 0.90, Some(0.20));
        let long = leg(575.0, 0.04, 0.06, Some(0.20));
        let m = metrics_for(&t, &short, &long);

        let (trigger, reason, _) = decide(&t, &m, &CloseRuleConfig::default(), afternoon());
        assert_eq!(trigger, CloseTrigger::Emergency);
        assert!(reason.unwrap().starts_with("LIQUIDITY"));
    }

    #[test]
    fn emergency_on_underlying_spike() {
        let t = trade(Strategy::BullPutCredit, Some(1.0));
        let short = leg(580.0, 0.78, 0.82, Some(0.20));
        let long = leg(575.0, 0.04, 0.06, Some(0.20));
        let mut m = metrics_for(&t, &short, &long);
        m.underlying_change_15s = Some(-0.008); // default threshold 0.005

        let (trigger, reason, _) = decide(&t, &m, &CloseRuleConfig::default(), afternoon());
        assert_eq!(trigger, CloseTrigger::Emergency);
        assert!(reason.unwrap().starts_with("UNDERLYING_SPIKE"));
    }

    #[test]
    fn iv_crush_requires_stored_entry_iv() {
        let mut t = trade(Strategy::BullPutCredit, Some(1.0));
        let short = leg(580.0, 0.78, 0.82, Some(0.10));
        let long = leg(575.0, 0.04, 0.06, Some(0.10));
        let m = metrics_for(&t, &short, &long);

        // Without entry IV: no crush exit (pf 0.25, below profit target).
        let (trigger, _, _) = decide(&t, &m, &CloseRuleConfig::default(), afternoon());
        assert_eq!(trigger, CloseTrigger::None);

        // With entry IV 0.20 and current 0.10 <= 0.20 * 0.70, pf 0.25 >= 0.10.
        t.iv_entry = Some(0.20);
        let (trigger, _, _) = decide(&t, &m, &CloseRuleConfig::default(), afternoon());
        assert_eq!(trigger, CloseTrigger::IvCrushExit);
    }

    #[test]
    fn time_exit_needs_both_dte_and_cutoff() {
        let t = trade(Strategy::BullPutCredit, None);
        let short = leg(580.0, 0.78, 0.82, Some(0.20));
        let long = leg(575.0, 0.04, 0.06, Some(0.20));
        let mut m = metrics_for(&t, &short, &long);
        m.dte = 1;

        let rules = CloseRuleConfig::default();
        // Before the 15:50 cutoff: nothing.
        let (trigger, _, _) = decide(&t, &m, &rules, NaiveTime::from_hms_opt(15, 0, 0).unwrap());
        assert_eq!(trigger, CloseTrigger::None);

        // Past the cutoff: TIME_EXIT even without an entry price.
        let (trigger, _, _) = decide(&t, &m, &rules, NaiveTime::from_hms_opt(15, 55, 0).unwrap());
        assert_eq!(trigger, CloseTrigger::TimeExit);
    }

    #[test]
    fn entryless_trade_skips_pnl_rules() {
        let t = trade(Strategy::BullPutCredit, None);
        // Mark decayed to 0.03 — would be LOW_VALUE_CLOSE with an entry.
        let short = leg(580.0, 0.02, 0.05, Some(0.20));
        let long = leg(575.0, 0.005, 0.01, Some(0.20));
        let m = metrics_for(&t, &short, &long);

        let (trigger, _, _) = decide(&t, &m, &CloseRuleConfig::default(), afternoon());
        assert_eq!(trigger, CloseTrigger::None);
    }

    #[test]
    fn low_value_close_credit_only() {
        let t = trade(Strategy::BullPutCredit, Some(1.0));
        let short = leg(580.0, 0.03, 0.05, Some(0.20));
        let long = leg(575.0, 0.005, 0.015, Some(0.20));
        let m = metrics_for(&t, &short, &long);
        // mark = 0.04 - 0.01 = 0.03 <= 0.05, pf = 0.97 -> profit target fires
        // first? target 0.50: yes, PROFIT_TARGET outranks LOW_VALUE here.
        let (trigger, _, _) = decide(&t, &m, &CloseRuleConfig::default(), afternoon());
        assert_eq!(trigger, CloseTrigger::ProfitTarget);

        // Debit spread at a tiny mark must not low-value close.
        let mut debit = trade(Strategy::BullCallDebit, Some(2.0));
        debit.max_seen_profit_fraction = 0.0;
        let short_c = leg(580.0, 2.00, 2.04, Some(0.20));
        let long_c = leg(575.0, 2.02, 2.06, Some(0.20));
        let m = metrics_for(&debit, &short_c, &long_c);
        assert!(m.current_mark.abs() < 0.05);
        let (trigger, _, _) = decide(&debit, &m, &CloseRuleConfig::default(), afternoon());
        // Debit mark near zero means deep loss -> stop loss, not low-value.
        assert_eq!(trigger, CloseTrigger::StopLoss);
    }

    #[test]
    fn nonpositive_mark_is_emergency() {
        let t = trade(Strategy::BullPutCredit, Some(1.0));
        // Long mid above short mid -> negative credit mark.
        let short = leg(580.0, 0.10, 0.14, Some(0.20));
        let long = leg(575.0, 0.30, 0.34, Some(0.20));
        let mut m = metrics_for(&t, &short, &long);
        // Profit fraction exceeds 1 here; keep it under the target to reach
        // rule 9.
        m.profit_fraction = Some(0.10);
        m.loss_fraction = Some(0.0);
        m.unrealized_pnl = Some(0.10);

        let (trigger, reason, _) = decide(&t, &m, &CloseRuleConfig::default(), afternoon());
        assert_eq!(trigger, CloseTrigger::Emergency);
        assert!(reason.unwrap().contains("STRUCTURE_INVALID"));
    }

    #[test]
    fn error_classification() {
        assert!(error_is_structural("STRIKE_MISMATCH: expected long 575"));
        assert!(error_is_structural("LEG_MISSING: SPY put 580"));
        assert!(error_is_structural("invalid option symbol"));
        assert!(!error_is_structural("connection timed out"));
        assert!(!error_is_structural("broker returned 502: bad gateway"));
    }

    #[test]
    fn rule_order_trail_before_profit_target() {
        // Metrics satisfying both trail (peak 0.70, pf 0.55) and profit
        // target (0.55 >= 0.50): trail wins by rule order.
        let mut t = trade(Strategy::BullPutCredit, Some(1.0));
        t.max_seen_profit_fraction = 0.70;

        let short = leg(580.0, 0.43, 0.47, Some(0.20));
        let long = leg(575.0, 0.0, 0.0, None);
        let mut m = metrics_for(&t, &short, &long);
        m.quotes_ok = true;
        m.current_mark = 0.45;
        m.unrealized_pnl = Some(0.55);
        m.profit_fraction = Some(0.55);
        m.loss_fraction = Some(0.0);

        let (trigger, _, _) = decide(&t, &m, &CloseRuleConfig::default(), afternoon());
        assert_eq!(trigger, CloseTrigger::TrailProfit);
    }
}
