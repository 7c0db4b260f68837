// =============================================================================
// Proposal pipeline — symbols × strategies × expirations -> one proposal
// =============================================================================
//
// Stage order:
//   1. Resolve mode and thresholds.
//   2. Resolve eligible symbols (mode defaults ∩ whitelist).
//   3. Resolve enabled strategies (∩ whitelist, regime-gated on the primary
//      symbol).
//   4. Market-wide RV/IV integrity check.
//   5. Per symbol: quote validation, Friday-stepped expirations, chains.
//   6. Parametric candidate builder per (symbol, expiration, strategy).
//   7. Directional gating (spot vs SMA20 trend score).
//   8. Hard filters (categorical reasons).
//   9-10. Metrics + composite scoring (scoring-layer rejections).
//  11. Score threshold.
//  12. Portfolio net-credit guard.
//  13. Selection, persistence, best-effort notification.
//
// At most one proposal row is written per run. Per-symbol failures are
// logged and do not abort the other symbols; every run ends with a
// `proposals_summary` system log.
// =============================================================================

pub mod builder;
pub mod filters;
pub mod scoring;

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::broker::{BrokerResult, OptionQuote};
use crate::clock;
use crate::config::{keys, EngineConfig};
use crate::regime::{self, sma};
use crate::store::models::Proposal;
use crate::store::now_rfc3339;
use crate::types::{ProposalKind, ProposalStatus, Regime, Strategy, TradingMode};

use builder::{build_candidates, RawCandidate};
use filters::hard_filter;
use scoring::{histogram_bucket, score_candidate, ScoreBreakdown};

/// Trailing daily closes used for the SMA and realized-vol inputs.
const HISTORY_DAYS: i64 = 60;
/// Accepted band for realized-over-implied volatility (30 d).
const RV_IV_BAND: (f64, f64) = (0.5, 1.5);
/// Directional-gate slack: how far against the strategy the trend score may
/// sit before the candidate is rejected.
const DIRECTIONAL_MARGIN_STRICT: f64 = 0.002;
const DIRECTIONAL_MARGIN_SANDBOX: f64 = 0.010;

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// A candidate that survived filtering and scoring.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub raw: RawCandidate,
    pub breakdown: ScoreBreakdown,
}

/// What one pipeline run produced.
#[derive(Debug, Default)]
pub struct ProposalRunOutcome {
    pub proposal: Option<Proposal>,
    pub candidate: Option<ScoredCandidate>,
}

/// The per-run observability record, persisted as a `proposals_summary`
/// system log.
#[derive(Debug, Default, Serialize)]
pub struct RunSummary {
    pub candidate_count: u32,
    pub scored_count: u32,
    pub passing_count: u32,
    pub best_score: Option<f64>,
    pub filter_rejections: HashMap<String, u32>,
    pub scoring_rejections: HashMap<String, u32>,
    /// Buckets: [0,0.5) [0.5,0.65) [0.65,0.70) [0.70,0.85) [0.85,1].
    pub score_histogram: [u32; 5],
    pub chosen_expiration: Option<String>,
    pub chosen_score: Option<f64>,
    pub reason: String,
}

impl RunSummary {
    fn bump_filter(&mut self, key: &str) {
        *self.filter_rejections.entry(key.to_string()).or_insert(0) += 1;
    }

    fn bump_scoring(&mut self, key: String) {
        *self.scoring_rejections.entry(key).or_insert(0) += 1;
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the full pipeline once. Emits at most one persisted proposal; any
/// internal error is converted into a summary with no proposal.
pub async fn generate_proposal(state: &AppState, now: DateTime<Utc>) -> ProposalRunOutcome {
    let mut summary = RunSummary::default();

    let outcome = match run_pipeline(state, now, &mut summary).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(error = %e, "proposal run failed");
            if summary.reason.is_empty() {
                summary.reason = format!("RUN_ERROR: {e}");
            }
            ProposalRunOutcome::default()
        }
    };

    if let Err(e) = write_summary(state, &summary).await {
        warn!(error = %e, "failed to persist proposals summary");
    }
    if let Err(e) = state
        .store
        .set_setting(keys::LAST_PROPOSAL_RUN, &now.to_rfc3339())
        .await
    {
        warn!(error = %e, "failed to stamp LAST_PROPOSAL_RUN");
    }

    outcome
}

async fn run_pipeline(
    state: &AppState,
    now: DateTime<Utc>,
    summary: &mut RunSummary,
) -> anyhow::Result<ProposalRunOutcome> {
    // ── 1. Mode and thresholds ───────────────────────────────────────────
    let config = match EngineConfig::resolve(&state.store).await {
        Ok(c) => c,
        Err(e) => {
            summary.reason = format!("CONFIG_ERROR: {e}");
            return Ok(ProposalRunOutcome::default());
        }
    };
    let mode = config.mode;
    let today = clock::eastern_date(now);

    // ── 2. Eligible symbols ──────────────────────────────────────────────
    let symbols = config.eligible_symbols();
    if symbols.is_empty() {
        summary.reason = "NO_ELIGIBLE_SYMBOLS".to_string();
        return Ok(ProposalRunOutcome::default());
    }

    // ── 3. Enabled strategies, regime-gated on the primary symbol ────────
    let mut caches = RunCaches::default();
    let primary = &symbols[0];
    let regime = observe_regime(state, primary, today, &mut caches).await;

    let strategies: Vec<Strategy> = config
        .enabled_strategies()
        .into_iter()
        .filter(|s| s.tolerates(regime))
        .collect();
    if strategies.is_empty() {
        summary.reason = format!("NO_STRATEGY_FOR_REGIME:{regime}");
        return Ok(ProposalRunOutcome::default());
    }

    // ── 4. Market-wide RV/IV integrity ───────────────────────────────────
    if let Some(ratio) = rv_iv_ratio(state, primary, today, &config, &mut caches).await {
        let out_of_band = ratio < RV_IV_BAND.0 || ratio > RV_IV_BAND.1;
        if out_of_band {
            if mode == TradingMode::SandboxPaper {
                warn!(ratio, "RV/IV ratio out of band (sandbox: continuing)");
            } else {
                summary.reason = format!("RV_IV_OUT_OF_BAND: {ratio:.2}");
                return Ok(ProposalRunOutcome::default());
            }
        }
    }

    // ── 5-11. Per-symbol candidate work ──────────────────────────────────
    let mut passing: Vec<ScoredCandidate> = Vec::new();

    for symbol in &symbols {
        if let Err(e) = scan_symbol(
            state, symbol, today, &config, &strategies, &mut caches, summary, &mut passing,
        )
        .await
        {
            // One symbol failing must not sink the others.
            error!(symbol = %symbol, error = %e, "symbol scan failed");
        }
    }

    summary.passing_count = passing.len() as u32;
    summary.best_score = passing
        .iter()
        .map(|c| c.breakdown.composite)
        .fold(None, |acc: Option<f64>, s| {
            Some(acc.map_or(s, |a| a.max(s)))
        });

    // ── 12. Portfolio net-credit guard ───────────────────────────────────
    let existing_premium: f64 = state
        .store
        .active_trades()
        .await?
        .iter()
        .filter_map(|t| t.premium_contribution())
        .sum();

    let before = passing.len();
    passing.retain(|c| {
        let contribution = c.raw.credit_target() * config.default_quantity as f64 * 100.0;
        net_credit_guard_ok(existing_premium, contribution)
    });
    for _ in passing.len()..before {
        summary.bump_filter("PORTFOLIO_NET_CREDIT_GUARD");
    }

    // ── 13. Selection & persistence ──────────────────────────────────────
    let Some(best) = select_best(passing) else {
        summary.reason = "NO_PASSING_CANDIDATES".to_string();
        return Ok(ProposalRunOutcome::default());
    };

    let proposal = persist_proposal(state, &best, &config).await?;
    summary.chosen_expiration = Some(proposal.expiration.clone());
    summary.chosen_score = Some(proposal.score);
    summary.reason = "PROPOSAL_CREATED".to_string();

    info!(
        proposal_id = %proposal.id,
        symbol = %proposal.symbol,
        strategy = %proposal.strategy,
        expiration = %proposal.expiration,
        short_strike = proposal.short_strike,
        long_strike = proposal.long_strike,
        credit_target = proposal.credit_target,
        score = proposal.score,
        "proposal created"
    );

    state
        .notifier
        .send("proposal_created", serde_json::to_value(&proposal)?)
        .await;

    Ok(ProposalRunOutcome {
        proposal: Some(proposal),
        candidate: Some(best),
    })
}

// ---------------------------------------------------------------------------
// Per-symbol scan (stages 5-11)
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn scan_symbol(
    state: &AppState,
    symbol: &str,
    today: NaiveDate,
    config: &EngineConfig,
    strategies: &[Strategy],
    caches: &mut RunCaches,
    summary: &mut RunSummary,
    passing: &mut Vec<ScoredCandidate>,
) -> anyhow::Result<()> {
    let quote = state.broker.get_underlying_quote(symbol).await?;
    if !quote.is_valid() {
        warn!(symbol, bid = quote.bid, ask = quote.ask, last = quote.last, "invalid underlying quote, skipping symbol");
        return Ok(());
    }

    let trend = trend_for_symbol(state, symbol, quote.last, today, caches).await;

    let expirations = clock::expiration_fridays(
        today,
        config.thresholds.min_dte,
        config.thresholds.max_dte,
        config.thresholds.max_expirations,
    );

    for expiration in expirations {
        let chain = caches.chain(state, symbol, expiration).await?;
        if chain.is_empty() {
            debug!(symbol, expiration = %expiration, "empty chain, skipping expiration");
            continue;
        }

        let expiration_str = expiration.format("%Y-%m-%d").to_string();
        let dte = clock::dte(today, expiration);

        for strategy in strategies {
            let candidates = build_candidates(&chain, &quote, *strategy, &expiration_str, dte);
            if candidates.is_empty() {
                summary.bump_filter("MISSING_OPTION_LEGS");
                continue;
            }

            for candidate in candidates {
                summary.candidate_count += 1;

                // ── 7. Directional gate ─────────────────────────────
                if !directional_gate_ok(*strategy, trend, config.mode) {
                    summary.bump_filter("DIRECTIONAL_GATE");
                    continue;
                }

                // ── 8. Hard filters ─────────────────────────────────
                if let Err(reason) = hard_filter(&candidate, config.mode, &config.thresholds) {
                    summary.bump_filter(reason.as_str());
                    continue;
                }

                // ── 9-10. Metrics + scoring ─────────────────────────
                let iv_rank = state.iv_rank.iv_rank(symbol);
                let breakdown = match score_candidate(&candidate, iv_rank) {
                    Ok(b) => b,
                    Err(rejection) => {
                        summary.bump_scoring(rejection.bucket());
                        continue;
                    }
                };
                summary.scored_count += 1;
                summary.score_histogram[histogram_bucket(breakdown.composite)] += 1;

                // ── 11. Threshold ───────────────────────────────────
                if breakdown.composite < config.thresholds.min_score {
                    continue;
                }

                passing.push(ScoredCandidate {
                    raw: candidate,
                    breakdown,
                });
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// Directional gate: bullish strategies need the trend score at or above
/// -margin, bearish at or below +margin. The sandbox margin is looser.
pub fn directional_gate_ok(strategy: Strategy, trend_score: Option<f64>, mode: TradingMode) -> bool {
    // No trend data: let the candidate through; scoring still applies.
    let Some(score) = trend_score else {
        return true;
    };

    let margin = match mode {
        TradingMode::SandboxPaper => DIRECTIONAL_MARGIN_SANDBOX,
        _ => DIRECTIONAL_MARGIN_STRICT,
    };

    if strategy.is_bullish() {
        score >= -margin
    } else {
        score <= margin
    }
}

/// Net-credit guard: the portfolio's signed premium must stay non-negative
/// after admitting the candidate. Credit candidates add premium and always
/// pass; debit candidates pass while covered by existing net credit.
pub fn net_credit_guard_ok(existing_premium: f64, contribution: f64) -> bool {
    existing_premium + contribution >= 0.0
}

/// Annualized realized volatility from the last `window` daily log returns.
pub fn realized_vol(closes: &[f64], window: usize) -> Option<f64> {
    if closes.len() < window + 1 {
        return None;
    }
    let tail = &closes[closes.len() - (window + 1)..];
    let returns: Vec<f64> = tail
        .windows(2)
        .filter(|w| w[0] > 0.0 && w[1] > 0.0)
        .map(|w| (w[1] / w[0]).ln())
        .collect();
    if returns.len() < 2 {
        return None;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
    Some(var.sqrt() * 252.0_f64.sqrt())
}

/// Sort by (composite desc, EV desc, credit desc) and take the head.
pub fn select_best(mut passing: Vec<ScoredCandidate>) -> Option<ScoredCandidate> {
    passing.sort_by(|a, b| {
        b.breakdown
            .composite
            .partial_cmp(&a.breakdown.composite)
            .unwrap_or(Ordering::Equal)
            .then(
                b.breakdown
                    .metrics
                    .ev
                    .partial_cmp(&a.breakdown.metrics.ev)
                    .unwrap_or(Ordering::Equal),
            )
            .then(
                b.raw
                    .credit_target()
                    .partial_cmp(&a.raw.credit_target())
                    .unwrap_or(Ordering::Equal),
            )
    });
    passing.into_iter().next()
}

// ---------------------------------------------------------------------------
// Run-scoped caches & data helpers
// ---------------------------------------------------------------------------

/// Chains and daily-close histories fetched once per run. Nothing here
/// outlives the tick.
#[derive(Default)]
struct RunCaches {
    chains: HashMap<(String, NaiveDate), Vec<OptionQuote>>,
    closes: HashMap<String, Vec<f64>>,
}

impl RunCaches {
    async fn chain(
        &mut self,
        state: &AppState,
        symbol: &str,
        expiration: NaiveDate,
    ) -> BrokerResult<Vec<OptionQuote>> {
        let key = (symbol.to_string(), expiration);
        if let Some(cached) = self.chains.get(&key) {
            return Ok(cached.clone());
        }
        let chain = state.broker.get_option_chain(symbol, expiration).await?;
        self.chains.insert(key, chain.clone());
        Ok(chain)
    }

    async fn closes(&mut self, state: &AppState, symbol: &str, today: NaiveDate) -> Vec<f64> {
        if let Some(cached) = self.closes.get(symbol) {
            return cached.clone();
        }
        let start = today - chrono::Duration::days(HISTORY_DAYS + 30);
        let closes = match state.broker.get_daily_history(symbol, start, today).await {
            Ok(bars) => bars.into_iter().map(|b| b.close).collect(),
            Err(e) => {
                warn!(symbol, error = %e, "history fetch failed");
                Vec::new()
            }
        };
        self.closes.insert(symbol.to_string(), closes.clone());
        closes
    }
}

async fn observe_regime(
    state: &AppState,
    symbol: &str,
    today: NaiveDate,
    caches: &mut RunCaches,
) -> Regime {
    let closes = caches.closes(state, symbol, today).await;
    let spot = closes.last().copied().unwrap_or(0.0);
    match sma(&closes, 20) {
        Some(sma20) if spot > 0.0 => state.regime.observe(symbol, spot, sma20),
        _ => {
            debug!(symbol, "insufficient history for regime, defaulting NEUTRAL");
            Regime::Neutral
        }
    }
}

async fn trend_for_symbol(
    state: &AppState,
    symbol: &str,
    spot: f64,
    today: NaiveDate,
    caches: &mut RunCaches,
) -> Option<f64> {
    let closes = caches.closes(state, symbol, today).await;
    sma(&closes, 20).map(|sma20| regime::trend_score(spot, sma20))
}

/// Realized-over-implied (30 d) for the primary symbol. None when either
/// side cannot be computed; the integrity check is then skipped.
async fn rv_iv_ratio(
    state: &AppState,
    symbol: &str,
    today: NaiveDate,
    config: &EngineConfig,
    caches: &mut RunCaches,
) -> Option<f64> {
    let closes = caches.closes(state, symbol, today).await;
    let rv = realized_vol(&closes, 30)?;
    let spot = *closes.last()?;

    // The expiration nearest 30 DTE inside the configured band.
    let expirations = clock::expiration_fridays(
        today,
        config.thresholds.min_dte,
        config.thresholds.max_dte,
        config.thresholds.max_expirations,
    );
    let target = expirations
        .into_iter()
        .min_by_key(|e| (clock::dte(today, *e) - 30).unsigned_abs())?;

    let chain = caches.chain(state, symbol, target).await.ok()?;
    let atm_iv = atm_implied_vol(&chain, spot)?;
    if atm_iv <= 0.0 {
        return None;
    }
    Some(rv / atm_iv)
}

/// Average IV of the quotes at the strike nearest spot.
fn atm_implied_vol(chain: &[OptionQuote], spot: f64) -> Option<f64> {
    let nearest = chain
        .iter()
        .filter(|o| o.implied_volatility.is_some())
        .min_by(|a, b| {
            (a.strike - spot)
                .abs()
                .partial_cmp(&(b.strike - spot).abs())
                .unwrap_or(Ordering::Equal)
        })?;
    let strike = nearest.strike;

    let ivs: Vec<f64> = chain
        .iter()
        .filter(|o| (o.strike - strike).abs() < 0.001)
        .filter_map(|o| o.implied_volatility)
        .collect();
    if ivs.is_empty() {
        return None;
    }
    Some(ivs.iter().sum::<f64>() / ivs.len() as f64)
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

async fn persist_proposal(
    state: &AppState,
    best: &ScoredCandidate,
    config: &EngineConfig,
) -> anyhow::Result<Proposal> {
    let proposal = Proposal {
        id: Uuid::new_v4().to_string(),
        symbol: best.raw.symbol.clone(),
        expiration: best.raw.expiration.clone(),
        short_strike: best.raw.short_strike,
        long_strike: best.raw.long_strike,
        width: best.raw.width,
        quantity: config.default_quantity,
        strategy: best.raw.strategy,
        credit_target: best.raw.credit_target(),
        score: best.breakdown.composite,
        score_ivr: best.breakdown.ivr,
        score_vertical_skew: best.breakdown.vertical_skew,
        score_term_structure: best.breakdown.term_structure,
        score_delta_fitness: best.breakdown.delta_fitness,
        score_ev: best.breakdown.ev,
        status: ProposalStatus::Ready,
        kind: ProposalKind::Entry,
        linked_trade_id: None,
        created_at: now_rfc3339(),
    };

    state.store.insert_proposal(&proposal).await?;
    Ok(proposal)
}

async fn write_summary(state: &AppState, summary: &RunSummary) -> anyhow::Result<()> {
    let details = serde_json::to_value(summary)?;
    state
        .store
        .record_system_log("proposals_summary", &summary.reason, Some(&details))
        .await
}
