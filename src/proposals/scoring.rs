// =============================================================================
// Candidate metrics & composite scoring
// =============================================================================
//
// Scoring is the authoritative strategy-quality layer: the POP band and the
// delta-fitness band are enforced here (and only here), surfacing as
// HARD_FILTER:<reason> buckets in the run summary. The composite is a
// weighted sum of normalized sub-scores in [0, 1].
// =============================================================================

use serde::Serialize;

use super::builder::{GatedLeg, RawCandidate};

// Sub-score weights; must sum to 1.
const WEIGHT_IVR: f64 = 0.20;
const WEIGHT_VERTICAL_SKEW: f64 = 0.15;
const WEIGHT_TERM_STRUCTURE: f64 = 0.15;
const WEIGHT_DELTA_FITNESS: f64 = 0.25;
const WEIGHT_EV: f64 = 0.25;

/// Skew at or above this normalizes to a zero sub-score.
const SKEW_FULL_PENALTY: f64 = 0.08;

/// Acceptable probability-of-profit bands.
const POP_BAND_CREDIT: (f64, f64) = (0.60, 0.85);
const POP_BAND_DEBIT: (f64, f64) = (0.40, 0.65);

// ---------------------------------------------------------------------------
// IV rank
// ---------------------------------------------------------------------------

/// Source of implied-volatility rank.
///
/// Contract: return the symbol's IV rank in [0, 1] over a trailing window
/// (1.0 = richest vol in the window), or `None` when no ranking data is
/// available — the scorer substitutes a neutral 0.5.
pub trait IvRankProvider: Send + Sync {
    fn iv_rank(&self, symbol: &str) -> Option<f64>;
}

/// Default provider: no ranking data, every symbol scores neutral.
pub struct FlatIvRank;

impl IvRankProvider for FlatIvRank {
    fn iv_rank(&self, _symbol: &str) -> Option<f64> {
        None
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Raw per-candidate metrics, computed before normalization.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateMetrics {
    /// 1 - |short-leg delta|.
    pub pop: f64,
    /// Expected value per spread, in premium dollars.
    pub ev: f64,
    /// |iv_long - iv_short|.
    pub vertical_skew: f64,
    /// Placeholder until a term-structure input lands; neutral 0.5.
    pub term_structure: f64,
    pub short_spread_pct: f64,
    pub long_spread_pct: f64,
}

/// Compute metrics; `None` when the short leg has no delta.
pub fn compute_metrics(candidate: &RawCandidate) -> Option<CandidateMetrics> {
    let short_delta = candidate.short_leg.delta?;
    let pop = 1.0 - short_delta.abs();

    let width = candidate.width;
    let premium = candidate.premium;
    let ev = if candidate.strategy.is_credit() {
        pop * premium - (1.0 - pop) * (width - premium)
    } else {
        pop * (width - premium) - (1.0 - pop) * premium
    };

    let vertical_skew = match (
        candidate.long_leg.implied_volatility,
        candidate.short_leg.implied_volatility,
    ) {
        (Some(l), Some(s)) => (l - s).abs(),
        _ => 0.0,
    };

    Some(CandidateMetrics {
        pop,
        ev,
        vertical_skew,
        term_structure: 0.5,
        short_spread_pct: spread_pct(&candidate.short_leg),
        long_spread_pct: spread_pct(&candidate.long_leg),
    })
}

fn spread_pct(leg: &crate::broker::OptionQuote) -> f64 {
    let mid = leg.mid();
    if mid > 0.0 {
        leg.spread() / mid
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Categorical rejection raised by the scoring layer itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScoreRejection {
    PopOutOfBand,
    DeltaOutOfBand,
    DeltaMissing,
}

impl ScoreRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PopOutOfBand => "POP_OUT_OF_BAND",
            Self::DeltaOutOfBand => "DELTA_OUT_OF_BAND",
            Self::DeltaMissing => "DELTA_MISSING",
        }
    }

    /// Bucket key in the run summary.
    pub fn bucket(&self) -> String {
        format!("HARD_FILTER:{}", self.as_str())
    }
}

/// Normalized sub-scores plus the weighted composite.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreBreakdown {
    pub composite: f64,
    pub ivr: f64,
    pub vertical_skew: f64,
    pub term_structure: f64,
    pub delta_fitness: f64,
    pub ev: f64,
    pub metrics: CandidateMetrics,
}

/// Score one candidate. `iv_rank` is the provider's output for the symbol.
pub fn score_candidate(
    candidate: &RawCandidate,
    iv_rank: Option<f64>,
) -> Result<ScoreBreakdown, ScoreRejection> {
    let metrics = compute_metrics(candidate).ok_or(ScoreRejection::DeltaMissing)?;

    let pop_band = if candidate.strategy.is_credit() {
        POP_BAND_CREDIT
    } else {
        POP_BAND_DEBIT
    };
    if metrics.pop < pop_band.0 || metrics.pop > pop_band.1 {
        return Err(ScoreRejection::PopOutOfBand);
    }

    let delta_fitness = delta_fitness(candidate).ok_or(ScoreRejection::DeltaMissing)?;
    if delta_fitness <= 0.0 {
        return Err(ScoreRejection::DeltaOutOfBand);
    }

    let ivr = iv_rank.unwrap_or(0.5).clamp(0.0, 1.0);
    let skew_score = (1.0 - metrics.vertical_skew / SKEW_FULL_PENALTY).clamp(0.0, 1.0);
    let term_score = metrics.term_structure.clamp(0.0, 1.0);
    // EV spans roughly [-width, width]; map linearly onto [0, 1].
    let ev_score = ((metrics.ev / candidate.width + 1.0) / 2.0).clamp(0.0, 1.0);

    let composite = WEIGHT_IVR * ivr
        + WEIGHT_VERTICAL_SKEW * skew_score
        + WEIGHT_TERM_STRUCTURE * term_score
        + WEIGHT_DELTA_FITNESS * delta_fitness
        + WEIGHT_EV * ev_score;

    Ok(ScoreBreakdown {
        composite: composite.clamp(0.0, 1.0),
        ivr,
        vertical_skew: skew_score,
        term_structure: term_score,
        delta_fitness,
        ev: ev_score,
        metrics,
    })
}

/// How well the gated leg's |delta| sits inside its band: 1.0 at the band
/// center falling linearly to 0.0 at the edges; None when the leg has no
/// delta.
fn delta_fitness(candidate: &RawCandidate) -> Option<f64> {
    let desc = candidate.strategy.descriptor();
    let delta = match desc.gated_leg {
        GatedLeg::Short => candidate.short_leg.delta?,
        GatedLeg::Long => candidate.long_leg.delta?,
    }
    .abs();

    let (lo, hi) = desc.delta_band;
    let center = (lo + hi) / 2.0;
    let half = (hi - lo) / 2.0;
    if half <= 0.0 {
        return Some(0.0);
    }
    Some((1.0 - (delta - center).abs() / half).max(0.0))
}

/// Score histogram buckets for the run summary:
/// [0, 0.5), [0.5, 0.65), [0.65, 0.70), [0.70, 0.85), [0.85, 1].
pub fn histogram_bucket(score: f64) -> usize {
    if score < 0.5 {
        0
    } else if score < 0.65 {
        1
    } else if score < 0.70 {
        2
    } else if score < 0.85 {
        3
    } else {
        4
    }
}
