// =============================================================================
// Hard filters — fail-fast data-integrity checks with categorical reasons
// =============================================================================
//
// Everything rejected here is bucketed by reason in the run summary, so a
// day of zero proposals is diagnosable from the logs alone. Strategy-quality
// judgements (POP band, delta fitness) live in scoring, which is the
// authoritative layer for those; this file only rejects candidates whose
// *data* cannot be trusted or whose premium is outside the absolute band.
// =============================================================================

use tracing::warn;

use super::builder::RawCandidate;
use crate::config::PipelineThresholds;
use crate::types::TradingMode;

/// Per-leg absolute spread cap in LIVE and DRY_RUN.
const SPREAD_CAP_STRICT: f64 = 0.15;
/// Looser sandbox cap; sandbox quotes are stale and wide.
const SPREAD_CAP_SANDBOX: f64 = 0.30;
/// Sandbox alternative clause: spread within this fraction of the mid.
const SPREAD_CAP_SANDBOX_PCT_OF_MID: f64 = 0.40;
/// Maximum |iv_long - iv_short| before the vertical is suspect.
const VERTICAL_SKEW_CAP: f64 = 0.08;
/// Absolute debit band (dollars) for debit spreads.
const DEBIT_MIN: f64 = 0.50;
const DEBIT_MAX_MARGIN: f64 = 0.50;

/// Categorical rejection reason, used as the bucket key in run summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterReason {
    MissingOptionLegs,
    InvalidQuotes,
    LiquiditySpreadTooWide,
    MissingIv,
    VerticalSkewOutOfRange,
    CreditBelowMinimum,
    DebitBelowMinimum,
    DebitAboveMaximum,
}

impl FilterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingOptionLegs => "MISSING_OPTION_LEGS",
            Self::InvalidQuotes => "INVALID_QUOTES",
            Self::LiquiditySpreadTooWide => "LIQUIDITY_SPREAD_TOO_WIDE",
            Self::MissingIv => "MISSING_IV",
            Self::VerticalSkewOutOfRange => "VERTICAL_SKEW_OUT_OF_RANGE",
            Self::CreditBelowMinimum => "CREDIT_BELOW_MINIMUM",
            Self::DebitBelowMinimum => "DEBIT_BELOW_MINIMUM",
            Self::DebitAboveMaximum => "DEBIT_ABOVE_MAXIMUM",
        }
    }
}

impl std::fmt::Display for FilterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run every hard filter against one candidate. First failure wins.
pub fn hard_filter(
    candidate: &RawCandidate,
    mode: TradingMode,
    thresholds: &PipelineThresholds,
) -> Result<(), FilterReason> {
    let short = &candidate.short_leg;
    let long = &candidate.long_leg;

    if short.symbol.is_empty() || long.symbol.is_empty() {
        return Err(FilterReason::MissingOptionLegs);
    }

    // Non-positive or crossed quotes on either leg.
    if !short.has_valid_quote() || !long.has_valid_quote() {
        return Err(FilterReason::InvalidQuotes);
    }

    // Per-leg liquidity.
    for leg in [short, long] {
        let spread = leg.spread();
        let ok = match mode {
            TradingMode::Live | TradingMode::DryRun => spread <= SPREAD_CAP_STRICT,
            TradingMode::SandboxPaper => {
                spread <= SPREAD_CAP_SANDBOX
                    || (leg.mid() > 0.0 && spread / leg.mid() <= SPREAD_CAP_SANDBOX_PCT_OF_MID)
            }
        };
        if !ok {
            return Err(FilterReason::LiquiditySpreadTooWide);
        }
    }

    // Both legs need IV for skew and (later) the crush exit baseline.
    let (Some(short_iv), Some(long_iv)) = (short.implied_volatility, long.implied_volatility)
    else {
        return Err(FilterReason::MissingIv);
    };

    let skew = (long_iv - short_iv).abs();
    if skew > VERTICAL_SKEW_CAP {
        if mode == TradingMode::SandboxPaper {
            warn!(
                symbol = %candidate.symbol,
                short_strike = candidate.short_strike,
                skew,
                "vertical skew out of range (sandbox: warn only)"
            );
        } else {
            return Err(FilterReason::VerticalSkewOutOfRange);
        }
    }

    // Premium band.
    if candidate.strategy.is_credit() {
        if candidate.premium < candidate.width * thresholds.min_credit_fraction {
            return Err(FilterReason::CreditBelowMinimum);
        }
    } else {
        if candidate.premium < DEBIT_MIN {
            return Err(FilterReason::DebitBelowMinimum);
        }
        if candidate.premium > candidate.width - DEBIT_MAX_MARGIN {
            return Err(FilterReason::DebitAboveMaximum);
        }
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::OptionQuote;
    use crate::types::{OptionType, Strategy};

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

    fn candidate(strategy: Strategy, premium: f64, short: OptionQuote, long: OptionQuote) -> RawCandidate {
        RawCandidate {
            strategy,
            symbol: "SPY".to_string(),
            expiration: "2025-01-17".to_string(),
            dte: 14,
            short_strike: short.strike,
            long_strike: long.strike,
            width: 5.0,
            short_leg: short,
            long_leg: long,
            premium,
        }
    }

    fn thresholds() -> PipelineThresholds {
        PipelineThresholds::default()
    }

    #[test]
    fn healthy_credit_candidate_passes() {
        let c = candidate(
            Strategy::BullPutCredit,
            1.00,
            leg(580.0, 1.00, 1.10, Some(0.21)),
            leg(575.0, 0.75, 0.85, Some(0.20)),
        );
        assert!(hard_filter(&c, TradingMode::Live, &thresholds()).is_ok());
    }

    #[test]
    fn crossed_quote_rejected() {
        let c = candidate(
            Strategy::BullPutCredit,
            1.00,
            leg(580.0, 1.20, 1.10, Some(0.21)),
            leg(575.0, 0.75, 0.85, Some(0.20)),
        );
        assert_eq!(
            hard_filter(&c, TradingMode::Live, &thresholds()),
            Err(FilterReason::InvalidQuotes)
        );
    }

    #[test]
    fn wide_spread_rejected_strict_but_tolerated_in_sandbox() {
        let c = candidate(
            Strategy::BullPutCredit,
            1.00,
            leg(580.0, 1.00, 1.25, Some(0.21)), // 0.25 spread, mid 1.125
            leg(575.0, 0.75, 0.85, Some(0.20)),
        );
        assert_eq!(
            hard_filter(&c, TradingMode::Live, &thresholds()),
            Err(FilterReason::LiquiditySpreadTooWide)
        );
        // Sandbox: 0.25 <= 0.30 absolute cap.
        assert!(hard_filter(&c, TradingMode::SandboxPaper, &thresholds()).is_ok());
    }

    #[test]
    fn sandbox_percent_of_mid_clause() {
        // 0.40 spread fails the 0.30 sandbox absolute cap but the mid is
        // 4.00, so spread/mid = 10% passes the percent clause.
        let c = candidate(
            Strategy::BullPutCredit,
            1.00,
            leg(580.0, 3.80, 4.20, Some(0.21)),
            leg(575.0, 0.75, 0.85, Some(0.20)),
        );
        assert!(hard_filter(&c, TradingMode::SandboxPaper, &thresholds()).is_ok());
        assert_eq!(
            hard_filter(&c, TradingMode::Live, &thresholds()),
            Err(FilterReason::LiquiditySpreadTooWide)
        );
    }

    #[test]
    fn missing_iv_rejected() {
        let c = candidate(
            Strategy::BullPutCredit,
            1.00,
            leg(580.0, 1.00, 1.10, None),
            leg(575.0, 0.75, 0.85, Some(0.20)),
        );
        assert_eq!(
            hard_filter(&c, TradingMode::Live, &thresholds()),
            Err(FilterReason::MissingIv)
        );
    }

    #[test]
    fn skew_rejected_live_warned_sandbox() {
        let c = candidate(
            Strategy::BullPutCredit,
            1.00,
            leg(580.0, 1.00, 1.10, Some(0.30)),
            leg(575.0, 0.75, 0.85, Some(0.20)),
        );
        assert_eq!(
            hard_filter(&c, TradingMode::Live, &thresholds()),
            Err(FilterReason::VerticalSkewOutOfRange)
        );
        assert!(hard_filter(&c, TradingMode::SandboxPaper, &thresholds()).is_ok());
    }

    #[test]
    fn thin_credit_rejected() {
        // width 5 × min_credit_fraction 0.18 = 0.90 floor.
        let c = candidate(
            Strategy::BullPutCredit,
            0.50,
            leg(580.0, 0.50, 0.55, Some(0.21)),
            leg(575.0, 0.02, 0.06, Some(0.20)),
        );
        assert_eq!(
            hard_filter(&c, TradingMode::Live, &thresholds()),
            Err(FilterReason::CreditBelowMinimum)
        );
    }

    #[test]
    fn debit_band_enforced() {
        let cheap = candidate(
            Strategy::BullCallDebit,
            0.30,
            leg(600.0, 1.00, 1.10, Some(0.21)),
            leg(595.0, 1.30, 1.40, Some(0.21)),
        );
        assert_eq!(
            hard_filter(&cheap, TradingMode::Live, &thresholds()),
            Err(FilterReason::DebitBelowMinimum)
        );

        let rich = candidate(
            Strategy::BullCallDebit,
            4.80,
            leg(600.0, 1.00, 1.10, Some(0.21)),
            leg(595.0, 5.80, 5.90, Some(0.21)),
        );
        assert_eq!(
            hard_filter(&rich, TradingMode::Live, &thresholds()),
            Err(FilterReason::DebitAboveMaximum)
        );
    }
}
