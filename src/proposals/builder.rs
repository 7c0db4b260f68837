// =============================================================================
// Candidate builder — one parametric builder over a strategy descriptor table
// =============================================================================
//
// The four vertical strategies differ only in option type, which side of the
// short strike the long leg sits on, which leg the delta band gates, and
// whether the spread collects or pays premium. Those four facts live in the
// descriptor; a single builder walks the chain for all of them.
// =============================================================================

use std::collections::HashMap;

use crate::broker::{OptionQuote, UnderlyingQuote};
use crate::types::{OptionType, Strategy};

/// Standard spread width in strike dollars.
pub const SPREAD_WIDTH: f64 = 5.0;

/// Which leg a strategy's delta band applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatedLeg {
    Short,
    Long,
}

/// The per-strategy facts the parametric builder consumes.
#[derive(Debug, Clone, Copy)]
pub struct StrategyDescriptor {
    pub strategy: Strategy,
    pub option_type: OptionType,
    /// Long strike = short strike + offset × width.
    pub long_offset: f64,
    /// Inclusive |delta| band for the gated leg.
    pub delta_band: (f64, f64),
    pub gated_leg: GatedLeg,
    /// Whether the short leg must be out of the money relative to spot.
    pub requires_short_otm: bool,
}

impl Strategy {
    pub fn descriptor(&self) -> StrategyDescriptor {
        match self {
            Strategy::BullPutCredit => StrategyDescriptor {
                strategy: *self,
                option_type: OptionType::Put,
                long_offset: -1.0,
                delta_band: (0.20, 0.35),
                gated_leg: GatedLeg::Short,
                requires_short_otm: true,
            },
            Strategy::BearCallCredit => StrategyDescriptor {
                strategy: *self,
                option_type: OptionType::Call,
                long_offset: 1.0,
                delta_band: (0.20, 0.35),
                gated_leg: GatedLeg::Short,
                requires_short_otm: true,
            },
            Strategy::BullCallDebit => StrategyDescriptor {
                strategy: *self,
                option_type: OptionType::Call,
                long_offset: -1.0,
                delta_band: (0.40, 0.55),
                gated_leg: GatedLeg::Long,
                requires_short_otm: false,
            },
            Strategy::BearPutDebit => StrategyDescriptor {
                strategy: *self,
                option_type: OptionType::Put,
                long_offset: 1.0,
                delta_band: (0.40, 0.55),
                gated_leg: GatedLeg::Long,
                requires_short_otm: false,
            },
        }
    }
}

/// A structurally valid spread candidate, before filtering and scoring.
#[derive(Debug, Clone)]
pub struct RawCandidate {
    pub strategy: Strategy,
    pub symbol: String,
    /// YYYY-MM-DD.
    pub expiration: String,
    pub dte: i64,
    pub short_strike: f64,
    pub long_strike: f64,
    pub width: f64,
    pub short_leg: OptionQuote,
    pub long_leg: OptionQuote,
    /// Always positive: the net credit collected or net debit paid.
    pub premium: f64,
}

impl RawCandidate {
    /// Signed premium target: positive credit, negative debit.
    pub fn credit_target(&self) -> f64 {
        if self.strategy.is_credit() {
            self.premium
        } else {
            -self.premium
        }
    }

    /// The leg whose delta gates candidate admission.
    pub fn gated_leg(&self) -> &OptionQuote {
        match self.strategy.descriptor().gated_leg {
            GatedLeg::Short => &self.short_leg,
            GatedLeg::Long => &self.long_leg,
        }
    }
}

/// Walk one chain and emit every candidate whose geometry and gated-leg
/// delta fit the strategy descriptor. Quote-quality checks are left to the
/// hard filters so rejects are observable.
pub fn build_candidates(
    chain: &[OptionQuote],
    underlying: &UnderlyingQuote,
    strategy: Strategy,
    expiration: &str,
    dte: i64,
) -> Vec<RawCandidate> {
    let desc = strategy.descriptor();
    let spot = underlying.last;

    // Index the relevant side of the chain by strike (cents precision).
    let by_strike: HashMap<i64, &OptionQuote> = chain
        .iter()
        .filter(|o| o.option_type == desc.option_type)
        .map(|o| (strike_key(o.strike), o))
        .collect();

    let mut out = Vec::new();

    for short_leg in chain.iter().filter(|o| o.option_type == desc.option_type) {
        if desc.requires_short_otm {
            let otm = match desc.option_type {
                OptionType::Put => short_leg.strike < spot,
                OptionType::Call => short_leg.strike > spot,
            };
            if !otm {
                continue;
            }
        }

        let long_strike = strategy.expected_long_strike(short_leg.strike, SPREAD_WIDTH);
        let Some(long_leg) = by_strike.get(&strike_key(long_strike)) else {
            continue;
        };

        let candidate = RawCandidate {
            strategy,
            symbol: underlying.symbol.clone(),
            expiration: expiration.to_string(),
            dte,
            short_strike: short_leg.strike,
            long_strike,
            width: SPREAD_WIDTH,
            short_leg: short_leg.clone(),
            long_leg: (*long_leg).clone(),
            premium: if strategy.is_credit() {
                short_leg.mid() - long_leg.mid()
            } else {
                long_leg.mid() - short_leg.mid()
            },
        };

        // Delta band on the gated leg; candidates without a delta are kept
        // and rejected later as MISSING_IV-style data problems if greeks
        // never arrive.
        if let Some(delta) = candidate.gated_leg().delta {
            let abs = delta.abs();
            if abs < desc.delta_band.0 || abs > desc.delta_band.1 {
                continue;
            }
        }

        out.push(candidate);
    }

    out
}

fn strike_key(strike: f64) -> i64 {
    (strike * 100.0).round() as i64
}
