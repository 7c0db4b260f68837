// =============================================================================
// Market Regime Detector — spot vs SMA20
// =============================================================================
//
// Classifies the primary symbol into BULLISH / NEUTRAL / BEARISH from where
// spot sits relative to the 20-period simple moving average of daily closes.
// Strategy gating consumes the discrete regime; directional gating consumes
// the continuous trend score.
// =============================================================================

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::types::{Regime, Strategy};

/// Relative distance from the SMA inside which the market counts as NEUTRAL.
const NEUTRAL_BAND: f64 = 0.005;

/// Simple moving average over the trailing `period` values; None when there
/// is not enough history.
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// Continuous trend score: relative distance of spot from the SMA. Positive
/// means spot above trend.
pub fn trend_score(spot: f64, sma20: f64) -> f64 {
    if sma20 <= 0.0 {
        return 0.0;
    }
    (spot - sma20) / sma20
}

/// Discrete regime from the trend score.
pub fn classify(spot: f64, sma20: f64) -> Regime {
    let score = trend_score(spot, sma20);
    if score > NEUTRAL_BAND {
        Regime::Bullish
    } else if score < -NEUTRAL_BAND {
        Regime::Bearish
    } else {
        Regime::Neutral
    }
}

impl Strategy {
    /// Which regimes a strategy is allowed to open into.
    pub fn tolerates(&self, regime: Regime) -> bool {
        match regime {
            Regime::Neutral => true,
            Regime::Bullish => self.is_bullish(),
            Regime::Bearish => !self.is_bullish(),
        }
    }
}

/// Caches the last observed regime so flips get logged exactly once.
pub struct RegimeDetector {
    last: RwLock<Option<Regime>>,
}

impl RegimeDetector {
    pub fn new() -> Self {
        Self {
            last: RwLock::new(None),
        }
    }

    /// Classify and record, logging when the regime changed vs the last
    /// observation.
    pub fn observe(&self, symbol: &str, spot: f64, sma20: f64) -> Regime {
        let regime = classify(spot, sma20);
        let previous = { *self.last.read() };

        match previous {
            Some(prev) if prev != regime => {
                info!(symbol, from = %prev, to = %regime, spot, sma20, "regime flip");
            }
            None => {
                debug!(symbol, regime = %regime, spot, sma20, "initial regime observation");
            }
            _ => {}
        }

        *self.last.write() = Some(regime);
        regime
    }

    pub fn current(&self) -> Option<Regime> {
        *self.last.read()
    }
}

impl Default for RegimeDetector {
    fn default() -> Self {
        Self::new()
    }
}
