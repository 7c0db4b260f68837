// =============================================================================
// Underlying price window — timestamp-keyed ring buffer
// =============================================================================
//
// Persisted per symbol (settings key PRICE_WINDOW_<symbol>) so the 15-second
// spike check survives restarts and stays correct regardless of tick
// cadence: `change_over` compares the latest sample against the newest
// sample at least that old, never against a fixed rotation slot.
// =============================================================================

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::store::Store;

/// Samples older than this are pruned on every push.
const MAX_AGE_SECS: i64 = 120;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PricePoint {
    /// Unix seconds.
    pub ts: i64,
    pub price: f64,
}

/// A small, time-ordered buffer of recent underlying prices.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriceWindow {
    points: Vec<PricePoint>,
}

impl PriceWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample and prune everything older than [`MAX_AGE_SECS`].
    /// Out-of-order samples (clock skew) are dropped.
    pub fn push(&mut self, ts: i64, price: f64) {
        if let Some(last) = self.points.last() {
            if ts < last.ts {
                return;
            }
        }
        self.points.push(PricePoint { ts, price });
        self.points.retain(|p| ts - p.ts <= MAX_AGE_SECS);
    }

    pub fn latest(&self) -> Option<PricePoint> {
        self.points.last().copied()
    }

    /// Relative price change between the latest sample and the newest sample
    /// at least `window_secs` older than it. None until the buffer spans the
    /// window.
    pub fn change_over(&self, window_secs: i64) -> Option<f64> {
        let latest = self.points.last()?;
        let reference = self
            .points
            .iter()
            .rev()
            .find(|p| latest.ts - p.ts >= window_secs)?;
        if reference.price <= 0.0 {
            return None;
        }
        Some((latest.price - reference.price) / reference.price)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

fn setting_key(symbol: &str) -> String {
    format!("PRICE_WINDOW_{}", symbol.to_uppercase())
}

/// Load the persisted window for a symbol; a missing or corrupt value yields
/// a fresh empty window.
pub async fn load(store: &Store, symbol: &str) -> Result<PriceWindow> {
    let raw = store.get_setting(&setting_key(symbol)).await?;
    Ok(raw
        .and_then(|json| serde_json::from_str(&json).ok())
        .unwrap_or_default())
}

pub async fn save(store: &Store, symbol: &str, window: &PriceWindow) -> Result<()> {
    let json = serde_json::to_string(window)?;
    store.set_setting(&setting_key(symbol), &json).await
}

/// Record one observation and return the updated window.
pub async fn record(store: &Store, symbol: &str, ts: i64, price: f64) -> Result<PriceWindow> {
    let mut window = load(store, symbol).await?;
    window.push(ts, price);
    save(store, symbol, &window).await?;
    Ok(window)
}
