// =============================================================================
// Central application state — Vertex trading engine
// =============================================================================
//
// Everything a tick needs, shared across the async runtime via Arc. Durable
// truth lives in the store; the only in-memory state that outlives a tick is
// the cached regime observation (for flip logging) and the cycle lock.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use crate::broker::BrokerClient;
use crate::notify::Notifier;
use crate::proposals::scoring::{FlatIvRank, IvRankProvider};
use crate::regime::RegimeDetector;
use crate::store::Store;

pub struct AppState {
    pub store: Store,
    pub broker: Arc<BrokerClient>,
    pub account_id: String,
    pub regime: RegimeDetector,
    pub iv_rank: Arc<dyn IvRankProvider>,
    pub notifier: Notifier,
    /// Held for the duration of a trade-cycle tick; `try_lock` makes
    /// overlapping ticks skip instead of queue.
    pub cycle_lock: tokio::sync::Mutex<()>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(store: Store, broker: BrokerClient, account_id: String, notifier: Notifier) -> Self {
        Self {
            store,
            broker: Arc::new(broker),
            account_id,
            regime: RegimeDetector::new(),
            iv_rank: Arc::new(FlatIvRank),
            notifier,
            cycle_lock: tokio::sync::Mutex::new(()),
            start_time: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("account_id", &self.account_id)
            .field("broker", &self.broker)
            .field("uptime_secs", &self.uptime_secs())
            .finish()
    }
}
