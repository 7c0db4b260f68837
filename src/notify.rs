// =============================================================================
// Notifier — best-effort webhook delivery
// =============================================================================
//
// Fire-and-forget JSON POSTs for the events a human wants to hear about
// (new proposal, emergency exit). Delivery failures are logged and dropped;
// notification is never allowed to fail a trade cycle.
// =============================================================================

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct Notifier {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl Notifier {
    /// `webhook_url` comes from the environment; None disables delivery.
    pub fn new(webhook_url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build reqwest client");

        Self {
            webhook_url: webhook_url.filter(|u| !u.trim().is_empty()),
            client,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// Post an event payload. Best effort: errors are logged, never returned.
    pub async fn send(&self, event: &str, payload: Value) {
        let Some(url) = &self.webhook_url else {
            debug!(event, "notifier disabled, skipping");
            return;
        };

        let body = serde_json::json!({ "event": event, "payload": payload });
        match self.client.post(url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(event, "notification delivered");
            }
            Ok(resp) => {
                warn!(event, status = %resp.status(), "notification rejected");
            }
            Err(e) => {
                warn!(event, error = %e, "notification failed");
            }
        }
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("enabled", &self.webhook_url.is_some())
            .finish()
    }
}
