// =============================================================================
// Append-only logs: broker interactions and structured system events
// =============================================================================

use anyhow::{Context, Result};

use super::models::{system_log_from_row, BrokerEventRecord, SystemLogRecord};
use super::{now_rfc3339, Store};

impl Store {
    pub async fn record_broker_event(&self, event: &BrokerEventRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO broker_events (operation, symbol, expiration, order_id, status_code,
                ok, duration_ms, mode, error_message, strategy, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.operation)
        .bind(&event.symbol)
        .bind(&event.expiration)
        .bind(&event.order_id)
        .bind(event.status_code)
        .bind(event.ok as i64)
        .bind(event.duration_ms)
        .bind(&event.mode)
        .bind(&event.error_message)
        .bind(&event.strategy)
        .bind(&event.created_at)
        .execute(self.pool())
        .await
        .context("failed to record broker event")?;
        Ok(())
    }

    /// Structured system log entry; `details` is serialized JSON.
    pub async fn record_system_log(
        &self,
        log_type: &str,
        message: &str,
        details: Option<&serde_json::Value>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO system_logs (log_type, message, details, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(log_type)
        .bind(message)
        .bind(details.map(|d| d.to_string()))
        .bind(now_rfc3339())
        .execute(self.pool())
        .await
        .context("failed to record system log")?;
        Ok(())
    }

    pub async fn recent_system_logs(&self, limit: i64) -> Result<Vec<SystemLogRecord>> {
        let rows = sqlx::query("SELECT * FROM system_logs ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(system_log_from_row).collect()
    }

    pub async fn count_broker_events(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM broker_events")
            .fetch_one(self.pool())
            .await?;
        Ok(row.0)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broker_events_append() {
        let store = Store::open_in_memory().await.unwrap();
        let event = BrokerEventRecord {
            operation: "place_spread_order".to_string(),
            symbol: Some("SPY".to_string()),
            expiration: Some("2025-01-17".to_string()),
            order_id: Some("b1".to_string()),
            status_code: Some(200),
            ok: true,
            duration_ms: 140,
            mode: "SANDBOX_PAPER".to_string(),
            error_message: None,
            strategy: Some("BULL_PUT_CREDIT".to_string()),
            created_at: now_rfc3339(),
        };
        store.record_broker_event(&event).await.unwrap();
        store.record_broker_event(&event).await.unwrap();
        assert_eq!(store.count_broker_events().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn system_logs_store_details_json() {
        let store = Store::open_in_memory().await.unwrap();
        let details = serde_json::json!({ "candidateCount": 12, "bestScore": 0.74 });
        store
            .record_system_log("proposals_summary", "run complete", Some(&details))
            .await
            .unwrap();

        let logs = store.recent_system_logs(10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].log_type, "proposals_summary");
        let parsed: serde_json::Value =
            serde_json::from_str(logs[0].details.as_ref().unwrap()).unwrap();
        assert_eq!(parsed["candidateCount"], 12);
    }
}
