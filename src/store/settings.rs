// =============================================================================
// Settings & risk-state key/value tables
// =============================================================================

use anyhow::{Context, Result};

use super::{now_rfc3339, Store};

impl Store {
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(now_rfc3339())
        .execute(self.pool())
        .await
        .with_context(|| format!("failed to write setting {key}"))?;
        Ok(())
    }

    /// Seed a setting only when it has no stored value yet.
    pub async fn set_setting_if_absent(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO NOTHING",
        )
        .bind(key)
        .bind(value)
        .bind(now_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_setting_f64(&self, key: &str) -> Result<Option<f64>> {
        Ok(self.get_setting(key).await?.and_then(|v| v.trim().parse().ok()))
    }

    pub async fn get_setting_i64(&self, key: &str) -> Result<Option<i64>> {
        Ok(self.get_setting(key).await?.and_then(|v| v.trim().parse().ok()))
    }

    pub async fn get_risk_value(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM risk_state WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set_risk_value(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO risk_state (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(now_rfc3339())
        .execute(self.pool())
        .await
        .with_context(|| format!("failed to write risk state {key}"))?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn settings_roundtrip_and_overwrite() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(store.get_setting("TRADING_MODE").await.unwrap().is_none());

        store.set_setting("TRADING_MODE", "DRY_RUN").await.unwrap();
        assert_eq!(store.get_setting("TRADING_MODE").await.unwrap().as_deref(), Some("DRY_RUN"));

        store.set_setting("TRADING_MODE", "LIVE").await.unwrap();
        assert_eq!(store.get_setting("TRADING_MODE").await.unwrap().as_deref(), Some("LIVE"));
    }

    #[tokio::test]
    async fn seed_does_not_overwrite() {
        let store = Store::open_in_memory().await.unwrap();
        store.set_setting("MAX_OPEN_POSITIONS", "5").await.unwrap();
        store.set_setting_if_absent("MAX_OPEN_POSITIONS", "3").await.unwrap();
        assert_eq!(store.get_setting_i64("MAX_OPEN_POSITIONS").await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn typed_getters_tolerate_garbage() {
        let store = Store::open_in_memory().await.unwrap();
        store.set_setting("MIN_SCORE", "not-a-number").await.unwrap();
        assert_eq!(store.get_setting_f64("MIN_SCORE").await.unwrap(), None);

        store.set_setting("MIN_SCORE", " 0.65 ").await.unwrap();
        assert_eq!(store.get_setting_f64("MIN_SCORE").await.unwrap(), Some(0.65));
    }

    #[tokio::test]
    async fn risk_state_is_separate_from_settings() {
        let store = Store::open_in_memory().await.unwrap();
        store.set_risk_value("systemMode", "HARD_STOP").await.unwrap();
        assert!(store.get_setting("systemMode").await.unwrap().is_none());
        assert_eq!(store.get_risk_value("systemMode").await.unwrap().as_deref(), Some("HARD_STOP"));
    }
}
