// =============================================================================
// Risk & system-mode manager
// =============================================================================
//
// A single durable cell (risk_state.systemMode) drives the NORMAL/HARD_STOP
// state machine; every transition is audited in system_logs. HARD_STOP is
// only ever set by explicit admin action or by the daily-loss accounting —
// never by an isolated broker failure.
// =============================================================================

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, warn};

use crate::clock;
use crate::config::EngineConfig;
use crate::store::models::Trade;
use crate::store::Store;
use crate::types::SystemMode;

// Risk-state keys.
pub const KEY_SYSTEM_MODE: &str = "systemMode";
pub const KEY_RISK_STATE: &str = "riskState";
pub const KEY_EMERGENCY_EXIT_COUNT: &str = "emergencyExitCountToday";
pub const KEY_EMERGENCY_EXIT_DATE: &str = "emergencyExitCountDate";
pub const KEY_LAST_HARD_STOP_AT: &str = "lastHardStopAt";
pub const KEY_LAST_HARD_STOP_REASON: &str = "lastHardStopReason";
pub const KEY_LAST_SYSTEM_MODE_CHANGE: &str = "lastSystemModeChange";

/// Phrases in a broker rejection that mean "the market is shut", which is
/// routine and must never escalate.
const BENIGN_REJECTION_PHRASES: &[&str] = &[
    "market is closed",
    "market closed",
    "markets are closed",
    "trading-hours",
    "trading hours",
    "after-hours",
    "after hours",
    "outside of trading",
    "weekend",
    "holiday",
];

/// Current system mode; a missing cell reads as NORMAL.
pub async fn system_mode(store: &Store) -> Result<SystemMode> {
    Ok(store
        .get_risk_value(KEY_SYSTEM_MODE)
        .await?
        .and_then(|v| v.parse().ok())
        .unwrap_or(SystemMode::Normal))
}

/// Transition the system mode. No-ops (returning false) when the mode is
/// already `new_mode`; otherwise persists the mode, the audit keys, and a
/// `system_mode_change` system log.
pub async fn set_system_mode(
    store: &Store,
    new_mode: SystemMode,
    reason: &str,
    details: Option<serde_json::Value>,
) -> Result<bool> {
    let current = system_mode(store).await?;
    if current == new_mode {
        return Ok(false);
    }

    let now = Utc::now().to_rfc3339();
    store.set_risk_value(KEY_SYSTEM_MODE, new_mode.as_str()).await?;
    store.set_risk_value(KEY_LAST_SYSTEM_MODE_CHANGE, &now).await?;

    if new_mode == SystemMode::HardStop {
        store.set_risk_value(KEY_LAST_HARD_STOP_AT, &now).await?;
        store.set_risk_value(KEY_LAST_HARD_STOP_REASON, reason).await?;
        warn!(reason, "system mode -> HARD_STOP");
    } else {
        info!(reason, "system mode -> NORMAL");
    }

    let log_details = json!({
        "from": current.as_str(),
        "to": new_mode.as_str(),
        "reason": reason,
        "details": details,
    });
    store
        .record_system_log(
            "system_mode_change",
            &format!("{current} -> {new_mode}: {reason}"),
            Some(&log_details),
        )
        .await?;

    Ok(true)
}

/// Clear the risk state back to NORMAL and reset the emergency-exit counter.
/// Does not touch the system mode.
pub async fn reset_risk_state(store: &Store) -> Result<()> {
    store.set_risk_value(KEY_RISK_STATE, "NORMAL").await?;
    store.set_risk_value(KEY_EMERGENCY_EXIT_COUNT, "0").await?;
    store
        .record_system_log("risk_state_reset", "risk state reset to NORMAL", None)
        .await?;
    info!("risk state reset");
    Ok(())
}

/// Gate for new entries.
///
/// Returns `(true, None)` only when it is a trading day inside market hours,
/// both the system mode and risk state are NORMAL, and the open-position
/// count is under the cap.
pub async fn can_open_new_trade(
    store: &Store,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Result<(bool, Option<String>)> {
    if !clock::is_trading_day(clock::eastern_date(now)) {
        return Ok((false, Some("not a trading day".to_string())));
    }
    if !clock::is_market_hours(now) {
        return Ok((false, Some("outside market hours".to_string())));
    }

    let mode = system_mode(store).await?;
    if mode != SystemMode::Normal {
        return Ok((false, Some(format!("system mode is {mode}"))));
    }

    let risk = store
        .get_risk_value(KEY_RISK_STATE)
        .await?
        .unwrap_or_else(|| "NORMAL".to_string());
    if risk != "NORMAL" {
        return Ok((false, Some(format!("risk state is {risk}"))));
    }

    let open = store.count_active_trades().await?;
    if open >= config.max_open_positions {
        return Ok((
            false,
            Some(format!(
                "open positions at cap ({open}/{})",
                config.max_open_positions
            )),
        ));
    }

    Ok((true, None))
}

/// Whether a broker error message is a routine closed-market rejection.
/// These are swallowed by callers and must never trigger HARD_STOP.
pub fn is_benign_broker_rejection(message: &str) -> bool {
    let lowered = message.to_lowercase();
    BENIGN_REJECTION_PHRASES.iter().any(|p| lowered.contains(p))
}

/// Accounting hook invoked by the reconciler when an exit fill lands.
///
/// Counts emergency exits per ET day, and trips HARD_STOP when the day's
/// realized loss breaches the configured limit — the only automatic path
/// into HARD_STOP.
pub async fn record_exit_fill(
    store: &Store,
    config: &EngineConfig,
    trade: &Trade,
    realized_pnl: f64,
    now: DateTime<Utc>,
) -> Result<()> {
    let today = clock::eastern_date(now).to_string();

    if trade
        .exit_reason
        .as_deref()
        .is_some_and(|r| r.contains("EMERGENCY") || r.contains("STRUCTURAL"))
    {
        let stored_date = store.get_risk_value(KEY_EMERGENCY_EXIT_DATE).await?;
        let count = if stored_date.as_deref() == Some(today.as_str()) {
            store
                .get_risk_value(KEY_EMERGENCY_EXIT_COUNT)
                .await?
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0)
        } else {
            0
        };
        store
            .set_risk_value(KEY_EMERGENCY_EXIT_COUNT, &(count + 1).to_string())
            .await?;
        store.set_risk_value(KEY_EMERGENCY_EXIT_DATE, &today).await?;
        warn!(
            trade_id = %trade.id,
            count = count + 1,
            "emergency exit recorded"
        );
    }

    // Daily realized-loss limit, measured from ET midnight.
    let day_start_utc = clock::to_eastern(now)
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| {
            use chrono::TimeZone;
            chrono_tz::US::Eastern
                .from_local_datetime(&naive)
                .single()
        })
        .map(|et| et.with_timezone(&Utc).to_rfc3339())
        .unwrap_or_else(|| format!("{today}T00:00:00+00:00"));

    let daily_pnl = store.realized_pnl_since(&day_start_utc).await?;
    if daily_pnl <= -config.daily_loss_limit {
        let details = json!({
            "dailyRealizedPnl": daily_pnl,
            "limit": config.daily_loss_limit,
            "lastTradeId": trade.id,
            "lastTradePnl": realized_pnl,
        });
        set_system_mode(store, SystemMode::HardStop, "DAILY_LOSS_LIMIT", Some(details)).await?;
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::now_rfc3339;
    use crate::types::{Strategy, TradeStatus};
    use chrono::TimeZone;

    fn closed_trade(id: &str, pnl: f64, exit_reason: &str, closed_at: &str) -> Trade {
        Trade {
            id: id.to_string(),
            proposal_id: format!("prop-{id}"),
            symbol: "SPY".to_string(),
            expiration: "2025-01-17".to_string(),
            strategy: Strategy::BullPutCredit,
            short_strike: 580.0,
            long_strike: 575.0,
            width: 5.0,
            quantity: 1,
            entry_price: Some(1.0),
            exit_price: Some(0.5),
            max_profit: Some(1.0),
            max_loss: Some(4.0),
            realized_pnl: Some(pnl),
            max_seen_profit_fraction: 0.0,
            iv_entry: None,
            status: TradeStatus::Closed,
            exit_reason: Some(exit_reason.to_string()),
            broker_order_id_open: None,
            broker_order_id_close: None,
            opened_at: Some(now_rfc3339()),
            closed_at: Some(closed_at.to_string()),
            created_at: now_rfc3339(),
            updated_at: now_rfc3339(),
        }
    }

    #[tokio::test]
    async fn mode_transition_is_audited_and_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        assert_eq!(system_mode(&store).await.unwrap(), SystemMode::Normal);

        let changed = set_system_mode(&store, SystemMode::HardStop, "manual", None)
            .await
            .unwrap();
        assert!(changed);
        assert_eq!(system_mode(&store).await.unwrap(), SystemMode::HardStop);
        assert!(store.get_risk_value(KEY_LAST_HARD_STOP_AT).await.unwrap().is_some());
        assert_eq!(
            store.get_risk_value(KEY_LAST_HARD_STOP_REASON).await.unwrap().as_deref(),
            Some("manual")
        );

        // Same mode again: no-op, no duplicate audit entry.
        let changed = set_system_mode(&store, SystemMode::HardStop, "again", None)
            .await
            .unwrap();
        assert!(!changed);

        let logs = store.recent_system_logs(10).await.unwrap();
        let mode_changes: Vec<_> = logs
            .iter()
            .filter(|l| l.log_type == "system_mode_change")
            .collect();
        assert_eq!(mode_changes.len(), 1);
    }

    #[tokio::test]
    async fn benign_rejection_phrases() {
        assert!(is_benign_broker_rejection("The Market is Closed right now"));
        assert!(is_benign_broker_rejection("rejected: after-hours trading not permitted"));
        assert!(is_benign_broker_rejection("Order rejected due to market holiday"));
        assert!(is_benign_broker_rejection("no trading on the weekend"));
        assert!(!is_benign_broker_rejection("insufficient buying power"));
        assert!(!is_benign_broker_rejection("invalid option symbol"));
    }

    #[tokio::test]
    async fn gate_blocks_on_hard_stop_regardless_of_time() {
        let store = Store::open_in_memory().await.unwrap();
        let config = EngineConfig::default();
        // Friday 2025-01-17 10:00 ET.
        let now = Utc.with_ymd_and_hms(2025, 1, 17, 15, 0, 0).unwrap();

        let (ok, _) = can_open_new_trade(&store, &config, now).await.unwrap();
        assert!(ok);

        set_system_mode(&store, SystemMode::HardStop, "test", None).await.unwrap();
        let (ok, reason) = can_open_new_trade(&store, &config, now).await.unwrap();
        assert!(!ok);
        assert!(reason.unwrap().contains("HARD_STOP"));
    }

    #[tokio::test]
    async fn gate_blocks_outside_market_hours_and_at_cap() {
        let store = Store::open_in_memory().await.unwrap();
        let config = EngineConfig::default();

        // Saturday.
        let weekend = Utc.with_ymd_and_hms(2025, 1, 18, 15, 0, 0).unwrap();
        let (ok, _) = can_open_new_trade(&store, &config, weekend).await.unwrap();
        assert!(!ok);

        // At the position cap.
        let now = Utc.with_ymd_and_hms(2025, 1, 17, 15, 0, 0).unwrap();
        for i in 0..config.max_open_positions {
            let t = closed_trade(&format!("t{i}"), 0.0, "PROFIT_TARGET", &now_rfc3339());
            let mut t = t;
            t.status = TradeStatus::Open;
            store.insert_trade(&t).await.unwrap();
        }
        let (ok, reason) = can_open_new_trade(&store, &config, now).await.unwrap();
        assert!(!ok);
        assert!(reason.unwrap().contains("cap"));
    }

    #[tokio::test]
    async fn daily_loss_limit_trips_hard_stop() {
        let store = Store::open_in_memory().await.unwrap();
        let mut config = EngineConfig::default();
        config.daily_loss_limit = 100.0;

        let now = Utc.with_ymd_and_hms(2025, 1, 17, 20, 0, 0).unwrap();
        let closed_at = now.to_rfc3339();

        let trade = closed_trade("t1", -150.0, "STOP_LOSS", &closed_at);
        store.insert_trade(&trade).await.unwrap();

        record_exit_fill(&store, &config, &trade, -150.0, now).await.unwrap();
        assert_eq!(system_mode(&store).await.unwrap(), SystemMode::HardStop);
        assert_eq!(
            store.get_risk_value(KEY_LAST_HARD_STOP_REASON).await.unwrap().as_deref(),
            Some("DAILY_LOSS_LIMIT")
        );
    }

    #[tokio::test]
    async fn small_loss_does_not_trip() {
        let store = Store::open_in_memory().await.unwrap();
        let config = EngineConfig::default();
        let now = Utc.with_ymd_and_hms(2025, 1, 17, 20, 0, 0).unwrap();

        let trade = closed_trade("t1", -40.0, "STOP_LOSS", &now.to_rfc3339());
        store.insert_trade(&trade).await.unwrap();
        record_exit_fill(&store, &config, &trade, -40.0, now).await.unwrap();
        assert_eq!(system_mode(&store).await.unwrap(), SystemMode::Normal);
    }

    #[tokio::test]
    async fn emergency_exits_counted_per_day() {
        let store = Store::open_in_memory().await.unwrap();
        let config = EngineConfig::default();
        let now = Utc.with_ymd_and_hms(2025, 1, 17, 20, 0, 0).unwrap();

        let trade = closed_trade("t1", -10.0, "EMERGENCY_STRUCTURAL_BREAK", &now.to_rfc3339());
        store.insert_trade(&trade).await.unwrap();
        record_exit_fill(&store, &config, &trade, -10.0, now).await.unwrap();
        record_exit_fill(&store, &config, &trade, -10.0, now).await.unwrap();

        assert_eq!(
            store.get_risk_value(KEY_EMERGENCY_EXIT_COUNT).await.unwrap().as_deref(),
            Some("2")
        );
    }
}
