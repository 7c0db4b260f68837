// =============================================================================
// Config resolver — typed view over the settings table
// =============================================================================
//
// Every tunable lives in the store so the engine can be reconfigured without
// a restart; this module reads the raw strings once per tick and hands the
// rest of the engine a fully typed snapshot with defaults applied.
// =============================================================================

use anyhow::Result;
use chrono::NaiveTime;
use tracing::warn;

use crate::store::Store;
use crate::types::{Strategy, TradingMode};

// ---------------------------------------------------------------------------
// Setting keys
// ---------------------------------------------------------------------------

pub mod keys {
    pub const TRADING_MODE: &str = "TRADING_MODE";
    pub const MAX_OPEN_POSITIONS: &str = "MAX_OPEN_POSITIONS";
    pub const UNDERLYING_WHITELIST: &str = "UNDERLYING_WHITELIST";
    pub const STRATEGY_WHITELIST: &str = "STRATEGY_WHITELIST";
    pub const DEFAULT_TRADE_QUANTITY: &str = "DEFAULT_TRADE_QUANTITY";
    pub const MIN_SCORE: &str = "MIN_SCORE";
    pub const MIN_CREDIT_FRACTION: &str = "MIN_CREDIT_FRACTION";
    pub const MIN_DTE: &str = "MIN_DTE";
    pub const MAX_DTE: &str = "MAX_DTE";
    pub const DAILY_LOSS_LIMIT: &str = "DAILY_LOSS_LIMIT";

    pub const CLOSE_RULE_PROFIT_TARGET_FRACTION: &str = "CLOSE_RULE_PROFIT_TARGET_FRACTION";
    pub const CLOSE_RULE_STOP_LOSS_FRACTION: &str = "CLOSE_RULE_STOP_LOSS_FRACTION";
    pub const CLOSE_RULE_LIQUIDITY_SPREAD_THRESHOLD: &str = "CLOSE_RULE_LIQUIDITY_SPREAD_THRESHOLD";
    pub const CLOSE_RULE_UNDERLYING_SPIKE_THRESHOLD: &str = "CLOSE_RULE_UNDERLYING_SPIKE_THRESHOLD";
    pub const CLOSE_RULE_LOW_VALUE_CLOSE_THRESHOLD: &str = "CLOSE_RULE_LOW_VALUE_CLOSE_THRESHOLD";
    pub const TIME_EXIT_DTE_THRESHOLD: &str = "TIME_EXIT_DTE_THRESHOLD";
    pub const TIME_EXIT_CUTOFF: &str = "TIME_EXIT_CUTOFF";
    pub const TRAIL_ARM_FRACTION: &str = "TRAIL_ARM_FRACTION";
    pub const TRAIL_GIVEBACK_FRACTION: &str = "TRAIL_GIVEBACK_FRACTION";
    pub const IV_CRUSH_RATIO: &str = "IV_CRUSH_RATIO";
    pub const IV_CRUSH_MIN_PNL_FRACTION: &str = "IV_CRUSH_MIN_PNL_FRACTION";

    // Observability & audit (written, not read, by the engine).
    pub const LAST_TRADE_CYCLE_HEARTBEAT: &str = "LAST_TRADE_CYCLE_HEARTBEAT";
    pub const LAST_PROPOSAL_RUN: &str = "LAST_PROPOSAL_RUN";
    pub const LAST_TRADE_CYCLE_ERROR: &str = "LAST_TRADE_CYCLE_ERROR";
}

// ---------------------------------------------------------------------------
// Close-rule thresholds
// ---------------------------------------------------------------------------

/// Thresholds for the ordered close rules. Profit-target and stop-loss carry
/// separate defaults per spread style; a stored override applies to both.
#[derive(Debug, Clone)]
pub struct CloseRuleConfig {
    pub profit_target_credit: f64,
    pub profit_target_debit: f64,
    pub stop_loss_credit: f64,
    pub stop_loss_debit: f64,
    /// Per-leg (ask - bid) cap in dollars.
    pub liquidity_spread_threshold: f64,
    /// |underlying change over 15 s| that forces an emergency exit.
    pub underlying_spike_threshold: f64,
    /// Credit-only: close when the spread mark decays to this.
    pub low_value_close_threshold: f64,
    pub time_exit_dte: i64,
    pub time_exit_cutoff: NaiveTime,
    pub trail_arm_fraction: f64,
    pub trail_giveback_fraction: f64,
    pub iv_crush_ratio: f64,
    pub iv_crush_min_pnl_fraction: f64,
}

impl Default for CloseRuleConfig {
    fn default() -> Self {
        Self {
            profit_target_credit: 0.50,
            profit_target_debit: 0.60,
            stop_loss_credit: 0.10,
            stop_loss_debit: 0.50,
            liquidity_spread_threshold: 0.60,
            underlying_spike_threshold: 0.005,
            low_value_close_threshold: 0.05,
            time_exit_dte: 1,
            time_exit_cutoff: NaiveTime::from_hms_opt(15, 50, 0).expect("static time"),
            trail_arm_fraction: 0.40,
            trail_giveback_fraction: 0.10,
            iv_crush_ratio: 0.70,
            iv_crush_min_pnl_fraction: 0.10,
        }
    }
}

impl CloseRuleConfig {
    pub fn profit_target(&self, is_credit: bool) -> f64 {
        if is_credit {
            self.profit_target_credit
        } else {
            self.profit_target_debit
        }
    }

    pub fn stop_loss(&self, is_credit: bool) -> f64 {
        if is_credit {
            self.stop_loss_credit
        } else {
            self.stop_loss_debit
        }
    }
}

// ---------------------------------------------------------------------------
// Proposal-pipeline thresholds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PipelineThresholds {
    /// Composite score floor on the 0..1 scale.
    pub min_score: f64,
    /// Minimum credit/width for credit spreads.
    pub min_credit_fraction: f64,
    pub min_dte: i64,
    pub max_dte: i64,
    /// How many expirations to examine per symbol.
    pub max_expirations: usize,
}

impl Default for PipelineThresholds {
    fn default() -> Self {
        Self {
            min_score: 0.65,
            min_credit_fraction: 0.18,
            min_dte: 7,
            max_dte: 45,
            max_expirations: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine config
// ---------------------------------------------------------------------------

/// Fully resolved engine configuration, re-read at the top of every tick.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub mode: TradingMode,
    pub max_open_positions: i64,
    /// None means "no restriction beyond the mode defaults".
    pub underlying_whitelist: Option<Vec<String>>,
    pub strategy_whitelist: Option<Vec<Strategy>>,
    pub default_quantity: i64,
    /// Daily realized-loss limit in dollars; breaching it sets HARD_STOP.
    pub daily_loss_limit: f64,
    pub thresholds: PipelineThresholds,
    pub close_rules: CloseRuleConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: TradingMode::DryRun,
            max_open_positions: 3,
            underlying_whitelist: None,
            strategy_whitelist: None,
            default_quantity: 1,
            daily_loss_limit: 500.0,
            thresholds: PipelineThresholds::default(),
            close_rules: CloseRuleConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Symbols eligible in this mode before whitelist intersection.
    pub fn mode_default_symbols(&self) -> Vec<String> {
        vec!["SPY".to_string(), "QQQ".to_string(), "IWM".to_string()]
    }

    /// Mode defaults intersected with the optional underlying whitelist.
    pub fn eligible_symbols(&self) -> Vec<String> {
        let defaults = self.mode_default_symbols();
        match &self.underlying_whitelist {
            Some(allow) if !allow.is_empty() => defaults
                .into_iter()
                .filter(|s| allow.iter().any(|w| w.eq_ignore_ascii_case(s)))
                .collect(),
            _ => defaults,
        }
    }

    /// Strategies enabled in this mode, intersected with the whitelist.
    pub fn enabled_strategies(&self) -> Vec<Strategy> {
        let defaults: Vec<Strategy> = Strategy::ALL.to_vec();
        match &self.strategy_whitelist {
            Some(allow) if !allow.is_empty() => {
                defaults.into_iter().filter(|s| allow.contains(s)).collect()
            }
            _ => defaults,
        }
    }

    /// Read and type every setting, applying defaults for missing or
    /// malformed values.
    pub async fn resolve(store: &Store) -> Result<Self> {
        let defaults = Self::default();

        let mode = match store.get_setting(keys::TRADING_MODE).await? {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                warn!(error = %e, "bad TRADING_MODE setting, falling back to DRY_RUN");
                TradingMode::DryRun
            }),
            None => TradingMode::DryRun,
        };

        let underlying_whitelist = store
            .get_setting(keys::UNDERLYING_WHITELIST)
            .await?
            .map(|raw| parse_csv(&raw))
            .filter(|v| !v.is_empty());

        let strategy_whitelist = store
            .get_setting(keys::STRATEGY_WHITELIST)
            .await?
            .map(|raw| {
                parse_csv(&raw)
                    .iter()
                    .filter_map(|s| s.parse::<Strategy>().ok())
                    .collect::<Vec<_>>()
            })
            .filter(|v| !v.is_empty());

        let thresholds = PipelineThresholds {
            min_score: normalize_score(
                store
                    .get_setting_f64(keys::MIN_SCORE)
                    .await?
                    .unwrap_or(defaults.thresholds.min_score),
            ),
            min_credit_fraction: store
                .get_setting_f64(keys::MIN_CREDIT_FRACTION)
                .await?
                .unwrap_or(defaults.thresholds.min_credit_fraction),
            min_dte: store
                .get_setting_i64(keys::MIN_DTE)
                .await?
                .unwrap_or(defaults.thresholds.min_dte),
            max_dte: store
                .get_setting_i64(keys::MAX_DTE)
                .await?
                .unwrap_or(defaults.thresholds.max_dte),
            max_expirations: defaults.thresholds.max_expirations,
        };

        let close_rules = Self::resolve_close_rules(store, &defaults.close_rules).await?;

        Ok(Self {
            mode,
            max_open_positions: store
                .get_setting_i64(keys::MAX_OPEN_POSITIONS)
                .await?
                .unwrap_or(defaults.max_open_positions),
            underlying_whitelist,
            strategy_whitelist,
            default_quantity: store
                .get_setting_i64(keys::DEFAULT_TRADE_QUANTITY)
                .await?
                .unwrap_or(defaults.default_quantity)
                .max(1),
            daily_loss_limit: store
                .get_setting_f64(keys::DAILY_LOSS_LIMIT)
                .await?
                .unwrap_or(defaults.daily_loss_limit),
            thresholds,
            close_rules,
        })
    }

    async fn resolve_close_rules(store: &Store, defaults: &CloseRuleConfig) -> Result<CloseRuleConfig> {
        let mut rules = defaults.clone();

        if let Some(target) = store
            .get_setting_f64(keys::CLOSE_RULE_PROFIT_TARGET_FRACTION)
            .await?
        {
            if target > 0.0 {
                rules.profit_target_credit = target;
                rules.profit_target_debit = target;
            }
        }

        // Legacy configs stored negative stop-loss fractions; those are
        // ignored and the per-style defaults stand.
        if let Some(stop) = store.get_setting_f64(keys::CLOSE_RULE_STOP_LOSS_FRACTION).await? {
            if stop > 0.0 {
                rules.stop_loss_credit = stop;
                rules.stop_loss_debit = stop;
            } else {
                warn!(stop, "ignoring non-positive stop-loss override");
            }
        }

        if let Some(v) = store
            .get_setting_f64(keys::CLOSE_RULE_LIQUIDITY_SPREAD_THRESHOLD)
            .await?
        {
            rules.liquidity_spread_threshold = v;
        }
        if let Some(v) = store
            .get_setting_f64(keys::CLOSE_RULE_UNDERLYING_SPIKE_THRESHOLD)
            .await?
        {
            rules.underlying_spike_threshold = v;
        }
        if let Some(v) = store
            .get_setting_f64(keys::CLOSE_RULE_LOW_VALUE_CLOSE_THRESHOLD)
            .await?
        {
            rules.low_value_close_threshold = v;
        }
        if let Some(v) = store.get_setting_i64(keys::TIME_EXIT_DTE_THRESHOLD).await? {
            rules.time_exit_dte = v;
        }
        if let Some(raw) = store.get_setting(keys::TIME_EXIT_CUTOFF).await? {
            match NaiveTime::parse_from_str(raw.trim(), "%H:%M") {
                Ok(t) => rules.time_exit_cutoff = t,
                Err(_) => warn!(raw, "bad TIME_EXIT_CUTOFF setting, keeping default"),
            }
        }
        if let Some(v) = store.get_setting_f64(keys::TRAIL_ARM_FRACTION).await? {
            rules.trail_arm_fraction = v;
        }
        if let Some(v) = store.get_setting_f64(keys::TRAIL_GIVEBACK_FRACTION).await? {
            rules.trail_giveback_fraction = v;
        }
        if let Some(v) = store.get_setting_f64(keys::IV_CRUSH_RATIO).await? {
            rules.iv_crush_ratio = v;
        }
        if let Some(v) = store.get_setting_f64(keys::IV_CRUSH_MIN_PNL_FRACTION).await? {
            rules.iv_crush_min_pnl_fraction = v;
        }

        Ok(rules)
    }
}

/// Accept scores on either the 0..1 or the 0..100 scale.
pub fn normalize_score(raw: f64) -> f64 {
    if raw > 1.0 {
        raw / 100.0
    } else {
        raw
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_with_empty_store_gives_defaults() {
        let store = Store::open_in_memory().await.unwrap();
        let cfg = EngineConfig::resolve(&store).await.unwrap();

        assert_eq!(cfg.mode, TradingMode::DryRun);
        assert_eq!(cfg.max_open_positions, 3);
        assert_eq!(cfg.default_quantity, 1);
        assert!((cfg.thresholds.min_score - 0.65).abs() < 1e-9);
        assert!((cfg.close_rules.profit_target_credit - 0.50).abs() < 1e-9);
        assert!((cfg.close_rules.profit_target_debit - 0.60).abs() < 1e-9);
        assert!((cfg.close_rules.stop_loss_credit - 0.10).abs() < 1e-9);
        assert!((cfg.close_rules.stop_loss_debit - 0.50).abs() < 1e-9);
    }

    #[tokio::test]
    async fn min_score_normalizes_percent_scale() {
        let store = Store::open_in_memory().await.unwrap();
        store.set_setting(keys::MIN_SCORE, "65").await.unwrap();
        let cfg = EngineConfig::resolve(&store).await.unwrap();
        assert!((cfg.thresholds.min_score - 0.65).abs() < 1e-9);

        store.set_setting(keys::MIN_SCORE, "0.72").await.unwrap();
        let cfg = EngineConfig::resolve(&store).await.unwrap();
        assert!((cfg.thresholds.min_score - 0.72).abs() < 1e-9);
    }

    #[tokio::test]
    async fn negative_stop_loss_override_is_ignored() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .set_setting(keys::CLOSE_RULE_STOP_LOSS_FRACTION, "-0.25")
            .await
            .unwrap();
        let cfg = EngineConfig::resolve(&store).await.unwrap();
        assert!((cfg.close_rules.stop_loss_credit - 0.10).abs() < 1e-9);
        assert!((cfg.close_rules.stop_loss_debit - 0.50).abs() < 1e-9);
    }

    #[tokio::test]
    async fn whitelists_intersect_mode_defaults() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .set_setting(keys::UNDERLYING_WHITELIST, "spy, tsla")
            .await
            .unwrap();
        store
            .set_setting(keys::STRATEGY_WHITELIST, "BULL_PUT_CREDIT,BOGUS")
            .await
            .unwrap();

        let cfg = EngineConfig::resolve(&store).await.unwrap();
        assert_eq!(cfg.eligible_symbols(), vec!["SPY".to_string()]);
        assert_eq!(cfg.enabled_strategies(), vec![Strategy::BullPutCredit]);
    }

    #[tokio::test]
    async fn no_whitelist_means_all_defaults() {
        let store = Store::open_in_memory().await.unwrap();
        let cfg = EngineConfig::resolve(&store).await.unwrap();
        assert_eq!(cfg.eligible_symbols().len(), 3);
        assert_eq!(cfg.enabled_strategies().len(), 4);
    }

    #[tokio::test]
    async fn cutoff_time_parses() {
        let store = Store::open_in_memory().await.unwrap();
        store.set_setting(keys::TIME_EXIT_CUTOFF, "15:45").await.unwrap();
        let cfg = EngineConfig::resolve(&store).await.unwrap();
        assert_eq!(
            cfg.close_rules.time_exit_cutoff,
            NaiveTime::from_hms_opt(15, 45, 0).unwrap()
        );
    }

    #[test]
    fn per_style_accessors() {
        let rules = CloseRuleConfig::default();
        assert!((rules.profit_target(true) - 0.50).abs() < 1e-9);
        assert!((rules.profit_target(false) - 0.60).abs() < 1e-9);
        assert!((rules.stop_loss(true) - 0.10).abs() < 1e-9);
        assert!((rules.stop_loss(false) - 0.50).abs() < 1e-9);
    }
}
