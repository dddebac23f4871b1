// =============================================================================
// Configuration — hot-reloadable engine settings with atomic save
// =============================================================================
//
// Every tunable lives here. Loading is strict: unknown keys are rejected, and
// `validate()` runs the cross-field checks (weight sums, cap ranges, cadence
// ordering) before a config may be installed. Persistence uses the atomic
// tmp + rename pattern so a crash mid-write can never corrupt the file.
// A rejected reload keeps the previous config active.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::analysts::RoutePolicy;
use crate::error::ConfigError;
use crate::feed::Timeframe;
use crate::memory::BanditKind;
use crate::scoring::ScorerWeights;

// =============================================================================
// Risk
// =============================================================================

/// What the daily drawdown limit measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawdownBasis {
    /// Realized P&L only.
    Realized,
    /// Realized plus unrealized (intraday mark-to-market).
    MarkToMarket,
}

/// Risk gate limits. All `_pct` fields are fractions (0.005 = 0.5 %).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RiskConfig {
    #[serde(default = "default_starting_equity")]
    pub starting_equity: Decimal,
    #[serde(default = "default_per_trade_risk_pct")]
    pub per_trade_risk_pct: f64,
    #[serde(default = "default_portfolio_risk_cap")]
    pub portfolio_risk_cap: f64,
    #[serde(default = "default_correlated_cap")]
    pub correlated_cap: f64,
    #[serde(default = "default_correlation_threshold")]
    pub correlation_threshold: f64,
    #[serde(default = "default_leverage_cap")]
    pub leverage_cap: f64,
    #[serde(default = "default_daily_loss_limit")]
    pub daily_loss_limit: f64,
    #[serde(default = "default_monthly_loss_limit")]
    pub monthly_loss_limit: f64,
    #[serde(default = "default_max_position_size_pct")]
    pub max_position_size_pct: f64,
    #[serde(default = "default_kelly_scale")]
    pub kelly_scale: f64,
    #[serde(default = "default_safe_mode_cooldown_secs")]
    pub safe_mode_cooldown_secs: u64,
    /// Whether SAFE_MODE force-closes open positions or only blocks entries.
    #[serde(default)]
    pub safe_mode_close_positions: bool,
    #[serde(default = "default_drawdown_basis")]
    pub drawdown_basis: DrawdownBasis,
}

fn default_starting_equity() -> Decimal {
    Decimal::new(100_000, 0)
}
fn default_per_trade_risk_pct() -> f64 {
    0.005
}
fn default_portfolio_risk_cap() -> f64 {
    0.15
}
fn default_correlated_cap() -> f64 {
    0.10
}
fn default_correlation_threshold() -> f64 {
    0.7
}
fn default_leverage_cap() -> f64 {
    3.0
}
fn default_daily_loss_limit() -> f64 {
    0.05
}
fn default_monthly_loss_limit() -> f64 {
    0.15
}
fn default_max_position_size_pct() -> f64 {
    0.25
}
fn default_kelly_scale() -> f64 {
    0.25
}
fn default_safe_mode_cooldown_secs() -> u64 {
    3600
}
fn default_drawdown_basis() -> DrawdownBasis {
    DrawdownBasis::MarkToMarket
}

impl Default for RiskConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

// =============================================================================
// Scorer
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScorerConfig {
    #[serde(default)]
    pub weights: ScorerWeights,
    #[serde(default = "default_entry_threshold")]
    pub entry_threshold: f64,
    #[serde(default = "default_min_calibrated_confidence")]
    pub min_calibrated_confidence: f64,
    #[serde(default = "default_min_risk_reward")]
    pub min_risk_reward: f64,
    #[serde(default = "default_stop_atr_multiplier")]
    pub stop_atr_multiplier: f64,
    #[serde(default = "default_signal_ttl_secs")]
    pub signal_ttl_secs: i64,
    #[serde(default = "default_timeframe_base_weights")]
    pub timeframe_base_weights: BTreeMap<Timeframe, f64>,
}

fn default_entry_threshold() -> f64 {
    55.0
}
fn default_min_calibrated_confidence() -> f64 {
    0.55
}
fn default_min_risk_reward() -> f64 {
    1.5
}
fn default_stop_atr_multiplier() -> f64 {
    2.0
}
fn default_signal_ttl_secs() -> i64 {
    3600
}
fn default_timeframe_base_weights() -> BTreeMap<Timeframe, f64> {
    let mut weights = BTreeMap::new();
    weights.insert(Timeframe::M15, 0.15);
    weights.insert(Timeframe::H1, 0.25);
    weights.insert(Timeframe::H4, 0.35);
    weights.insert(Timeframe::D1, 0.25);
    weights
}

impl Default for ScorerConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

// =============================================================================
// Router
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_circuit_failures")]
    pub failures: u32,
    #[serde(default = "default_circuit_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_circuit_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_circuit_cooldown_cap_secs")]
    pub cooldown_cap_secs: u64,
}

fn default_circuit_failures() -> u32 {
    3
}
fn default_circuit_window_secs() -> u64 {
    60
}
fn default_circuit_cooldown_secs() -> u64 {
    30
}
fn default_circuit_cooldown_cap_secs() -> u64 {
    300
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterConfig {
    #[serde(default)]
    pub policy: RoutePolicy,
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,
    #[serde(default = "default_sla_p95_ms")]
    pub sla_p95_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_consensus_size")]
    pub consensus_size: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default)]
    pub circuit: CircuitBreakerConfig,
}

fn default_min_success_rate() -> f64 {
    0.6
}
fn default_sla_p95_ms() -> u64 {
    3000
}
fn default_call_timeout_ms() -> u64 {
    3000
}
fn default_consensus_size() -> usize {
    3
}
fn default_cache_ttl_secs() -> u64 {
    60
}

impl Default for RouterConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Fastest cadence the adaptive scheduler may choose.
    #[serde(default = "default_cadence_min_secs")]
    pub cadence_min_secs: u64,
    /// Slowest cadence the adaptive scheduler may choose.
    #[serde(default = "default_cadence_max_secs")]
    pub cadence_max_secs: u64,
    /// ATR percentile below which cadence slows.
    #[serde(default = "default_volatility_low")]
    pub volatility_low_percentile: f64,
    /// ATR percentile above which cadence speeds up.
    #[serde(default = "default_volatility_high")]
    pub volatility_high_percentile: f64,
    /// Maximum concurrent per-symbol pipelines.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_config_reload_interval_secs")]
    pub config_reload_interval_secs: u64,
    /// Total deadline for one symbol tick, analyst calls included.
    #[serde(default = "default_tick_deadline_ms")]
    pub tick_deadline_ms: u64,
    /// Feed gaps beyond this many bars mark the symbol degraded.
    #[serde(default = "default_max_gap_bars")]
    pub max_gap_bars: u32,
    #[serde(default = "default_bandit_kind")]
    pub bandit: BanditKind,
    #[serde(default = "default_bandit_epsilon")]
    pub bandit_epsilon: f64,
    /// Seconds between learning-memory weight recalibrations.
    #[serde(default = "default_recalibrate_secs")]
    pub recalibrate_interval_secs: u64,
}

fn default_cadence_min_secs() -> u64 {
    15 * 60
}
fn default_cadence_max_secs() -> u64 {
    4 * 60 * 60
}
fn default_volatility_low() -> f64 {
    25.0
}
fn default_volatility_high() -> f64 {
    75.0
}
fn default_concurrency() -> usize {
    4
}
fn default_config_reload_interval_secs() -> u64 {
    30
}
fn default_tick_deadline_ms() -> u64 {
    10_000
}
fn default_max_gap_bars() -> u32 {
    5
}
fn default_bandit_kind() -> BanditKind {
    BanditKind::Ucb1
}
fn default_bandit_epsilon() -> f64 {
    0.1
}
fn default_recalibrate_secs() -> u64 {
    24 * 60 * 60
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

// =============================================================================
// Instruments
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstrumentConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_instrument_timeframes")]
    pub timeframes: Vec<Timeframe>,
    pub tick: Decimal,
    pub step: Decimal,
    #[serde(default)]
    pub correlation_group: Option<String>,
}

fn default_true() -> bool {
    true
}
fn default_instrument_timeframes() -> Vec<Timeframe> {
    vec![Timeframe::M15, Timeframe::H1, Timeframe::H4, Timeframe::D1]
}

// =============================================================================
// Top-level config
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub scorer: ScorerConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub instruments: BTreeMap<String, InstrumentConfig>,
}

impl Config {
    /// Load and fully validate. A file that parses but fails validation is
    /// rejected as a whole.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config in {}", path.display()))?;

        info!(
            path = %path.display(),
            instruments = config.instruments.len(),
            policy = ?config.router.policy,
            "config loaded"
        );
        Ok(config)
    }

    /// Persist atomically (tmp + rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    /// Cross-field validation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scorer.weights.validate()?;

        let tf_sum: f64 = self.scorer.timeframe_base_weights.values().sum();
        if (tf_sum - 1.0).abs() > 1e-6 {
            return Err(ConfigError::WeightSum { sum: tf_sum });
        }

        for (field, value, lo, hi) in [
            ("risk.per_trade_risk_pct", self.risk.per_trade_risk_pct, 0.0, 0.1),
            ("risk.portfolio_risk_cap", self.risk.portfolio_risk_cap, 0.0, 1.0),
            ("risk.correlated_cap", self.risk.correlated_cap, 0.0, 1.0),
            ("risk.correlation_threshold", self.risk.correlation_threshold, 0.0, 1.0),
            ("risk.daily_loss_limit", self.risk.daily_loss_limit, 0.0, 1.0),
            ("risk.monthly_loss_limit", self.risk.monthly_loss_limit, 0.0, 1.0),
            ("risk.max_position_size_pct", self.risk.max_position_size_pct, 0.0, 1.0),
            ("risk.kelly_scale", self.risk.kelly_scale, 0.0, 1.0),
            ("router.min_success_rate", self.router.min_success_rate, 0.0, 1.0),
            ("orchestrator.bandit_epsilon", self.orchestrator.bandit_epsilon, 0.0, 1.0),
        ] {
            if !(value > lo && value <= hi) {
                return Err(ConfigError::InvalidValue {
                    field: "config",
                    reason: format!("{field} = {value} outside ({lo}, {hi}]"),
                });
            }
        }

        if self.risk.leverage_cap < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "risk.leverage_cap",
                reason: format!("{} < 1.0", self.risk.leverage_cap),
            });
        }
        if self.risk.starting_equity <= Decimal::ZERO {
            return Err(ConfigError::InvalidValue {
                field: "risk.starting_equity",
                reason: "must be positive".into(),
            });
        }
        if self.orchestrator.cadence_min_secs > self.orchestrator.cadence_max_secs {
            return Err(ConfigError::InvalidValue {
                field: "orchestrator.cadence_min_secs",
                reason: "cadence_min_secs exceeds cadence_max_secs".into(),
            });
        }
        if self.orchestrator.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "orchestrator.concurrency",
                reason: "must be at least 1".into(),
            });
        }
        if self.scorer.min_risk_reward < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "scorer.min_risk_reward",
                reason: format!("{} < 1.0", self.scorer.min_risk_reward),
            });
        }

        for (symbol, instrument) in &self.instruments {
            if instrument.tick <= Decimal::ZERO || instrument.step <= Decimal::ZERO {
                return Err(ConfigError::InvalidValue {
                    field: "instruments",
                    reason: format!("{symbol}: tick and step must be positive"),
                });
            }
            if instrument.timeframes.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "instruments",
                    reason: format!("{symbol}: at least one timeframe required"),
                });
            }
        }

        Ok(())
    }

    /// Symbols enabled for trading.
    pub fn enabled_symbols(&self) -> Vec<String> {
        self.instruments
            .iter()
            .filter(|(_, i)| i.enabled)
            .map(|(s, _)| s.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn with_instrument() -> Config {
        let mut config = Config::default();
        config.instruments.insert(
            "BTCUSD".into(),
            InstrumentConfig {
                enabled: true,
                timeframes: default_instrument_timeframes(),
                tick: dec!(0.5),
                step: dec!(0.001),
                correlation_group: Some("majors".into()),
            },
        );
        config
    }

    #[test]
    fn defaults_validate() {
        assert!(Config::default().validate().is_ok());
        assert!(with_instrument().validate().is_ok());
    }

    #[test]
    fn empty_json_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.risk.per_trade_risk_pct, 0.005);
        assert_eq!(config.risk.daily_loss_limit, 0.05);
        assert_eq!(config.router.policy, RoutePolicy::AccuracyFirst);
        assert_eq!(config.orchestrator.concurrency, 4);
        assert!(!config.risk.safe_mode_close_positions);
        assert_eq!(config.risk.drawdown_basis, DrawdownBasis::MarkToMarket);
    }

    #[test]
    fn unknown_keys_rejected() {
        let json = r#"{ "risk": { "per_trade_risk_pct": 0.01, "mystery_knob": 3 } }"#;
        assert!(serde_json::from_str::<Config>(json).is_err());
        let json = r#"{ "surprise_section": {} }"#;
        assert!(serde_json::from_str::<Config>(json).is_err());
    }

    #[test]
    fn bad_scorer_weight_sum_rejected() {
        let mut config = with_instrument();
        config.scorer.weights.trend = 0.24; // sum 0.99
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::WeightSum { .. }));
    }

    #[test]
    fn bad_timeframe_weight_sum_rejected() {
        let mut config = with_instrument();
        config
            .scorer
            .timeframe_base_weights
            .insert(Timeframe::M15, 0.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn nonpositive_tick_rejected() {
        let mut config = with_instrument();
        config.instruments.get_mut("BTCUSD").unwrap().tick = dec!(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_cadence_bounds_rejected() {
        let mut config = with_instrument();
        config.orchestrator.cadence_min_secs = 7200;
        config.orchestrator.cadence_max_secs = 900;
        assert!(config.validate().is_err());
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!("meridian-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");

        let config = with_instrument();
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.instruments.len(), 1);
        assert_eq!(loaded.risk.per_trade_risk_pct, config.risk.per_trade_risk_pct);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn invalid_file_rejected_on_load() {
        let dir = std::env::temp_dir().join(format!("meridian-config-bad-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        // Weight sum 0.99 parses but fails validation.
        std::fs::write(
            &path,
            r#"{ "scorer": { "weights": { "trend": 0.24, "momentum": 0.20, "volatility": 0.10, "volume": 0.10, "pattern": 0.20, "analyst": 0.15 } } }"#,
        )
        .unwrap();
        assert!(Config::load(&path).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn enabled_symbols_filters_disabled() {
        let mut config = with_instrument();
        config.instruments.insert(
            "ETHUSD".into(),
            InstrumentConfig {
                enabled: false,
                timeframes: default_instrument_timeframes(),
                tick: dec!(0.05),
                step: dec!(0.01),
                correlation_group: Some("majors".into()),
            },
        );
        assert_eq!(config.enabled_symbols(), vec!["BTCUSD".to_string()]);
    }
}
