use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;

use crate::error::{ConfigError, EngineError};

/// Ten years. Longer windows are configuration mistakes and would overflow
/// `chrono::Duration`.
pub const MAX_WINDOW_MINUTES: i64 = 525_600 * 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub system: SystemConfig,
    pub strategy: StrategyConfig,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SystemConfig {
    pub database_path: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            database_path: "data/engine.db".to_string(),
        }
    }
}

/// Probability model and opportunity thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StrategyConfig {
    pub min_edge_threshold: f64,
    pub max_entry_price: f64,
    pub min_exit_price: f64,
    /// Sigma for a same-day forecast, in the forecast's native unit.
    pub sigma_base: f64,
    /// Sigma added per whole day until the target date.
    pub sigma_per_day: f64,
    pub forecast_max_age_minutes: i64,
    pub fee_estimate: f64,
    pub slippage_estimate: f64,
    /// Hard cap on the proposed stake for a single entry.
    pub stake_usd: f64,
    pub bankroll_usd: f64,
    pub kelly_fraction: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            min_edge_threshold: 0.05,
            max_entry_price: 0.15,
            min_exit_price: 0.45,
            sigma_base: 2.5,
            sigma_per_day: 0.5,
            forecast_max_age_minutes: 360,
            fee_estimate: 0.02,
            slippage_estimate: 0.01,
            stake_usd: 5.0,
            bankroll_usd: 100.0,
            kelly_fraction: 0.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RiskConfig {
    pub max_position_size_usd: f64,
    pub max_trades_per_run: u32,
    pub max_total_exposure_usd: f64,
    pub max_per_city_exposure_usd: f64,
    pub max_daily_loss_usd: f64,
    pub cooldown_minutes: i64,
    pub min_hours_to_resolution: f64,
    pub slippage_ceiling: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_size_usd: 5.0,
            max_trades_per_run: 3,
            max_total_exposure_usd: 25.0,
            max_per_city_exposure_usd: 10.0,
            max_daily_loss_usd: 10.0,
            cooldown_minutes: 30,
            min_hours_to_resolution: 6.0,
            slippage_ceiling: 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    DryRun,
    Live,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::DryRun => "DRY_RUN",
            ExecutionMode::Live => "LIVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DRY_RUN" => Some(ExecutionMode::DryRun),
            "LIVE" => Some(ExecutionMode::Live),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionConfig {
    pub mode: ExecutionMode,
    /// Upper bound on a single live venue call.
    pub timeout_secs: u64,
    pub venue: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::DryRun,
            timeout_secs: 30,
            venue: "simmer".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitoringConfig {
    pub csv_logging: bool,
    pub csv_log_path: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            csv_logging: false,
            csv_log_path: "data/orders.csv".to_string(),
        }
    }
}

/// Secrets and endpoints read from the environment.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub simmer_api_key: Option<String>,
    pub simmer_api_url: String,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        Self::from_toml_str(&contents)
            .with_context(|| format!("Invalid config file: {}", path))
    }

    /// Parse and validate. Unknown keys are rejected by the parser.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let s = &self.strategy;
        unit_interval("strategy.min_edge_threshold", s.min_edge_threshold)?;
        unit_interval("strategy.max_entry_price", s.max_entry_price)?;
        unit_interval("strategy.min_exit_price", s.min_exit_price)?;
        unit_interval("strategy.fee_estimate", s.fee_estimate)?;
        unit_interval("strategy.slippage_estimate", s.slippage_estimate)?;
        unit_interval("strategy.kelly_fraction", s.kelly_fraction)?;
        positive("strategy.sigma_base", s.sigma_base)?;
        positive("strategy.sigma_per_day", s.sigma_per_day)?;
        minutes("strategy.forecast_max_age_minutes", s.forecast_max_age_minutes, 1)?;
        positive("strategy.stake_usd", s.stake_usd)?;
        positive("strategy.bankroll_usd", s.bankroll_usd)?;

        let r = &self.risk;
        positive("risk.max_position_size_usd", r.max_position_size_usd)?;
        positive("risk.max_trades_per_run", r.max_trades_per_run as f64)?;
        positive("risk.max_total_exposure_usd", r.max_total_exposure_usd)?;
        positive("risk.max_per_city_exposure_usd", r.max_per_city_exposure_usd)?;
        positive("risk.max_daily_loss_usd", r.max_daily_loss_usd)?;
        minutes("risk.cooldown_minutes", r.cooldown_minutes, 0)?;
        non_negative("risk.min_hours_to_resolution", r.min_hours_to_resolution)?;
        unit_interval("risk.slippage_ceiling", r.slippage_ceiling)?;

        positive("execution.timeout_secs", self.execution.timeout_secs as f64)?;
        Ok(())
    }

    /// Deterministic short hash of the effective configuration, stored with
    /// every run so a decision can be tied to the limits that produced it.
    pub fn fingerprint(&self) -> std::result::Result<String, EngineError> {
        let canonical = serde_json::to_string(self)?;
        let digest = Sha256::digest(canonical.as_bytes());
        Ok(hex::encode(digest)[..16].to_string())
    }
}

fn unit_interval(field: &'static str, value: f64) -> std::result::Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::OutOfRange {
            field,
            min: 0.0,
            max: 1.0,
            value,
        });
    }
    Ok(())
}

fn positive(field: &'static str, value: f64) -> std::result::Result<(), ConfigError> {
    if !(value > 0.0 && value.is_finite()) {
        return Err(ConfigError::NotPositive { field, value });
    }
    Ok(())
}

fn minutes(field: &'static str, value: i64, min: i64) -> std::result::Result<(), ConfigError> {
    if !(min..=MAX_WINDOW_MINUTES).contains(&value) {
        return Err(ConfigError::OutOfRange {
            field,
            min: min as f64,
            max: MAX_WINDOW_MINUTES as f64,
            value: value as f64,
        });
    }
    Ok(())
}

fn non_negative(field: &'static str, value: f64) -> std::result::Result<(), ConfigError> {
    if !(value >= 0.0 && value.is_finite()) {
        return Err(ConfigError::OutOfRange {
            field,
            min: 0.0,
            max: f64::INFINITY,
            value,
        });
    }
    Ok(())
}

impl EnvConfig {
    pub fn load() -> Self {
        dotenv::dotenv().ok();

        Self {
            simmer_api_key: std::env::var("SIMMER_API_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            simmer_api_url: std::env::var("SIMMER_API_URL")
                .unwrap_or_else(|_| "https://api.simmer.markets".to_string()),
        }
    }

    pub fn require_api_key(&self) -> std::result::Result<&str, ConfigError> {
        self.simmer_api_key
            .as_deref()
            .ok_or(ConfigError::MissingSecret("SIMMER_API_KEY"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.execution.mode, ExecutionMode::DryRun);
        assert_eq!(config.risk.max_trades_per_run, 3);
    }

    #[test]
    fn test_partial_section_overrides() {
        let config = Config::from_toml_str(
            r#"
            [risk]
            max_total_exposure_usd = 40.0

            [execution]
            mode = "live"
            "#,
        )
        .unwrap();

        assert_eq!(config.risk.max_total_exposure_usd, 40.0);
        assert_eq!(config.risk.max_position_size_usd, 5.0);
        assert_eq!(config.execution.mode, ExecutionMode::Live);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let err = Config::from_toml_str(
            r#"
            [risk]
            max_total_exposure = 40.0
            "#,
        );
        assert!(err.is_err());

        let err = Config::from_toml_str("[alerts]\nenabled = true\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_validation_rejects_out_of_range() {
        let mut config = Config::default();
        config.risk.slippage_ceiling = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { field: "risk.slippage_ceiling", .. })
        ));

        let mut config = Config::default();
        config.strategy.sigma_base = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotPositive { field: "strategy.sigma_base", .. })
        ));
    }

    #[test]
    fn test_validation_rejects_oversized_windows() {
        let err = Config::from_toml_str("[strategy]\nforecast_max_age_minutes = 9223372036854775807\n");
        assert!(err.is_err());

        let mut config = Config::default();
        config.strategy.forecast_max_age_minutes = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { field: "strategy.forecast_max_age_minutes", .. })
        ));

        let mut config = Config::default();
        config.risk.cooldown_minutes = MAX_WINDOW_MINUTES + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { field: "risk.cooldown_minutes", .. })
        ));

        config.risk.cooldown_minutes = MAX_WINDOW_MINUTES;
        assert!(config.validate().is_ok());
        config.risk.cooldown_minutes = -1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fingerprint_is_stable_and_sensitive() {
        let a = Config::default();
        let b = Config::default();
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
        assert_eq!(a.fingerprint().unwrap().len(), 16);

        let mut c = Config::default();
        c.risk.cooldown_minutes = 45;
        assert_ne!(a.fingerprint().unwrap(), c.fingerprint().unwrap());
    }
}
