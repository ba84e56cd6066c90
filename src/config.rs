use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::error::ConfigError;
use crate::execution::backoff::BackoffPolicy;
use crate::execution::risk::RiskLimits;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub system: SystemConfig,
    pub strategy: StrategyConfig,
    pub risk: RiskLimits,
    #[serde(default)]
    pub execution: ExecutionConfig,
    pub trading_loop: TradingLoopConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub paper_trading: PaperTradingConfig,
    #[serde(default)]
    pub weather: WeatherConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    pub dry_run: bool,
    pub database_path: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    /// Minimum |edge| (probability units) before a side is recommended.
    pub min_edge: f64,
    /// Bid/ask spreads wider than this force a no-trade.
    pub max_spread: f64,
    #[serde(default = "default_staleness")]
    pub max_staleness_secs: u64,
    #[serde(default = "default_kelly_fraction")]
    pub kelly_fraction: f64,
    #[serde(default = "default_volatility_reference")]
    pub volatility_reference: f64,
    pub bankroll_usd: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingLoopConfig {
    pub markets: Vec<String>,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default)]
    pub max_cycles: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    pub csv_logging: bool,
    pub csv_log_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaperTradingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_fill_rate")]
    pub fill_rate: f64,
    #[serde(default = "default_partial_fill_rate")]
    pub partial_fill_rate: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_initial_balance")]
    pub initial_balance_usd: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeatherConfig {
    #[serde(default = "default_forecast_ttl")]
    pub forecast_cache_ttl_secs: u64,
    #[serde(default = "default_std_dev_f")]
    pub forecast_std_dev_f: f64,
}

fn default_log_level() -> String { "info".to_string() }
fn default_staleness() -> u64 { 300 }
fn default_kelly_fraction() -> f64 { 0.25 }
fn default_volatility_reference() -> f64 { 0.10 }
fn default_base_delay_ms() -> u64 { 500 }
fn default_max_delay_ms() -> u64 { 8_000 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_max_attempts() -> u32 { 3 }
fn default_interval() -> u64 { 300 }
fn default_fill_rate() -> f64 { 0.70 }
fn default_partial_fill_rate() -> f64 { 0.10 }
fn default_seed() -> u64 { 7 }
fn default_initial_balance() -> f64 { 2_000.0 }
fn default_forecast_ttl() -> u64 { 300 }
fn default_std_dev_f() -> f64 { 4.5 }

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            csv_logging: false,
            csv_log_path: "cycles.csv".to_string(),
        }
    }
}

impl Default for PaperTradingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            fill_rate: default_fill_rate(),
            partial_fill_rate: default_partial_fill_rate(),
            seed: default_seed(),
            initial_balance_usd: default_initial_balance(),
        }
    }
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            forecast_cache_ttl_secs: default_forecast_ttl(),
            forecast_std_dev_f: default_std_dev_f(),
        }
    }
}

impl StrategyConfig {
    pub fn max_staleness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_staleness_secs as i64)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        unit_range("strategy.min_edge", self.min_edge)?;
        unit_range("strategy.max_spread", self.max_spread)?;
        unit_range("strategy.kelly_fraction", self.kelly_fraction)?;
        if self.volatility_reference <= 0.0 {
            return Err(ConfigError::Zero { field: "strategy.volatility_reference" });
        }
        if self.bankroll_usd < 0.0 {
            return Err(ConfigError::Negative {
                field: "strategy.bankroll_usd",
                value: self.bankroll_usd,
            });
        }
        Ok(())
    }
}

impl ExecutionConfig {
    pub fn backoff_policy(&self) -> Result<BackoffPolicy, ConfigError> {
        BackoffPolicy::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.backoff_multiplier,
            self.max_attempts,
        )
    }
}

impl PaperTradingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        unit_range("paper_trading.fill_rate", self.fill_rate)?;
        unit_range("paper_trading.partial_fill_rate", self.partial_fill_rate)?;
        if self.fill_rate + self.partial_fill_rate > 1.0 {
            return Err(ConfigError::Invalid(format!(
                "paper_trading.fill_rate + partial_fill_rate must not exceed 1, got {:.2}",
                self.fill_rate + self.partial_fill_rate
            )));
        }
        Ok(())
    }
}

fn unit_range(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::OutOfUnitRange { field, value });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub kalshi_api_key: Option<String>,
    pub kalshi_private_key: Option<String>,
    pub kalshi_base_url: String,
    pub dry_run: bool,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        Self::from_toml(&contents).with_context(|| format!("Failed to parse config file: {}", path))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        Ok(config)
    }

    /// Reject misconfiguration before any cycle runs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.strategy.validate()?;
        self.risk.validate()?;
        self.execution.backoff_policy()?;
        self.paper_trading.validate()?;
        if self.trading_loop.markets.is_empty() {
            return Err(ConfigError::Invalid("trading_loop.markets must not be empty".to_string()));
        }
        if self.weather.forecast_std_dev_f <= 0.0 {
            return Err(ConfigError::Zero { field: "weather.forecast_std_dev_f" });
        }
        Ok(())
    }
}

impl EnvConfig {
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        Ok(Self {
            kalshi_api_key: std::env::var("KALSHI_API_KEY").ok(),
            kalshi_private_key: std::env::var("KALSHI_PRIVATE_KEY").ok(),
            kalshi_base_url: std::env::var("KALSHI_API_BASE_URL")
                .unwrap_or_else(|_| "https://demo-api.kalshi.co".to_string()),
            dry_run: std::env::var("DRY_RUN")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
        })
    }
}
