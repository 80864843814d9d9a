use config::{Config, File, FileFormat};
pub use config::ConfigError;
use serde::Deserialize;

use crate::grid::config::{EngineConfig, StrategyParams};
use crate::grid::paper::DEFAULT_FEE_RATE;

/// Main configuration struct
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Strategy definition (grid bounds, margin, tiers)
    pub strategy: StrategyParams,
    /// Reconciler and runner tuning
    #[serde(default)]
    pub runner: EngineConfig,
    /// Persistence
    #[serde(default)]
    pub store: StoreConfig,
    /// Paper exchange and price replay
    #[serde(default)]
    pub paper: PaperConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Default)]
pub struct StoreConfig {
    /// JSON state file; in-memory only when unset
    #[serde(default)]
    pub state_file: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PaperConfig {
    /// File with one mid price per line
    #[serde(default)]
    pub replay_file: Option<String>,
    /// Delay between replayed ticks (milliseconds)
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    /// Fee charged on every simulated fill
    #[serde(default = "default_fee_rate")]
    pub fee_rate: f64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            replay_file: None,
            tick_interval_ms: default_tick_interval(),
            fee_rate: default_fee_rate(),
        }
    }
}

fn default_tick_interval() -> u64 {
    1000
}

fn default_fee_rate() -> f64 {
    DEFAULT_FEE_RATE
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Settings {
    /// Load settings from a configuration file
    pub fn new(config_path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(config_path))
            // Environment variables override the file
            // e.g. APP_RUNNER__BUY_ORDER_LIMIT=4
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        s.try_deserialize()
    }

    /// Parse settings from TOML text, without environment overrides
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [strategy]
        id = 1
        asset = "ETH"
        min_price = 3000.0
        max_price = 5000.0
        line_count = 6
        margin = 1000.0

        [[strategy.tiers]]
        level_start = 3000.0
        level_end = 4000.0
        size = 30.0

        [[strategy.tiers]]
        level_start = 4000.0
        level_end = 5000.0
        size = 20.0

        [runner]
        buy_order_limit = 3

        [paper]
        replay_file = "prices.txt"
    "#;

    #[test]
    fn test_settings_from_toml() {
        let settings = Settings::from_toml(SAMPLE).unwrap();

        assert_eq!(settings.strategy.asset, "ETH");
        assert_eq!(settings.strategy.tiers.len(), 2);
        assert!(settings.strategy.validate().is_ok());
        assert_eq!(settings.runner.buy_order_limit, 3);
        assert_eq!(settings.runner.sell_order_limit, 2);
        assert!(settings.store.state_file.is_none());
        assert_eq!(settings.paper.replay_file.as_deref(), Some("prices.txt"));
        assert_eq!(settings.paper.tick_interval_ms, 1000);
        assert_eq!(settings.log.level, "info");
    }

    #[test]
    fn test_settings_require_strategy() {
        assert!(Settings::from_toml("[runner]\nbuy_order_limit = 1\n").is_err());
    }
}
