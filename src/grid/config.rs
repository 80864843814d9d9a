//! Strategy parameters and engine tuning

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::errors::{GridError, GridResult};
use super::ladder::Grid;
use super::tiers::{OrderSizeTier, TierTable};
use super::types::Strategy;

/// Parameters for creating a strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyParams {
    /// Strategy id in the store
    pub id: u64,

    /// Instrument traded (e.g. "ETH")
    pub asset: String,

    /// Lowest grid line
    pub min_price: f64,

    /// Highest grid line
    pub max_price: f64,

    /// Number of grid lines
    pub line_count: u32,

    /// Capital allocated to the strategy in quote currency
    pub margin: f64,

    /// Order size tiers (quote notional per line)
    #[serde(default)]
    pub tiers: Vec<OrderSizeTier>,
}

impl StrategyParams {
    pub fn new(
        id: u64,
        asset: impl Into<String>,
        min_price: f64,
        max_price: f64,
        line_count: u32,
        margin: f64,
    ) -> Self {
        Self {
            id,
            asset: asset.into(),
            min_price,
            max_price,
            line_count,
            margin,
            tiers: Vec::new(),
        }
    }

    /// Builder: add a size tier
    pub fn with_tier(mut self, level_start: f64, level_end: f64, size: f64) -> Self {
        self.tiers.push(OrderSizeTier::new(level_start, level_end, size));
        self
    }

    pub fn tier_table(&self) -> TierTable {
        TierTable::new(self.tiers.clone())
    }

    /// Validate the parameters
    pub fn validate(&self) -> GridResult<()> {
        if self.asset.is_empty() {
            return Err(GridError::InvalidConfig("asset cannot be empty".into()));
        }

        if self.min_price <= 0.0 {
            return Err(GridError::InvalidConfig("min_price must be positive".into()));
        }

        if self.min_price >= self.max_price {
            return Err(GridError::InvalidConfig(
                "min_price must be less than max_price".into(),
            ));
        }

        if self.line_count == 0 {
            return Err(GridError::InvalidConfig("line_count must be at least 1".into()));
        }

        if self.margin <= 0.0 {
            return Err(GridError::InvalidConfig("margin must be positive".into()));
        }

        self.tier_table().validate()
    }

    /// Validate and build a disabled strategy row with its grid
    pub fn build_strategy(&self) -> GridResult<Strategy> {
        self.validate()?;
        let grid = Grid::define(self.min_price, self.max_price, self.line_count)?;

        Ok(Strategy {
            id: self.id,
            asset: self.asset.clone(),
            enabled: false,
            grid: grid.lines().to_vec(),
            min_price: self.min_price,
            max_price: self.max_price,
            margin: self.margin,
            balance: self.margin,
            realized_pnl: 0.0,
            total_fees: 0.0,
            total_funding: 0.0,
            created_at: Utc::now(),
            deleted_at: None,
        })
    }
}

/// Reconciler and runner tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum resting BUY orders per synchronization pass
    #[serde(default = "default_buy_order_limit")]
    pub buy_order_limit: usize,

    /// Maximum resting SELL orders per synchronization pass
    #[serde(default = "default_sell_order_limit")]
    pub sell_order_limit: usize,

    /// Fraction above market for the marketable bootstrap buy
    #[serde(default = "default_bootstrap_slippage")]
    pub bootstrap_slippage: f64,

    /// Placement attempts for the bootstrap order
    #[serde(default = "default_max_retries")]
    pub max_bootstrap_retries: u32,

    /// A bootstrap order with no fill after this long is cancelled and
    /// retried (milliseconds)
    #[serde(default = "default_bootstrap_timeout")]
    pub bootstrap_timeout_ms: u64,

    /// Base delay for exponential backoff (milliseconds)
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    /// Upper bound for any single exchange call (milliseconds)
    #[serde(default = "default_exchange_timeout")]
    pub exchange_timeout_ms: u64,

    /// Number of recent trade ids remembered for duplicate detection
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,

    /// Decimal places for order sizes in base units
    #[serde(default = "default_size_decimals")]
    pub size_decimals: u32,

    /// Runner gives up after this many failed events in a row
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
}

fn default_buy_order_limit() -> usize {
    2
}

fn default_sell_order_limit() -> usize {
    2
}

fn default_bootstrap_slippage() -> f64 {
    0.005
}

fn default_max_retries() -> u32 {
    5
}

fn default_bootstrap_timeout() -> u64 {
    30_000
}

fn default_retry_base_delay() -> u64 {
    100
}

fn default_exchange_timeout() -> u64 {
    10_000
}

fn default_dedup_capacity() -> usize {
    10_000
}

fn default_size_decimals() -> u32 {
    4
}

fn default_max_consecutive_errors() -> u32 {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buy_order_limit: default_buy_order_limit(),
            sell_order_limit: default_sell_order_limit(),
            bootstrap_slippage: default_bootstrap_slippage(),
            max_bootstrap_retries: default_max_retries(),
            bootstrap_timeout_ms: default_bootstrap_timeout(),
            retry_base_delay_ms: default_retry_base_delay(),
            exchange_timeout_ms: default_exchange_timeout(),
            dedup_capacity: default_dedup_capacity(),
            size_decimals: default_size_decimals(),
            max_consecutive_errors: default_max_consecutive_errors(),
        }
    }
}

impl EngineConfig {
    /// Builder: set order limits per pass
    pub fn with_order_limits(mut self, buys: usize, sells: usize) -> Self {
        self.buy_order_limit = buys;
        self.sell_order_limit = sells;
        self
    }

    /// Builder: set retry parameters
    pub fn with_retry_config(mut self, max_retries: u32, base_delay_ms: u64) -> Self {
        self.max_bootstrap_retries = max_retries;
        self.retry_base_delay_ms = base_delay_ms;
        self
    }

    /// Builder: set exchange call timeout
    pub fn with_exchange_timeout(mut self, timeout_ms: u64) -> Self {
        self.exchange_timeout_ms = timeout_ms;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> GridResult<()> {
        if self.max_bootstrap_retries == 0 {
            return Err(GridError::InvalidConfig(
                "max_bootstrap_retries must be at least 1".into(),
            ));
        }

        if !(0.0..1.0).contains(&self.bootstrap_slippage) {
            return Err(GridError::InvalidConfig(
                "bootstrap_slippage must be in [0, 1)".into(),
            ));
        }

        if self.exchange_timeout_ms == 0 {
            return Err(GridError::InvalidConfig(
                "exchange_timeout_ms must be positive".into(),
            ));
        }

        if self.dedup_capacity == 0 {
            return Err(GridError::InvalidConfig("dedup_capacity must be positive".into()));
        }

        Ok(())
    }

    /// Backoff before retry `attempt` (1-based)
    pub fn retry_delay_ms(&self, attempt: u32) -> u64 {
        self.retry_base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_params() -> StrategyParams {
        StrategyParams::new(1, "ETH", 3000.0, 5000.0, 6, 1000.0)
            .with_tier(3000.0, 4000.0, 30.0)
            .with_tier(4000.0, 5000.0, 20.0)
    }

    #[test]
    fn test_params_validation() {
        assert!(sample_params().validate().is_ok());

        let mut inverted = sample_params();
        inverted.min_price = 6000.0;
        assert!(inverted.validate().is_err());

        let mut no_lines = sample_params();
        no_lines.line_count = 0;
        assert!(no_lines.validate().is_err());

        let no_tiers = StrategyParams::new(1, "ETH", 3000.0, 5000.0, 6, 1000.0);
        assert!(no_tiers.validate().is_err());

        let mut no_margin = sample_params();
        no_margin.margin = 0.0;
        assert!(no_margin.validate().is_err());
    }

    #[test]
    fn test_build_strategy() {
        let strategy = sample_params().build_strategy().unwrap();
        assert!(!strategy.enabled);
        assert_eq!(strategy.grid, vec![3000.0, 3400.0, 3800.0, 4200.0, 4600.0, 5000.0]);
        assert_eq!(strategy.balance, strategy.margin);
    }

    #[test]
    fn test_engine_defaults_and_validation() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.size_decimals, 4);

        let bad = EngineConfig::default().with_retry_config(0, 100);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_retry_delay_doubles() {
        let config = EngineConfig::default().with_retry_config(5, 100);
        assert_eq!(config.retry_delay_ms(1), 100);
        assert_eq!(config.retry_delay_ms(2), 200);
        assert_eq!(config.retry_delay_ms(4), 800);
    }

    #[test]
    fn test_engine_config_from_partial_json() {
        let config: EngineConfig = serde_json::from_str(r#"{"buy_order_limit": 4}"#).unwrap();
        assert_eq!(config.buy_order_limit, 4);
        assert_eq!(config.sell_order_limit, 2);
    }
}
