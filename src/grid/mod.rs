//! Grid reconciliation engine for a single perpetual-futures instrument
//!
//! Maintains a ladder of resting limit orders and tracks every grid-line
//! position bought and sold, turning exchange fills into an exact ledger.
//!
//! # Architecture
//!
//! - [`ladder`] - Grid definition (price lines, upper index, close lines)
//! - [`tiers`] - Order-size tier table (notional per line)
//! - [`types`] - Core data types (Strategy, Position, Order, events)
//! - [`errors`] - Grid-specific error types
//! - [`state`] - In-memory mirror of the strategy ledger
//! - [`modifier`] - Price escalation modifiers
//! - [`selector`] - Buy/sell target selection
//! - [`reconciler`] - Fill reconciliation, sync pass and bootstrap
//! - [`store`] - Persistence trait and JSON-file store
//! - [`executor`] - Exchange and feed abstractions (mockable for testing)
//! - [`paper`] - Simulated exchange and price replay
//! - [`config`] - Strategy parameters and engine tuning
//! - [`runner`] - Strategy lifecycle and main event loop
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use perp_grid_engine::grid::{
//!     EngineConfig, GridRunner, JsonStore, PaperExchange, ReplayPriceFeed, StrategyParams,
//! };
//!
//! let params = StrategyParams::new(1, "ETH", 3000.0, 5000.0, 6, 1000.0)
//!     .with_tier(3000.0, 4000.0, 30.0)
//!     .with_tier(4000.0, 5000.0, 20.0);
//!
//! let exchange = Arc::new(PaperExchange::default());
//! let store = Arc::new(JsonStore::open("grid_state.json")?);
//! let prices = ReplayPriceFeed::from_file("prices.txt", 500)?.with_exchange(exchange.clone());
//!
//! let mut runner = GridRunner::new(1, EngineConfig::default(), exchange.clone(), store, prices, exchange);
//! runner.create_strategy(&params).await?;
//! runner.start().await?;
//! runner.enable(4107.0).await?;
//! runner.run().await?;
//! ```
//!
//! # Testing
//!
//! ```rust,ignore
//! use perp_grid_engine::grid::executor::mock::{MockAccountFeed, MockExchange, MockPriceFeed};
//! ```

pub mod config;
pub mod errors;
pub mod executor;
pub mod ladder;
pub mod modifier;
pub mod paper;
pub mod reconciler;
pub mod runner;
pub mod selector;
pub mod state;
pub mod store;
pub mod tiers;
pub mod types;

// Re-export commonly used types
pub use config::{EngineConfig, StrategyParams};
pub use errors::{GridError, GridResult};
pub use executor::{AccountFeed, GridExchange, PriceFeed};
pub use ladder::{define_grid, Grid};
pub use paper::{PaperExchange, ReplayPriceFeed};
pub use reconciler::{BatchReport, FillOutcome, Reconciler, SyncReport};
pub use runner::GridRunner;
pub use selector::{find_buy_targets, find_sell_targets};
pub use state::StateMirror;
pub use store::{GridStore, JsonStore, WriteBatch};
pub use tiers::{OrderSizeTier, TierTable};
pub use types::{
    AccountEvent, FillBatch, FillEvent, FundingPayment, GridStateSummary, Order, OrderRequest,
    OrderSide, OrderStatus, OrderType, Position, PositionStatus, Strategy, TimeInForce,
};
