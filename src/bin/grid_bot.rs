//! Grid Bot Binary
//!
//! Runs one grid strategy against the paper exchange, driven by a replayed
//! price file.
//!
//! ## Setup
//!
//! 1. Create a config file (see `config.example.toml`).
//! 2. Optionally override settings in `.env` or the environment:
//!    ```
//!    APP_RUNNER__BUY_ORDER_LIMIT=4
//!    APP_STORE__STATE_FILE=grid_state.json
//!    ```
//! 3. Run the bot:
//!    ```bash
//!    cargo run --bin grid_bot -- --config config.toml
//!    ```

use std::env;
use std::sync::Arc;

use log::{error, info, warn};

use perp_grid_engine::grid::{GridRunner, GridStore, JsonStore, PaperExchange, ReplayPriceFeed};
use perp_grid_engine::{GridResult, Settings};

#[tokio::main]
async fn main() {
    // Load .env file
    let dotenv = dotenvy::dotenv();

    let args: Vec<String> = env::args().collect();
    let config_path = if args.len() > 2 && args[1] == "--config" {
        args[2].clone()
    } else {
        "config.toml".to_string()
    };

    let settings = Settings::new(&config_path);
    let level = settings
        .as_ref()
        .map(|s| s.log.level.clone())
        .unwrap_or_else(|_| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match dotenv {
        Ok(path) => info!("Loaded environment from: {}", path.display()),
        Err(_) => info!("No .env file found, using system environment variables"),
    }

    let settings = match settings {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load config from {}: {}", config_path, e);
            return;
        }
    };

    let result = match &settings.store.state_file {
        Some(path) => match JsonStore::open(path) {
            Ok(store) => run(settings, Arc::new(store)).await,
            Err(e) => {
                error!("Failed to open state file {}: {}", path, e);
                return;
            }
        },
        None => {
            warn!("No state file configured, state is kept in memory only");
            run(settings, Arc::new(JsonStore::in_memory())).await
        }
    };

    if let Err(e) = result {
        error!("Grid bot exited with error: {}", e);
    }
}

async fn run<S: GridStore + 'static>(settings: Settings, store: Arc<S>) -> GridResult<()> {
    settings.runner.validate()?;
    settings.strategy.validate()?;

    let replay_file = match &settings.paper.replay_file {
        Some(path) => path.clone(),
        None => {
            error!("paper.replay_file is required to drive the paper exchange");
            return Ok(());
        }
    };

    let exchange = Arc::new(PaperExchange::new(settings.paper.fee_rate));
    let prices = ReplayPriceFeed::from_file(&replay_file, settings.paper.tick_interval_ms)?
        .with_exchange(exchange.clone());
    let first_price = match prices.first_price() {
        Some(price) => price,
        None => {
            error!("Replay file {} has no prices", replay_file);
            return Ok(());
        }
    };

    info!("Starting grid bot for {}", settings.strategy.asset);
    info!(
        "Grid range: {} - {} ({} lines), margin {}",
        settings.strategy.min_price,
        settings.strategy.max_price,
        settings.strategy.line_count,
        settings.strategy.margin
    );

    let mut runner = GridRunner::new(
        settings.strategy.id,
        settings.runner.clone(),
        exchange.clone(),
        store,
        prices,
        exchange,
    );

    let strategy = runner.create_strategy(&settings.strategy).await?;
    runner.start().await?;
    if !strategy.enabled {
        if let Err(e) = runner.enable(first_price).await {
            warn!("Activation incomplete, retrying on next tick: {}", e);
        }
    }

    let shutdown = runner.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping after the current event");
            shutdown.notify_one();
        }
    });

    let outcome = runner.run().await;
    if let Err(e) = &outcome {
        error!("Runner loop failed: {}", e);
    }

    let summary = runner.summary(None)?;
    info!(
        "Final: balance={:.4}, realized={:.4}, fees={:.4}, funding={:.4}, open={} ({} size), unrealized={:.4}",
        summary.balance,
        summary.realized_pnl,
        summary.total_fees,
        summary.total_funding,
        summary.open_positions,
        summary.open_size,
        summary.unrealized_pnl
    );

    runner.stop().await?;
    outcome
}
