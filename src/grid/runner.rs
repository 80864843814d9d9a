//! Grid runner - strategy lifecycle and the main event loop

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Notify;

use super::config::{EngineConfig, StrategyParams};
use super::errors::{GridError, GridResult};
use super::executor::{with_timeout, AccountFeed, GridExchange, PriceFeed};
use super::reconciler::Reconciler;
use super::state::StateMirror;
use super::store::{GridStore, WriteBatch};
use super::types::{AccountEvent, GridStateSummary, Strategy};

/// Drives one strategy: owns the reconciler and feeds it price ticks and
/// account events from a single task
pub struct GridRunner<E: GridExchange, S: GridStore, P: PriceFeed, A: AccountFeed> {
    strategy_id: u64,
    config: EngineConfig,
    exchange: Arc<E>,
    store: Arc<S>,
    price_feed: P,
    account_feed: A,
    reconciler: Option<Reconciler<E, S>>,
    price_rx: Option<UnboundedReceiver<f64>>,
    account_rx: Option<UnboundedReceiver<AccountEvent>>,
    /// Enabled with no positions; bootstrap on the next price tick
    awaiting_bootstrap: bool,
    /// Ends `run()` at the next gap between events
    shutdown: Arc<Notify>,
}

impl<E, S, P, A> GridRunner<E, S, P, A>
where
    E: GridExchange + 'static,
    S: GridStore + 'static,
    P: PriceFeed,
    A: AccountFeed,
{
    pub fn new(
        strategy_id: u64,
        config: EngineConfig,
        exchange: Arc<E>,
        store: Arc<S>,
        price_feed: P,
        account_feed: A,
    ) -> Self {
        Self {
            strategy_id,
            config,
            exchange,
            store,
            price_feed,
            account_feed,
            reconciler: None,
            price_rx: None,
            account_rx: None,
            awaiting_bootstrap: false,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Handle for requesting a clean stop of `run()`. The event being
    /// handled finishes first; a request made before `run()` starts is kept.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Define the grid, validate tiers and persist a disabled strategy.
    ///
    /// An existing strategy with the same id is returned unchanged.
    pub async fn create_strategy(&self, params: &StrategyParams) -> GridResult<Strategy> {
        if params.id != self.strategy_id {
            return Err(GridError::InvalidConfig(format!(
                "runner drives strategy {}, got params for {}",
                self.strategy_id, params.id
            )));
        }
        if let Some(existing) = self.store.load_strategy(params.id).await? {
            info!("Strategy {} already exists, keeping stored definition", existing.id);
            return Ok(existing);
        }

        let strategy = params.build_strategy()?;
        self.store
            .commit(
                WriteBatch::new()
                    .strategy(strategy.clone())
                    .tiers(strategy.id, params.tier_table()),
            )
            .await?;

        info!(
            "Created strategy {}: {} lines from {} to {}, margin {}",
            strategy.id,
            strategy.grid.len(),
            strategy.min_price,
            strategy.max_price,
            strategy.margin
        );
        Ok(strategy)
    }

    /// Rebuild the mirror from the store, connect and subscribe.
    ///
    /// An enabled strategy with open positions is synchronized immediately,
    /// sells only since no price is known yet; the first tick places the
    /// buys. One without positions waits for the first tick to bootstrap.
    pub async fn start(&mut self) -> GridResult<()> {
        let strategy = self
            .store
            .load_strategy(self.strategy_id)
            .await?
            .ok_or(GridError::StrategyNotFound(self.strategy_id))?;
        if strategy.is_deleted() {
            return Err(GridError::InvalidState {
                current_state: format!("strategy {} is deleted", strategy.id),
            });
        }

        let tiers = self.store.load_tiers(strategy.id).await?;
        let positions = self.store.load_positions(strategy.id).await?;
        let orders = self.store.load_orders(strategy.id).await?;
        let state = StateMirror::rebuild(strategy, tiers, positions, orders)?;
        let enabled = state.strategy().enabled;
        let has_positions = state.open_positions().next().is_some();

        with_timeout(self.config.exchange_timeout_ms, self.exchange.connect()).await?;
        self.price_rx = Some(self.price_feed.subscribe().await?);
        self.account_rx = Some(self.account_feed.subscribe().await?);

        let mut reconciler = Reconciler::new(self.config.clone(), state, self.exchange.clone(), self.store.clone());

        if reconciler.state().bootstrap().is_some() {
            warn!("Stale bootstrap order found at startup, cancelling");
            if let Err(e) = reconciler.cancel_resting_orders().await {
                warn!("Failed to cancel stale bootstrap order: {}", e);
            }
        }

        if enabled && has_positions {
            if let Err(e) = reconciler.synchronize().await {
                warn!("Startup sync failed, retrying on next trigger: {}", e);
            }
        }
        self.awaiting_bootstrap = enabled && !has_positions;
        self.reconciler = Some(reconciler);

        info!(
            "Runner started for strategy {} (enabled={}, awaiting bootstrap={})",
            self.strategy_id, enabled, self.awaiting_bootstrap
        );
        Ok(())
    }

    fn reconciler_mut(&mut self) -> GridResult<&mut Reconciler<E, S>> {
        self.reconciler.as_mut().ok_or_else(|| GridError::InvalidState {
            current_state: "runner not started".into(),
        })
    }

    pub fn reconciler(&self) -> Option<&Reconciler<E, S>> {
        self.reconciler.as_ref()
    }

    pub fn price_feed_mut(&mut self) -> &mut P {
        &mut self.price_feed
    }

    pub fn account_feed_mut(&mut self) -> &mut A {
        &mut self.account_feed
    }

    /// Activate the strategy at `current_price`: bootstrap when flat,
    /// otherwise synchronize
    pub async fn enable(&mut self, current_price: f64) -> GridResult<()> {
        let reconciler = self.reconciler_mut()?;
        reconciler.set_enabled(true).await?;
        reconciler.update_price(current_price);

        if reconciler.state().open_positions().next().is_some() {
            reconciler.synchronize().await?;
            self.awaiting_bootstrap = false;
            return Ok(());
        }

        match reconciler.bootstrap(current_price).await {
            Ok(_) => {
                self.awaiting_bootstrap = false;
                Ok(())
            }
            Err(e) => {
                self.awaiting_bootstrap = true;
                Err(e)
            }
        }
    }

    /// Disable, cancel every order, unsubscribe and disconnect
    pub async fn stop(&mut self) -> GridResult<()> {
        if let Some(reconciler) = self.reconciler.as_mut() {
            reconciler.set_enabled(false).await?;
            match reconciler.cancel_resting_orders().await {
                Ok(count) => info!("Cancelled {} orders on stop", count),
                Err(e) => error!("Failed to cancel orders on stop: {}", e),
            }
        }
        self.awaiting_bootstrap = false;

        self.price_feed.unsubscribe().await?;
        self.account_feed.unsubscribe().await?;
        self.price_rx = None;
        self.account_rx = None;
        with_timeout(self.config.exchange_timeout_ms, self.exchange.disconnect()).await?;

        info!("Runner stopped for strategy {}", self.strategy_id);
        Ok(())
    }

    /// Process events until the price feed ends.
    ///
    /// Account events are drained ahead of price ticks. Too many failed
    /// events in a row stop the strategy.
    pub async fn run(&mut self) -> GridResult<()> {
        let mut price_rx = self.price_rx.take().ok_or_else(|| GridError::InvalidState {
            current_state: "runner not started".into(),
        })?;
        let mut account_rx = self.account_rx.take().ok_or_else(|| GridError::InvalidState {
            current_state: "runner not started".into(),
        })?;
        let shutdown = self.shutdown.clone();
        let mut consecutive_errors = 0u32;

        info!("Starting grid loop for strategy {}", self.strategy_id);
        loop {
            let result = tokio::select! {
                biased;
                _ = shutdown.notified() => {
                    info!("Shutdown requested");
                    break;
                }
                event = account_rx.recv() => match event {
                    Some(event) => self.handle_account_event(event).await,
                    None => {
                        info!("Account feed closed");
                        break;
                    }
                },
                price = price_rx.recv() => match price {
                    Some(price) => self.handle_price(price).await,
                    None => {
                        info!("Price feed closed");
                        break;
                    }
                },
            };

            match result {
                Ok(()) => consecutive_errors = 0,
                Err(e) if e.is_exchange() => {
                    warn!("Exchange error handling event: {}", e);
                    consecutive_errors += 1;
                }
                Err(e) => {
                    error!("Error handling event: {}", e);
                    consecutive_errors += 1;
                }
            }

            if consecutive_errors >= self.config.max_consecutive_errors {
                error!("Too many errors, shutting down");
                self.stop().await?;
                return Err(GridError::Exchange("Too many errors".into()));
            }
        }

        Ok(())
    }

    async fn handle_price(&mut self, price: f64) -> GridResult<()> {
        let mut awaiting_bootstrap = self.awaiting_bootstrap;
        let timeout_ms = self.config.bootstrap_timeout_ms;
        let reconciler = self.reconciler_mut()?;
        reconciler.update_price(price);

        let strategy = reconciler.state().strategy();
        if price < strategy.min_price || price > strategy.max_price {
            debug!("Price {} outside grid range", price);
        }
        if !strategy.enabled {
            return Ok(());
        }

        if reconciler.bootstrap_expired() {
            warn!("Bootstrap order unfilled after {} ms, cancelling", timeout_ms);
            reconciler.cancel_resting_orders().await?;
            awaiting_bootstrap = reconciler.state().open_positions().next().is_none();
        }

        if awaiting_bootstrap {
            info!("Bootstrapping at {}", price);
            let result = reconciler.bootstrap(price).await;
            self.awaiting_bootstrap = result.is_err();
            result?;
        } else if reconciler.needs_resync() {
            debug!("Resynchronizing at {}", price);
            reconciler.synchronize().await?;
        }
        Ok(())
    }

    async fn handle_account_event(&mut self, event: AccountEvent) -> GridResult<()> {
        let reconciler = self.reconciler_mut()?;
        let bootstrap_was_pending = reconciler.state().bootstrap().is_some();

        let result = Self::apply_account_event(reconciler, event).await;

        // A bootstrap that left the book without creating positions is retried
        let state = reconciler.state();
        let rearm = bootstrap_was_pending
            && state.bootstrap().is_none()
            && state.open_positions().next().is_none()
            && state.strategy().enabled;
        if rearm {
            info!("Bootstrap closed without positions, retrying on next tick");
            self.awaiting_bootstrap = true;
        }
        result
    }

    async fn apply_account_event(reconciler: &mut Reconciler<E, S>, event: AccountEvent) -> GridResult<()> {
        match event {
            AccountEvent::Fills(batch) => {
                let report = reconciler.handle_fill_batch(&batch).await?;
                if !report.outcomes.is_empty() {
                    let s = reconciler.summary(None);
                    info!(
                        "Fills applied: positions={}, balance={:.4}, pnl={:.4}, buys={}, sells={}",
                        s.open_positions, s.balance, s.realized_pnl, s.resting_buys, s.resting_sells
                    );
                }
            }
            AccountEvent::Funding(payment) => reconciler.handle_funding(&payment).await?,
            AccountEvent::OrderCancelled(oid) => reconciler.handle_order_cancelled(oid).await?,
        }
        Ok(())
    }

    /// Ledger snapshot marked to `current_price` (last tick when `None`)
    pub fn summary(&self, current_price: Option<f64>) -> GridResult<GridStateSummary> {
        self.reconciler
            .as_ref()
            .map(|r| r.summary(current_price))
            .ok_or_else(|| GridError::InvalidState {
                current_state: "runner not started".into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::executor::mock::{MockAccountFeed, MockExchange, MockPriceFeed};
    use crate::grid::store::JsonStore;
    use crate::grid::types::{
        FillBatch, FillEvent, FundingPayment, Order, OrderRequest, OrderSide, OrderStatus, OrderType,
        Position,
    };
    use std::sync::atomic::Ordering;

    type TestRunner = GridRunner<MockExchange, JsonStore, MockPriceFeed, MockAccountFeed>;

    fn sample_params() -> StrategyParams {
        StrategyParams::new(1, "ETH", 3000.0, 5000.0, 6, 1000.0)
            .with_tier(3000.0, 4000.0, 30.0)
            .with_tier(4000.0, 5000.0, 20.0)
    }

    fn create_runner(config: EngineConfig) -> (TestRunner, Arc<MockExchange>, Arc<JsonStore>) {
        let exchange = Arc::new(MockExchange::new());
        let store = Arc::new(JsonStore::in_memory());
        let runner = GridRunner::new(
            1,
            config,
            exchange.clone(),
            store.clone(),
            MockPriceFeed::new(),
            MockAccountFeed::new(),
        );
        (runner, exchange, store)
    }

    fn test_config() -> EngineConfig {
        EngineConfig::default().with_retry_config(1, 1)
    }

    #[tokio::test]
    async fn test_create_strategy_persists_disabled() {
        let (runner, _, store) = create_runner(test_config());
        let strategy = runner.create_strategy(&sample_params()).await.unwrap();

        assert!(!strategy.enabled);
        let stored = store.load_strategy(1).await.unwrap().unwrap();
        assert_eq!(stored.grid, strategy.grid);
        assert_eq!(store.load_tiers(1).await.unwrap(), sample_params().tier_table());

        // Idempotent
        let again = runner.create_strategy(&sample_params()).await.unwrap();
        assert_eq!(again.created_at, strategy.created_at);
    }

    #[tokio::test]
    async fn test_create_strategy_rejects_bad_tiers() {
        let (runner, _, store) = create_runner(test_config());
        let params = StrategyParams::new(1, "ETH", 3000.0, 5000.0, 6, 1000.0)
            .with_tier(3000.0, 3500.0, 30.0)
            .with_tier(4000.0, 5000.0, 20.0);

        assert!(matches!(
            runner.create_strategy(&params).await,
            Err(GridError::InvalidConfig(_))
        ));
        assert!(store.load_strategy(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_requires_strategy() {
        let (mut runner, _, _) = create_runner(test_config());
        assert!(matches!(runner.start().await, Err(GridError::StrategyNotFound(1))));
        assert!(runner.summary(None).is_err());
    }

    #[tokio::test]
    async fn test_enable_bootstraps_when_flat() {
        let (mut runner, exchange, store) = create_runner(test_config());
        runner.create_strategy(&sample_params()).await.unwrap();
        runner.start().await.unwrap();
        assert!(exchange.connected.load(Ordering::SeqCst));

        runner.enable(4107.0).await.unwrap();

        let summary = runner.summary(None).unwrap();
        assert!(summary.enabled);
        assert!(summary.bootstrap_pending);
        assert!(store.load_strategy(1).await.unwrap().unwrap().enabled);
        assert_eq!(exchange.placed().await.len(), 1);
    }

    #[tokio::test]
    async fn test_restart_rebuilds_and_syncs() {
        let (mut runner, exchange, store) = create_runner(test_config());
        let mut strategy = runner.create_strategy(&sample_params()).await.unwrap();
        strategy.enabled = true;
        let position = Position::open(1, 0.01, 3800.0, 3795.0, 4200.0);
        let stale = Order::placed(
            77,
            1,
            &OrderRequest::new(OrderSide::Sell, 4200.0, 4200.0, 0.01).closing(position.id),
        );
        store
            .commit(WriteBatch::new().strategy(strategy).position(position.clone()).order(stale))
            .await
            .unwrap();

        runner.start().await.unwrap();

        assert_eq!(exchange.cancel_all_calls.load(Ordering::SeqCst), 1);
        let orders = store.load_orders(1).await.unwrap();
        assert_eq!(
            orders.iter().find(|o| o.id == 77).unwrap().status,
            OrderStatus::Cancelled
        );
        let placed = exchange.placed().await;
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].1.position_id, Some(position.id));

        // The first tick supplies the price the startup sync lacked
        runner.price_feed_mut().push(4107.0);
        runner.price_feed_mut().push(4100.0);
        runner.price_feed_mut().unsubscribe().await.unwrap();
        runner.run().await.unwrap();

        let summary = runner.summary(Some(4000.0)).unwrap();
        assert_eq!(summary.open_positions, 1);
        assert_eq!(summary.resting_sells, 1);
        assert_eq!(summary.resting_buys, 2);
        let buys: Vec<f64> = exchange
            .placed()
            .await
            .iter()
            .filter(|(_, r)| r.side == OrderSide::Buy)
            .map(|(_, r)| r.grid_price)
            .collect();
        assert_eq!(buys, vec![3400.0, 3000.0]);
    }

    #[tokio::test]
    async fn test_unfilled_bootstrap_is_retried_on_next_tick() {
        let (mut runner, exchange, _) = create_runner(test_config());
        runner.create_strategy(&sample_params()).await.unwrap();
        runner.start().await.unwrap();
        runner.enable(4107.0).await.unwrap();

        runner.account_feed_mut().push(AccountEvent::OrderCancelled(1));
        runner.price_feed_mut().push(4110.0);
        runner.price_feed_mut().unsubscribe().await.unwrap();
        runner.run().await.unwrap();

        let placed = exchange.placed().await;
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[1].1.order_type, OrderType::InitialPositionsBuyUp);
        assert!(runner.summary(None).unwrap().bootstrap_pending);
    }

    #[tokio::test]
    async fn test_expired_bootstrap_is_cancelled_and_replaced() {
        let mut config = test_config();
        config.bootstrap_timeout_ms = 0;
        let (mut runner, exchange, store) = create_runner(config);
        runner.create_strategy(&sample_params()).await.unwrap();
        runner.start().await.unwrap();
        runner.enable(4107.0).await.unwrap();

        runner.price_feed_mut().push(4110.0);
        runner.price_feed_mut().unsubscribe().await.unwrap();
        runner.run().await.unwrap();

        assert_eq!(exchange.cancel_all_calls.load(Ordering::SeqCst), 1);
        let orders = store.load_orders(1).await.unwrap();
        assert_eq!(orders[0].status, OrderStatus::Cancelled);
        assert_eq!(orders[1].status, OrderStatus::Opened);
        assert!(runner.summary(None).unwrap().bootstrap_pending);
    }

    #[tokio::test]
    async fn test_shutdown_ends_loop_between_events() {
        let (mut runner, _, _) = create_runner(test_config());
        runner.create_strategy(&sample_params()).await.unwrap();
        runner.start().await.unwrap();

        runner.price_feed_mut().push(4107.0);
        runner.shutdown_handle().notify_one();
        runner.run().await.unwrap();

        assert_eq!(runner.reconciler().unwrap().last_price(), None);
    }

    #[tokio::test]
    async fn test_run_loop_processes_fills_and_funding() {
        let (mut runner, exchange, _) = create_runner(test_config());
        runner.create_strategy(&sample_params()).await.unwrap();
        runner.start().await.unwrap();
        runner.enable(4107.0).await.unwrap();

        runner.account_feed_mut().push(AccountEvent::Fills(FillBatch::new(vec![FillEvent {
            trade_id: 1,
            oid: 1,
            side: OrderSide::Buy,
            price: 4107.0,
            size: 0.0096,
            fee: 0.01,
            timestamp: 0,
        }])));
        runner.account_feed_mut().push(AccountEvent::Funding(FundingPayment {
            amount: 0.2,
            rate: 0.0001,
            time: 0,
        }));
        runner.price_feed_mut().push(4110.0);
        runner.price_feed_mut().unsubscribe().await.unwrap();

        runner.run().await.unwrap();

        let summary = runner.summary(None).unwrap();
        assert_eq!(summary.open_positions, 2);
        assert!(!summary.bootstrap_pending);
        assert_eq!(summary.resting_buys, 2);
        assert_eq!(summary.resting_sells, 2);
        assert!((summary.balance - (1000.0 - 0.01 + 0.2)).abs() < 1e-9);
        assert_eq!(runner.reconciler().unwrap().last_price(), Some(4110.0));
        assert_eq!(exchange.placed().await.len(), 5);
    }

    #[tokio::test]
    async fn test_run_loop_bootstraps_on_first_tick_and_gives_up_after_errors() {
        let mut config = test_config();
        config.max_consecutive_errors = 2;
        let (mut runner, exchange, _) = create_runner(config);
        runner.create_strategy(&sample_params()).await.unwrap();
        runner.start().await.unwrap();

        exchange.set_should_fail(true);
        assert!(runner.enable(4107.0).await.is_err());

        for _ in 0..3 {
            runner.price_feed_mut().push(4107.0);
        }
        let result = runner.run().await;

        assert!(matches!(result, Err(GridError::Exchange(_))));
        let summary = runner.summary(None).unwrap();
        assert!(!summary.enabled);
        assert!(!exchange.connected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stop_disables_and_cancels() {
        let (mut runner, exchange, store) = create_runner(test_config());
        runner.create_strategy(&sample_params()).await.unwrap();
        runner.start().await.unwrap();
        runner.enable(4107.0).await.unwrap();

        runner.stop().await.unwrap();

        assert!(!store.load_strategy(1).await.unwrap().unwrap().enabled);
        assert_eq!(exchange.cancel_all_calls.load(Ordering::SeqCst), 1);
        assert!(!runner.summary(None).unwrap().bootstrap_pending);
        assert!(runner.run().await.is_err());
    }
}
