//! Paper exchange - simulates order execution locally against a price
//! stream, for dry runs and end-to-end tests.
//!
//! Resting orders fill at their limit price once the mid crosses them.
//! IOC orders fill at the mid when marketable and are rejected otherwise.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::errors::{GridError, GridResult};
use super::executor::{AccountFeed, GridExchange, PriceFeed};
use super::types::{
    AccountEvent, FillBatch, FillEvent, FundingPayment, OrderRequest, OrderSide, TimeInForce,
};

/// Default taker/maker fee (0.01%)
pub const DEFAULT_FEE_RATE: f64 = 0.0001;

fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

fn crosses(side: OrderSide, limit_price: f64, mid: f64) -> bool {
    match side {
        // Buy order fills when mid price <= limit price
        OrderSide::Buy => mid <= limit_price,
        // Sell order fills when mid price >= limit price
        OrderSide::Sell => mid >= limit_price,
    }
}

#[derive(Debug, Default)]
struct PaperBook {
    mid: Option<f64>,
    /// Resting orders by oid, oldest first
    orders: BTreeMap<u64, OrderRequest>,
}

/// Simulated exchange for a single instrument
pub struct PaperExchange {
    book: Mutex<PaperBook>,
    events: Mutex<Option<UnboundedSender<AccountEvent>>>,
    fee_rate: f64,
    next_oid: AtomicU64,
    next_trade_id: AtomicU64,
    connected: AtomicBool,
}

impl PaperExchange {
    pub fn new(fee_rate: f64) -> Self {
        Self {
            book: Mutex::new(PaperBook::default()),
            events: Mutex::new(None),
            fee_rate,
            next_oid: AtomicU64::new(1),
            next_trade_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
        }
    }

    pub fn fee_rate(&self) -> f64 {
        self.fee_rate
    }

    pub async fn mid(&self) -> Option<f64> {
        self.book.lock().await.mid
    }

    /// Resting orders, oldest first
    pub async fn open_orders(&self) -> Vec<(u64, OrderRequest)> {
        self.book
            .lock()
            .await
            .orders
            .iter()
            .map(|(oid, order)| (*oid, order.clone()))
            .collect()
    }

    fn make_fill(&self, oid: u64, order: &OrderRequest, price: f64) -> FillEvent {
        FillEvent {
            trade_id: self.next_trade_id.fetch_add(1, Ordering::SeqCst),
            oid,
            side: order.side,
            price,
            size: order.size,
            fee: order.size * price * self.fee_rate,
            timestamp: now_ms(),
        }
    }

    async fn emit(&self, event: AccountEvent) {
        match self.events.lock().await.as_ref() {
            Some(sender) => {
                if sender.send(event).is_err() {
                    warn!("Paper account subscriber gone, event dropped");
                }
            }
            None => warn!("No paper account subscriber, event dropped"),
        }
    }

    /// Move the mid and fill every resting order it crosses
    pub async fn on_price(&self, mid: f64) -> usize {
        let fills: Vec<FillEvent> = {
            let mut book = self.book.lock().await;
            book.mid = Some(mid);

            let crossed: Vec<u64> = book
                .orders
                .iter()
                .filter(|(_, order)| crosses(order.side, order.limit_price, mid))
                .map(|(oid, _)| *oid)
                .collect();

            crossed
                .into_iter()
                .filter_map(|oid| book.orders.remove(&oid).map(|order| (oid, order)))
                .map(|(oid, order)| self.make_fill(oid, &order, order.limit_price))
                .collect()
        };

        if fills.is_empty() {
            return 0;
        }
        for fill in &fills {
            info!(
                "Paper fill: oid={} {} {} at {} (fee: {:.4})",
                fill.oid,
                fill.side.as_str(),
                fill.size,
                fill.price,
                fill.fee
            );
        }
        let count = fills.len();
        self.emit(AccountEvent::Fills(FillBatch::new(fills))).await;
        count
    }

    /// Inject a funding payment into the account stream
    pub async fn apply_funding(&self, amount: f64, rate: f64) {
        info!("Paper funding: amount={}, rate={}", amount, rate);
        self.emit(AccountEvent::Funding(FundingPayment {
            amount,
            rate,
            time: now_ms(),
        }))
        .await;
    }
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new(DEFAULT_FEE_RATE)
    }
}

#[async_trait]
impl GridExchange for PaperExchange {
    async fn connect(&self) -> GridResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        info!("Paper exchange connected (fee rate {})", self.fee_rate);
        Ok(())
    }

    async fn disconnect(&self) -> GridResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        info!("Paper exchange disconnected");
        Ok(())
    }

    async fn place_order(&self, order: &OrderRequest) -> GridResult<u64> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(GridError::Exchange("paper exchange not connected".into()));
        }
        if order.size <= 0.0 || order.limit_price <= 0.0 {
            return Err(GridError::Exchange(format!(
                "invalid order size {} / price {}",
                order.size, order.limit_price
            )));
        }

        let oid = self.next_oid.fetch_add(1, Ordering::SeqCst);
        let immediate = {
            let mut book = self.book.lock().await;
            let marketable = book
                .mid
                .filter(|&mid| crosses(order.side, order.limit_price, mid));

            match (order.tif, marketable) {
                (TimeInForce::Alo, Some(_)) => {
                    return Err(GridError::Exchange(format!(
                        "post-only order at {} would cross",
                        order.limit_price
                    )));
                }
                (_, Some(mid)) => Some(self.make_fill(oid, order, mid)),
                (TimeInForce::Ioc, None) => {
                    return Err(GridError::Exchange(format!(
                        "IOC order at {} could not immediately match",
                        order.limit_price
                    )));
                }
                (_, None) => {
                    book.orders.insert(oid, order.clone());
                    None
                }
            }
        };

        debug!(
            "Paper order {}: {} {} @ {} ({:?})",
            oid,
            order.side.as_str(),
            order.size,
            order.limit_price,
            order.tif
        );

        if let Some(fill) = immediate {
            info!(
                "Paper fill: oid={} {} {} at {} (fee: {:.4})",
                oid,
                fill.side.as_str(),
                fill.size,
                fill.price,
                fill.fee
            );
            self.emit(AccountEvent::Fills(FillBatch::new(vec![fill]))).await;
        }
        Ok(oid)
    }

    async fn cancel_order(&self, oid: u64) -> GridResult<bool> {
        let removed = self.book.lock().await.orders.remove(&oid).is_some();
        if removed {
            info!("Paper order {} cancelled", oid);
        }
        Ok(removed)
    }

    async fn cancel_all_orders(&self) -> GridResult<u32> {
        let mut book = self.book.lock().await;
        let count = book.orders.len() as u32;
        book.orders.clear();
        debug!("Paper cancelled {} orders", count);
        Ok(count)
    }
}

#[async_trait]
impl AccountFeed for Arc<PaperExchange> {
    async fn subscribe(&mut self) -> GridResult<UnboundedReceiver<AccountEvent>> {
        let (sender, receiver) = unbounded_channel();
        *self.events.lock().await = Some(sender);
        Ok(receiver)
    }

    async fn unsubscribe(&mut self) -> GridResult<()> {
        *self.events.lock().await = None;
        Ok(())
    }
}

/// Streams recorded prices at a fixed interval, forwarding each tick to a
/// paper exchange before publishing it
pub struct ReplayPriceFeed {
    prices: Vec<f64>,
    interval: Duration,
    exchange: Option<Arc<PaperExchange>>,
    task: Option<JoinHandle<()>>,
}

impl ReplayPriceFeed {
    pub fn new(prices: Vec<f64>, interval_ms: u64) -> Self {
        Self {
            prices,
            interval: Duration::from_millis(interval_ms),
            exchange: None,
            task: None,
        }
    }

    /// Parse one price per line; blank lines and `#` comments are skipped
    pub fn parse(content: &str) -> GridResult<Vec<f64>> {
        let mut prices = Vec::new();
        for (number, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let price: f64 = line.parse().map_err(|_| {
                GridError::InvalidConfig(format!("line {}: invalid price {:?}", number + 1, line))
            })?;
            if !price.is_finite() || price <= 0.0 {
                return Err(GridError::InvalidConfig(format!(
                    "line {}: price must be positive, got {}",
                    number + 1,
                    price
                )));
            }
            prices.push(price);
        }
        Ok(prices)
    }

    pub fn from_file(path: impl AsRef<Path>, interval_ms: u64) -> GridResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let prices = Self::parse(&content)?;
        info!("Loaded {} replay prices from {:?}", prices.len(), path);
        Ok(Self::new(prices, interval_ms))
    }

    /// Builder: forward ticks to a paper exchange for matching
    pub fn with_exchange(mut self, exchange: Arc<PaperExchange>) -> Self {
        self.exchange = Some(exchange);
        self
    }

    pub fn first_price(&self) -> Option<f64> {
        self.prices.first().copied()
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

#[async_trait]
impl PriceFeed for ReplayPriceFeed {
    async fn subscribe(&mut self) -> GridResult<UnboundedReceiver<f64>> {
        if let Some(task) = self.task.take() {
            task.abort();
        }

        let (sender, receiver) = unbounded_channel();
        let prices = self.prices.clone();
        let interval = self.interval;
        let exchange = self.exchange.clone();

        self.task = Some(tokio::spawn(async move {
            for price in prices {
                if sender.send(price).is_err() {
                    break;
                }
                if let Some(exchange) = &exchange {
                    exchange.on_price(price).await;
                }
                tokio::time::sleep(interval).await;
            }
            info!("Price replay finished");
        }));
        Ok(receiver)
    }

    async fn unsubscribe(&mut self) -> GridResult<()> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for ReplayPriceFeed {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::types::{BootstrapMeta, TimeInForce};

    async fn connected_exchange() -> (Arc<PaperExchange>, UnboundedReceiver<AccountEvent>) {
        let exchange = Arc::new(PaperExchange::new(0.001));
        exchange.connect().await.unwrap();
        let mut feed = exchange.clone();
        let events = feed.subscribe().await.unwrap();
        (exchange, events)
    }

    fn expect_fills(event: AccountEvent) -> FillBatch {
        match event {
            AccountEvent::Fills(batch) => batch,
            other => panic!("expected fills, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resting_buy_fills_at_limit_when_crossed() {
        let (exchange, mut events) = connected_exchange().await;
        exchange.on_price(3900.0).await;

        let oid = exchange
            .place_order(&OrderRequest::new(OrderSide::Buy, 3800.0, 3800.0, 0.01))
            .await
            .unwrap();
        assert_eq!(exchange.open_orders().await.len(), 1);

        assert_eq!(exchange.on_price(3810.0).await, 0);
        assert_eq!(exchange.on_price(3790.0).await, 1);

        let batch = expect_fills(events.recv().await.unwrap());
        assert_eq!(batch.fills.len(), 1);
        let fill = &batch.fills[0];
        assert_eq!(fill.oid, oid);
        assert_eq!(fill.price, 3800.0);
        assert!((fill.fee - 0.038).abs() < 1e-9);
        assert!(exchange.open_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_ioc_fills_at_mid_or_is_rejected() {
        let (exchange, mut events) = connected_exchange().await;
        exchange.on_price(4107.0).await;

        let meta = BootstrapMeta {
            initial_price: 4107.0,
            number_of_positions: 2,
        };
        let marketable = OrderRequest::new(OrderSide::Buy, 4107.0, 4127.5, 0.0097)
            .with_tif(TimeInForce::Ioc)
            .bootstrap(meta);
        exchange.place_order(&marketable).await.unwrap();
        let batch = expect_fills(events.recv().await.unwrap());
        assert_eq!(batch.fills[0].price, 4107.0);

        let passive = OrderRequest::new(OrderSide::Buy, 4000.0, 4000.0, 0.01).with_tif(TimeInForce::Ioc);
        assert!(exchange.place_order(&passive).await.is_err());
        assert!(exchange.open_orders().await.is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_trade_ids_are_unique() {
        let (exchange, mut events) = connected_exchange().await;
        exchange.on_price(4000.0).await;
        for price in [3900.0, 3800.0] {
            exchange
                .place_order(&OrderRequest::new(OrderSide::Buy, price, price, 0.01))
                .await
                .unwrap();
        }
        exchange.on_price(3700.0).await;

        let batch = expect_fills(events.recv().await.unwrap());
        assert_eq!(batch.fills.len(), 2);
        assert_ne!(batch.fills[0].trade_id, batch.fills[1].trade_id);
    }

    #[tokio::test]
    async fn test_post_only_rejected_when_crossing() {
        let (exchange, _events) = connected_exchange().await;
        exchange.on_price(4000.0).await;
        let order = OrderRequest::new(OrderSide::Sell, 3900.0, 3900.0, 0.01).with_tif(TimeInForce::Alo);
        assert!(exchange.place_order(&order).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_all_and_disconnected_placement() {
        let (exchange, _events) = connected_exchange().await;
        exchange
            .place_order(&OrderRequest::new(OrderSide::Sell, 4200.0, 4200.0, 0.01))
            .await
            .unwrap();
        assert_eq!(exchange.cancel_all_orders().await.unwrap(), 1);

        exchange.disconnect().await.unwrap();
        let result = exchange
            .place_order(&OrderRequest::new(OrderSide::Sell, 4200.0, 4200.0, 0.01))
            .await;
        assert!(matches!(result, Err(GridError::Exchange(_))));
    }

    #[tokio::test]
    async fn test_apply_funding_emits_event() {
        let (exchange, mut events) = connected_exchange().await;
        exchange.apply_funding(-0.25, 0.0001).await;
        match events.recv().await.unwrap() {
            AccountEvent::Funding(payment) => assert_eq!(payment.amount, -0.25),
            other => panic!("expected funding, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_replay_prices() {
        let prices = ReplayPriceFeed::parse("# eth mids\n4107\n\n4100.5\n").unwrap();
        assert_eq!(prices, vec![4107.0, 4100.5]);
        assert!(ReplayPriceFeed::parse("abc").is_err());
        assert!(ReplayPriceFeed::parse("-1").is_err());
    }

    #[tokio::test]
    async fn test_replay_streams_and_matches() {
        let (exchange, mut events) = connected_exchange().await;
        exchange
            .place_order(&OrderRequest::new(OrderSide::Buy, 3800.0, 3800.0, 0.01))
            .await
            .unwrap();

        let mut feed = ReplayPriceFeed::new(vec![3900.0, 3750.0], 1).with_exchange(exchange.clone());
        let mut prices = feed.subscribe().await.unwrap();

        assert_eq!(prices.recv().await, Some(3900.0));
        assert_eq!(prices.recv().await, Some(3750.0));
        let batch = expect_fills(events.recv().await.unwrap());
        assert_eq!(batch.fills[0].price, 3800.0);
        assert_eq!(prices.recv().await, None);
    }
}
