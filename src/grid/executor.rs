//! Exchange abstraction for grid reconciliation - enables mocking for tests

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;

use super::errors::{GridError, GridResult};
use super::types::{AccountEvent, OrderRequest};

/// Exchange operations trait - can be mocked for testing
#[async_trait]
pub trait GridExchange: Send + Sync {
    /// Open the session
    async fn connect(&self) -> GridResult<()>;

    /// Close the session
    async fn disconnect(&self) -> GridResult<()>;

    /// Place a limit order, returning the exchange order id
    async fn place_order(&self, order: &OrderRequest) -> GridResult<u64>;

    /// Cancel an order by oid
    async fn cancel_order(&self, oid: u64) -> GridResult<bool>;

    /// Cancel every resting order of the instrument
    async fn cancel_all_orders(&self) -> GridResult<u32>;
}

/// Latest mid price subscription
#[async_trait]
pub trait PriceFeed: Send {
    async fn subscribe(&mut self) -> GridResult<UnboundedReceiver<f64>>;
    async fn unsubscribe(&mut self) -> GridResult<()>;
}

/// Fill and funding subscription
#[async_trait]
pub trait AccountFeed: Send {
    async fn subscribe(&mut self) -> GridResult<UnboundedReceiver<AccountEvent>>;
    async fn unsubscribe(&mut self) -> GridResult<()>;
}

/// Bound an exchange call; a stalled call becomes `GridError::Timeout`
pub async fn with_timeout<T, Fut>(timeout_ms: u64, call: Fut) -> GridResult<T>
where
    Fut: Future<Output = GridResult<T>>,
{
    match tokio::time::timeout(Duration::from_millis(timeout_ms), call).await {
        Ok(result) => result,
        Err(_) => Err(GridError::Timeout(timeout_ms)),
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

/// Mock exchange and feeds for testing without a real exchange connection.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
    use tokio::sync::Mutex;

    /// Mock exchange recording every call
    pub struct MockExchange {
        pub orders: Arc<Mutex<Vec<(u64, OrderRequest)>>>,
        pub cancelled_oids: Arc<Mutex<Vec<u64>>>,
        pub cancel_all_calls: AtomicU32,
        pub connected: AtomicBool,
        next_oid: AtomicU64,
        /// Fail every placement while set
        pub should_fail: AtomicBool,
        /// Fail this many placements, then succeed
        pub failures_before_success: AtomicU32,
        pub should_fail_cancel: AtomicBool,
    }

    impl MockExchange {
        pub fn new() -> Self {
            Self {
                orders: Arc::new(Mutex::new(Vec::new())),
                cancelled_oids: Arc::new(Mutex::new(Vec::new())),
                cancel_all_calls: AtomicU32::new(0),
                connected: AtomicBool::new(false),
                next_oid: AtomicU64::new(1),
                should_fail: AtomicBool::new(false),
                failures_before_success: AtomicU32::new(0),
                should_fail_cancel: AtomicBool::new(false),
            }
        }

        pub fn set_should_fail(&self, fail: bool) {
            self.should_fail.store(fail, Ordering::SeqCst);
        }

        pub fn fail_next(&self, count: u32) {
            self.failures_before_success.store(count, Ordering::SeqCst);
        }

        pub fn set_should_fail_cancel(&self, fail: bool) {
            self.should_fail_cancel.store(fail, Ordering::SeqCst);
        }

        /// Orders placed so far
        pub async fn placed(&self) -> Vec<(u64, OrderRequest)> {
            self.orders.lock().await.clone()
        }

        pub async fn clear_placed(&self) {
            self.orders.lock().await.clear();
        }
    }

    impl Default for MockExchange {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl GridExchange for MockExchange {
        async fn connect(&self) -> GridResult<()> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> GridResult<()> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn place_order(&self, order: &OrderRequest) -> GridResult<u64> {
            if self.should_fail.load(Ordering::SeqCst) {
                return Err(GridError::Exchange("Mock failure".into()));
            }
            let pending = self.failures_before_success.load(Ordering::SeqCst);
            if pending > 0 {
                self.failures_before_success.store(pending - 1, Ordering::SeqCst);
                return Err(GridError::Exchange("Mock transient failure".into()));
            }

            let oid = self.next_oid.fetch_add(1, Ordering::SeqCst);
            self.orders.lock().await.push((oid, order.clone()));
            Ok(oid)
        }

        async fn cancel_order(&self, oid: u64) -> GridResult<bool> {
            if self.should_fail_cancel.load(Ordering::SeqCst) {
                return Err(GridError::Exchange("Mock cancel failure".into()));
            }
            self.cancelled_oids.lock().await.push(oid);
            Ok(true)
        }

        async fn cancel_all_orders(&self) -> GridResult<u32> {
            if self.should_fail_cancel.load(Ordering::SeqCst) {
                return Err(GridError::Exchange("Mock cancel failure".into()));
            }
            self.cancel_all_calls.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        }
    }

    /// Mock price feed driven by `push`
    #[derive(Default)]
    pub struct MockPriceFeed {
        sender: Option<UnboundedSender<f64>>,
    }

    impl MockPriceFeed {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&self, price: f64) {
            if let Some(sender) = &self.sender {
                let _ = sender.send(price);
            }
        }
    }

    #[async_trait]
    impl PriceFeed for MockPriceFeed {
        async fn subscribe(&mut self) -> GridResult<UnboundedReceiver<f64>> {
            let (sender, receiver) = unbounded_channel();
            self.sender = Some(sender);
            Ok(receiver)
        }

        async fn unsubscribe(&mut self) -> GridResult<()> {
            self.sender = None;
            Ok(())
        }
    }

    /// Mock account feed driven by `push`
    #[derive(Default)]
    pub struct MockAccountFeed {
        sender: Option<UnboundedSender<AccountEvent>>,
    }

    impl MockAccountFeed {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&self, event: AccountEvent) {
            if let Some(sender) = &self.sender {
                let _ = sender.send(event);
            }
        }
    }

    #[async_trait]
    impl AccountFeed for MockAccountFeed {
        async fn subscribe(&mut self) -> GridResult<UnboundedReceiver<AccountEvent>> {
            let (sender, receiver) = unbounded_channel();
            self.sender = Some(sender);
            Ok(receiver)
        }

        async fn unsubscribe(&mut self) -> GridResult<()> {
            self.sender = None;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockExchange;
    use super::*;
    use crate::grid::types::OrderSide;

    #[tokio::test]
    async fn test_with_timeout_passes_result_through() {
        let value = with_timeout(100, async { Ok::<_, GridError>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result: GridResult<()> = with_timeout(10, async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(GridError::Timeout(10))));
    }

    #[tokio::test]
    async fn test_mock_transient_failures() {
        let exchange = MockExchange::new();
        exchange.fail_next(2);
        let order = OrderRequest::new(OrderSide::Buy, 3800.0, 3800.0, 0.01);

        assert!(exchange.place_order(&order).await.is_err());
        assert!(exchange.place_order(&order).await.is_err());
        assert_eq!(exchange.place_order(&order).await.unwrap(), 1);
        assert_eq!(exchange.placed().await.len(), 1);
    }
}
