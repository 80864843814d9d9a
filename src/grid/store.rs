//! Persistence collaborator and a JSON-file reference store

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::errors::{GridError, GridResult};
use super::tiers::TierTable;
use super::types::{FundingEntry, Order, Position, Strategy};

/// Rows written together; a store applies a batch all-or-nothing
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub strategy: Option<Strategy>,
    pub tiers: Option<(u64, TierTable)>,
    pub positions: Vec<Position>,
    pub orders: Vec<Order>,
    pub funding: Vec<FundingEntry>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn tiers(mut self, strategy_id: u64, tiers: TierTable) -> Self {
        self.tiers = Some((strategy_id, tiers));
        self
    }

    pub fn position(mut self, position: Position) -> Self {
        self.positions.push(position);
        self
    }

    pub fn positions(mut self, positions: impl IntoIterator<Item = Position>) -> Self {
        self.positions.extend(positions);
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        self.orders.push(order);
        self
    }

    pub fn funding(mut self, entry: FundingEntry) -> Self {
        self.funding.push(entry);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.strategy.is_none()
            && self.tiers.is_none()
            && self.positions.is_empty()
            && self.orders.is_empty()
            && self.funding.is_empty()
    }
}

/// Durable store for strategy, tier, position, order and funding rows
#[async_trait]
pub trait GridStore: Send + Sync {
    /// Apply every row of `batch` atomically
    async fn commit(&self, batch: WriteBatch) -> GridResult<()>;

    async fn load_strategy(&self, id: u64) -> GridResult<Option<Strategy>>;

    async fn load_tiers(&self, strategy_id: u64) -> GridResult<TierTable>;

    /// Every position of a strategy, open and closed
    async fn load_positions(&self, strategy_id: u64) -> GridResult<Vec<Position>>;

    /// Every order of a strategy, resting and terminal
    async fn load_orders(&self, strategy_id: u64) -> GridResult<Vec<Order>>;

    async fn funding_ledger(&self, strategy_id: u64) -> GridResult<Vec<FundingEntry>>;

    async fn save_strategy(&self, strategy: &Strategy) -> GridResult<()> {
        self.commit(WriteBatch::new().strategy(strategy.clone())).await
    }

    async fn save_order(&self, order: &Order) -> GridResult<()> {
        self.commit(WriteBatch::new().order(order.clone())).await
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    strategies: HashMap<u64, Strategy>,
    tiers: HashMap<u64, TierTable>,
    positions: HashMap<Uuid, Position>,
    orders: HashMap<u64, Order>,
    funding: Vec<FundingEntry>,
}

/// Rows a batch overwrote, for rolling back a failed write
#[derive(Default)]
struct Undo {
    strategy: Option<(u64, Option<Strategy>)>,
    tiers: Option<(u64, Option<TierTable>)>,
    positions: Vec<(Uuid, Option<Position>)>,
    orders: Vec<(u64, Option<Order>)>,
    funding_len: usize,
}

fn restore<K: std::hash::Hash + Eq, V>(map: &mut HashMap<K, V>, key: K, previous: Option<V>) {
    match previous {
        Some(value) => {
            map.insert(key, value);
        }
        None => {
            map.remove(&key);
        }
    }
}

impl StoreData {
    fn apply(&mut self, batch: WriteBatch) -> Undo {
        let mut undo = Undo {
            funding_len: self.funding.len(),
            ..Undo::default()
        };
        if let Some(strategy) = batch.strategy {
            let id = strategy.id;
            undo.strategy = Some((id, self.strategies.insert(id, strategy)));
        }
        if let Some((strategy_id, tiers)) = batch.tiers {
            undo.tiers = Some((strategy_id, self.tiers.insert(strategy_id, tiers)));
        }
        for position in batch.positions {
            let id = position.id;
            undo.positions.push((id, self.positions.insert(id, position)));
        }
        for order in batch.orders {
            let id = order.id;
            undo.orders.push((id, self.orders.insert(id, order)));
        }
        self.funding.extend(batch.funding);
        undo
    }

    fn revert(&mut self, undo: Undo) {
        self.funding.truncate(undo.funding_len);
        for (id, previous) in undo.orders.into_iter().rev() {
            restore(&mut self.orders, id, previous);
        }
        for (id, previous) in undo.positions.into_iter().rev() {
            restore(&mut self.positions, id, previous);
        }
        if let Some((id, previous)) = undo.tiers {
            restore(&mut self.tiers, id, previous);
        }
        if let Some((id, previous)) = undo.strategy {
            restore(&mut self.strategies, id, previous);
        }
    }
}

/// Write `content` to a temp file and rename it over `path`, on the
/// blocking pool
async fn write_atomic(path: PathBuf, content: Vec<u8>) -> GridResult<()> {
    tokio::task::spawn_blocking(move || -> GridResult<()> {
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, &path)?;
        Ok(())
    })
    .await
    .map_err(|e| GridError::Persistence(format!("store writer task failed: {}", e)))?
}

/// Store keeping rows in memory and, with a path, mirroring them to a JSON
/// file after every commit
pub struct JsonStore {
    data: Mutex<StoreData>,
    path: Option<PathBuf>,
}

impl JsonStore {
    /// Pure in-memory store
    pub fn in_memory() -> Self {
        Self {
            data: Mutex::new(StoreData::default()),
            path: None,
        }
    }

    /// Open a file-backed store, loading the file when it exists
    pub fn open(path: impl Into<PathBuf>) -> GridResult<Self> {
        let path = path.into();
        let data = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let data: StoreData = serde_json::from_str(&content)?;
            info!(
                "Loaded store from {:?}: {} strategies, {} positions, {} orders",
                path,
                data.strategies.len(),
                data.positions.len(),
                data.orders.len()
            );
            data
        } else {
            info!("No existing store file at {:?}, starting empty", path);
            StoreData::default()
        };

        Ok(Self {
            data: Mutex::new(data),
            path: Some(path),
        })
    }
}

#[async_trait]
impl GridStore for JsonStore {
    async fn commit(&self, batch: WriteBatch) -> GridResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut data = self.data.lock().await;
        let undo = data.apply(batch);

        if let Some(path) = &self.path {
            let written = match serde_json::to_vec_pretty(&*data) {
                Ok(content) => write_atomic(path.clone(), content).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = written {
                data.revert(undo);
                return Err(GridError::Persistence(format!("writing {:?}: {}", path, e)));
            }
            debug!("Store saved to {:?}", path);
        }

        Ok(())
    }

    async fn load_strategy(&self, id: u64) -> GridResult<Option<Strategy>> {
        Ok(self.data.lock().await.strategies.get(&id).cloned())
    }

    async fn load_tiers(&self, strategy_id: u64) -> GridResult<TierTable> {
        Ok(self
            .data
            .lock()
            .await
            .tiers
            .get(&strategy_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn load_positions(&self, strategy_id: u64) -> GridResult<Vec<Position>> {
        let data = self.data.lock().await;
        let mut positions: Vec<Position> = data
            .positions
            .values()
            .filter(|p| p.strategy_id == strategy_id)
            .cloned()
            .collect();
        positions.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        Ok(positions)
    }

    async fn load_orders(&self, strategy_id: u64) -> GridResult<Vec<Order>> {
        let data = self.data.lock().await;
        let mut orders: Vec<Order> = data
            .orders
            .values()
            .filter(|o| o.strategy_id == strategy_id)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.id);
        Ok(orders)
    }

    async fn funding_ledger(&self, strategy_id: u64) -> GridResult<Vec<FundingEntry>> {
        Ok(self
            .data
            .lock()
            .await
            .funding
            .iter()
            .filter(|f| f.strategy_id == strategy_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::state::tests::{sample_strategy, sample_tiers};
    use crate::grid::types::{OrderRequest, OrderSide, OrderStatus};

    #[tokio::test]
    async fn test_commit_and_load() {
        let store = JsonStore::in_memory();
        let strategy = sample_strategy();
        let position = Position::open(strategy.id, 0.01, 3800.0, 3795.0, 4200.0);
        let order = Order::placed(3, strategy.id, &OrderRequest::new(OrderSide::Buy, 3800.0, 3800.0, 0.01));

        store
            .commit(
                WriteBatch::new()
                    .strategy(strategy.clone())
                    .tiers(strategy.id, sample_tiers())
                    .position(position.clone())
                    .order(order),
            )
            .await
            .unwrap();

        assert!(store.load_strategy(strategy.id).await.unwrap().is_some());
        assert_eq!(store.load_tiers(strategy.id).await.unwrap(), sample_tiers());
        assert_eq!(store.load_positions(strategy.id).await.unwrap().len(), 1);
        assert_eq!(store.load_orders(strategy.id).await.unwrap()[0].id, 3);
        assert!(store.load_positions(99).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_replaces_row() {
        let store = JsonStore::in_memory();
        let order = Order::placed(3, 1, &OrderRequest::new(OrderSide::Buy, 3800.0, 3800.0, 0.01));
        store.save_order(&order).await.unwrap();
        store.save_order(&order.with_status(OrderStatus::Cancelled)).await.unwrap();

        let orders = store.load_orders(1).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid_state.json");

        {
            let store = JsonStore::open(&path).unwrap();
            store.save_strategy(&sample_strategy()).await.unwrap();
            store
                .commit(WriteBatch::new().funding(FundingEntry {
                    strategy_id: 1,
                    amount: -0.25,
                    rate: 0.0001,
                    time: 1,
                }))
                .await
                .unwrap();
        }

        let reopened = JsonStore::open(&path).unwrap();
        assert!(reopened.load_strategy(1).await.unwrap().is_some());
        assert_eq!(reopened.funding_ledger(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_store_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("grid_state.json");
        let store = JsonStore::open(&path).unwrap();

        let result = store.save_strategy(&sample_strategy()).await;
        assert!(matches!(result, Err(GridError::Persistence(_))));
        assert!(store.load_strategy(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_write_restores_overwritten_rows() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        std::fs::create_dir(&state_dir).unwrap();
        let store = JsonStore::open(state_dir.join("grid_state.json")).unwrap();

        let strategy = sample_strategy();
        let order = Order::placed(3, 1, &OrderRequest::new(OrderSide::Buy, 3800.0, 3800.0, 0.01));
        store
            .commit(WriteBatch::new().strategy(strategy.clone()).order(order.clone()))
            .await
            .unwrap();

        std::fs::remove_dir_all(&state_dir).unwrap();
        let mut changed = strategy.clone();
        changed.balance = 1234.0;
        let position = Position::open(1, 0.01, 3800.0, 3800.0, 4200.0);
        let result = store
            .commit(
                WriteBatch::new()
                    .strategy(changed)
                    .position(position)
                    .order(order.with_status(OrderStatus::Filled))
                    .funding(FundingEntry {
                        strategy_id: 1,
                        amount: 0.1,
                        rate: 0.0001,
                        time: 1,
                    }),
            )
            .await;

        assert!(matches!(result, Err(GridError::Persistence(_))));
        assert_eq!(store.load_strategy(1).await.unwrap().unwrap().balance, 1000.0);
        assert!(store.load_positions(1).await.unwrap().is_empty());
        assert_eq!(store.load_orders(1).await.unwrap()[0].status, OrderStatus::Opened);
        assert!(store.funding_ledger(1).await.unwrap().is_empty());
    }
}
