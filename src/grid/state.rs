//! State mirror - in-process cache of the strategy ledger
//!
//! The store is the durable authority; the mirror is rebuilt from it at
//! startup and afterwards only mutated by the reconciler, from a single task.

use std::collections::HashMap;

use log::info;
use uuid::Uuid;

use super::errors::GridResult;
use super::ladder::Grid;
use super::modifier::{price_key, PriceModifiers};
use super::tiers::TierTable;
use super::types::{BootstrapOrder, Order, OrderSide, OrderStatus, OrderType, Position, Strategy};

/// Change to the strategy's ledger totals
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LedgerDelta {
    pub realized_pnl: f64,
    pub fee: f64,
    pub funding: f64,
}

impl LedgerDelta {
    pub fn fee(fee: f64) -> Self {
        Self {
            fee,
            ..Self::default()
        }
    }

    pub fn trade(realized_pnl: f64, fee: f64) -> Self {
        Self {
            realized_pnl,
            fee,
            ..Self::default()
        }
    }

    pub fn funding(amount: f64) -> Self {
        Self {
            funding: amount,
            ..Self::default()
        }
    }

    /// Net effect on the balance
    pub fn net(&self) -> f64 {
        self.realized_pnl - self.fee + self.funding
    }
}

/// In-memory mirror of strategy, positions, orders, modifiers and the
/// bootstrap slot
#[derive(Debug, Clone)]
pub struct StateMirror {
    strategy: Strategy,
    grid: Grid,
    tiers: TierTable,
    positions: HashMap<Uuid, Position>,
    orders: HashMap<u64, Order>,
    /// Orders cancelled by the latest cancel pass; a fill racing the cancel
    /// is still matched against them
    cancelled: HashMap<u64, Order>,
    modifiers: PriceModifiers,
    bootstrap: Option<BootstrapOrder>,
}

impl StateMirror {
    /// Create an empty mirror for a strategy
    pub fn new(strategy: Strategy, tiers: TierTable) -> GridResult<Self> {
        let grid = Grid::from_lines(strategy.grid.clone(), strategy.min_price, strategy.max_price)?;
        Ok(Self {
            strategy,
            grid,
            tiers,
            positions: HashMap::new(),
            orders: HashMap::new(),
            cancelled: HashMap::new(),
            modifiers: PriceModifiers::new(),
            bootstrap: None,
        })
    }

    /// Rebuild from store rows; only OPENED positions and resting orders are kept
    pub fn rebuild(
        strategy: Strategy,
        tiers: TierTable,
        positions: Vec<Position>,
        orders: Vec<Order>,
    ) -> GridResult<Self> {
        let mut mirror = Self::new(strategy, tiers)?;

        for position in positions.into_iter().filter(|p| p.is_open()) {
            mirror.upsert_position(position);
        }

        for order in orders.into_iter().filter(|o| o.status.is_resting()) {
            if order.order_type == OrderType::InitialPositionsBuyUp {
                if let Some(meta) = order.bootstrap {
                    mirror.bootstrap = Some(BootstrapOrder { oid: order.id, meta });
                }
            }
            mirror.upsert_order(order);
        }

        info!(
            "Rebuilt state for strategy {}: {} open positions, {} resting orders, bootstrap pending={}",
            mirror.strategy.id,
            mirror.positions.len(),
            mirror.orders.len(),
            mirror.bootstrap.is_some()
        );

        Ok(mirror)
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn replace_strategy(&mut self, strategy: Strategy) {
        self.strategy = strategy;
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    /// Notional tier size for a grid line
    pub fn size_for_grid(&self, grid_price: f64) -> f64 {
        self.tiers.size_for(grid_price)
    }

    // ---- balance ---------------------------------------------------------

    pub fn balance(&self) -> f64 {
        self.strategy.balance
    }

    /// Strategy row with `delta` applied, for persisting before the mirror
    pub fn strategy_with(&self, delta: LedgerDelta) -> Strategy {
        let mut strategy = self.strategy.clone();
        strategy.realized_pnl += delta.realized_pnl;
        strategy.total_fees += delta.fee;
        strategy.total_funding += delta.funding;
        strategy.balance += delta.net();
        strategy
    }

    /// Apply a ledger delta in place
    pub fn apply_delta(&mut self, delta: LedgerDelta) {
        self.strategy = self.strategy_with(delta);
    }

    // ---- positions -------------------------------------------------------

    pub fn position(&self, id: &Uuid) -> Option<&Position> {
        self.positions.get(id)
    }

    pub fn upsert_position(&mut self, position: Position) {
        self.positions.insert(position.id, position);
    }

    pub fn remove_position(&mut self, id: &Uuid) -> Option<Position> {
        self.positions.remove(id)
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values().filter(|p| p.is_open())
    }

    pub fn has_open_position_at(&self, grid_price: f64) -> bool {
        self.open_position_at(grid_price).is_some()
    }

    /// The OPENED position bought on a grid line, if any
    pub fn open_position_at(&self, grid_price: f64) -> Option<&Position> {
        let key = price_key(grid_price);
        self.open_positions()
            .find(|p| price_key(p.grid_open_price) == key)
    }

    // ---- orders ----------------------------------------------------------

    pub fn order(&self, oid: u64) -> Option<&Order> {
        self.orders.get(&oid)
    }

    pub fn upsert_order(&mut self, order: Order) {
        self.orders.insert(order.id, order);
    }

    /// Order from the latest cancel pass
    pub fn cancelled_order(&self, oid: u64) -> Option<&Order> {
        self.cancelled.get(&oid)
    }

    /// Replace the cancelled-order memory with the latest pass
    pub fn retire_cancelled(&mut self, orders: Vec<Order>) {
        self.cancelled.clear();
        for order in orders {
            self.orders.remove(&order.id);
            self.cancelled.insert(order.id, order);
        }
    }

    /// Drop an order from both the resting and cancelled sets
    pub fn forget_order(&mut self, oid: u64) {
        self.orders.remove(&oid);
        self.cancelled.remove(&oid);
    }

    /// Store an updated row where its status belongs: resting orders stay
    /// live, cancelled ones stay matchable, filled ones are evicted
    pub fn record_order(&mut self, order: Order) {
        match order.status {
            OrderStatus::Opened | OrderStatus::PartiallyFilled => {
                self.cancelled.remove(&order.id);
                self.orders.insert(order.id, order);
            }
            OrderStatus::Cancelled => {
                self.orders.remove(&order.id);
                self.cancelled.insert(order.id, order);
            }
            OrderStatus::Filled => self.forget_order(order.id),
        }
    }

    pub fn open_orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.values().filter(|o| o.status.is_resting())
    }

    pub fn has_resting_order_at(&self, side: OrderSide, grid_price: f64) -> bool {
        let key = price_key(grid_price);
        self.open_orders()
            .any(|o| o.side == side && price_key(o.grid_price) == key)
    }

    pub fn has_resting_sell_for(&self, position_id: &Uuid) -> bool {
        self.open_orders()
            .any(|o| o.side == OrderSide::Sell && o.position_id.as_ref() == Some(position_id))
    }

    pub fn count_resting(&self, side: OrderSide) -> usize {
        self.open_orders().filter(|o| o.side == side).count()
    }

    // ---- modifiers -------------------------------------------------------

    pub fn modifier(&self, side: OrderSide, grid_price: f64) -> Option<f64> {
        self.modifiers.get(side, grid_price)
    }

    pub fn set_modifier(&mut self, side: OrderSide, grid_price: f64, modifier: f64) {
        self.modifiers.set(side, grid_price, modifier);
    }

    /// Get-or-derive the modifier for the next order on a line
    pub fn next_modifier(&mut self, side: OrderSide, grid_price: f64) -> f64 {
        self.modifiers.next_for(side, grid_price)
    }

    pub fn clear_modifiers(&mut self) {
        self.modifiers.clear();
    }

    // ---- bootstrap slot --------------------------------------------------

    pub fn bootstrap(&self) -> Option<&BootstrapOrder> {
        self.bootstrap.as_ref()
    }

    pub fn set_bootstrap(&mut self, bootstrap: BootstrapOrder) {
        self.bootstrap = Some(bootstrap);
    }

    /// Empty the slot, returning what it held
    pub fn take_bootstrap(&mut self) -> Option<BootstrapOrder> {
        self.bootstrap.take()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::grid::ladder::define_grid;
    use crate::grid::tiers::OrderSizeTier;
    use crate::grid::types::{BootstrapMeta, OrderRequest, TimeInForce};
    use chrono::Utc;

    pub(crate) fn sample_strategy() -> Strategy {
        Strategy {
            id: 1,
            asset: "ETH".into(),
            enabled: true,
            grid: define_grid(3000.0, 5000.0, 6).unwrap(),
            min_price: 3000.0,
            max_price: 5000.0,
            margin: 1000.0,
            balance: 1000.0,
            realized_pnl: 0.0,
            total_fees: 0.0,
            total_funding: 0.0,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    pub(crate) fn sample_tiers() -> TierTable {
        TierTable::new(vec![
            OrderSizeTier::new(3000.0, 4000.0, 30.0),
            OrderSizeTier::new(4000.0, 5000.0, 20.0),
        ])
    }

    pub(crate) fn sample_mirror() -> StateMirror {
        StateMirror::new(sample_strategy(), sample_tiers()).unwrap()
    }

    #[test]
    fn test_balance_delta_keeps_ledger_invariant() {
        let mut mirror = sample_mirror();
        mirror.apply_delta(LedgerDelta::trade(4.05, 0.02));
        mirror.apply_delta(LedgerDelta::fee(0.01));
        mirror.apply_delta(LedgerDelta::funding(-0.5));

        let strategy = mirror.strategy();
        assert!((mirror.balance() - (1000.0 + 4.05 - 0.03 - 0.5)).abs() < 1e-9);
        assert!((strategy.ledger_balance() - strategy.balance).abs() < 1e-9);
    }

    #[test]
    fn test_open_queries() {
        let mut mirror = sample_mirror();
        let position = Position::open(1, 0.01, 3800.0, 3795.0, 4200.0);
        let position_id = position.id;
        mirror.upsert_position(position);

        let sell = OrderRequest::new(OrderSide::Sell, 4200.0, 4200.0, 0.01).closing(position_id);
        mirror.upsert_order(Order::placed(7, 1, &sell));

        assert!(mirror.has_open_position_at(3800.0));
        assert!(!mirror.has_open_position_at(3400.0));
        assert!(mirror.has_resting_order_at(OrderSide::Sell, 4200.0));
        assert!(!mirror.has_resting_order_at(OrderSide::Buy, 4200.0));
        assert!(mirror.has_resting_sell_for(&position_id));
        assert_eq!(mirror.count_resting(OrderSide::Sell), 1);
        assert_eq!(mirror.size_for_grid(4600.0), 20.0);
    }

    #[test]
    fn test_rebuild_restores_bootstrap_slot_and_skips_terminal_rows() {
        let meta = BootstrapMeta {
            initial_price: 4107.0,
            number_of_positions: 2,
        };
        let request = OrderRequest::new(OrderSide::Buy, 4107.0, 4127.0, 0.0097)
            .with_tif(TimeInForce::Ioc)
            .bootstrap(meta);
        let bootstrap = Order::placed(11, 1, &request);
        let filled = Order::placed(12, 1, &OrderRequest::new(OrderSide::Buy, 3800.0, 3800.0, 0.01))
            .with_status(OrderStatus::Filled);
        let closed = Position::open(1, 0.01, 3400.0, 3400.0, 3800.0).closed(3800.0, 4.0);

        let mirror = StateMirror::rebuild(
            sample_strategy(),
            sample_tiers(),
            vec![closed],
            vec![bootstrap, filled],
        )
        .unwrap();

        assert_eq!(mirror.bootstrap(), Some(&BootstrapOrder { oid: 11, meta }));
        assert_eq!(mirror.open_orders().count(), 1);
        assert_eq!(mirror.open_positions().count(), 0);
    }

    #[test]
    fn test_record_order_routes_by_status() {
        let mut mirror = sample_mirror();
        let order = Order::placed(9, 1, &OrderRequest::new(OrderSide::Buy, 3800.0, 3800.0, 0.02));
        mirror.upsert_order(order.clone());

        mirror.record_order(order.with_fill(0.01, 3800.0, 0.0));
        assert_eq!(mirror.order(9).unwrap().status, OrderStatus::PartiallyFilled);

        let cancelled = mirror.order(9).unwrap().with_status(OrderStatus::Cancelled);
        mirror.retire_cancelled(vec![cancelled]);
        assert!(mirror.order(9).is_none());
        assert!(mirror.cancelled_order(9).is_some());
        assert_eq!(mirror.open_orders().count(), 0);

        mirror.record_order(order.with_fill(0.02, 3800.0, 0.0));
        assert!(mirror.cancelled_order(9).is_none());
        assert!(mirror.order(9).is_none());
    }

    #[test]
    fn test_take_bootstrap_is_single_shot() {
        let mut mirror = sample_mirror();
        mirror.set_bootstrap(BootstrapOrder {
            oid: 3,
            meta: BootstrapMeta {
                initial_price: 4107.0,
                number_of_positions: 2,
            },
        });
        assert!(mirror.take_bootstrap().is_some());
        assert!(mirror.take_bootstrap().is_none());
    }

    #[test]
    fn test_modifier_passthrough() {
        let mut mirror = sample_mirror();
        assert_eq!(mirror.next_modifier(OrderSide::Buy, 3800.0), 0.0);
        mirror.set_modifier(OrderSide::Buy, 3400.0, 1.2);
        assert_eq!(mirror.modifier(OrderSide::Buy, 3400.0), Some(1.2));
        mirror.clear_modifiers();
        assert_eq!(mirror.modifier(OrderSide::Buy, 3400.0), None);
    }
}
