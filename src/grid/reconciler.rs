//! Fill reconciler - turns exchange fills and funding into ledger changes
//! and keeps the resting order set in line with the grid.
//!
//! Every change is written to the store before the mirror is touched, so a
//! persistence failure leaves the in-memory state as it was.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use uuid::Uuid;

use super::config::EngineConfig;
use super::errors::{GridError, GridResult};
use super::executor::{with_timeout, GridExchange};
use super::ladder::{floor_to, Grid, PRICE_EPSILON};
use super::modifier::apply_modifier;
use super::selector::{find_buy_targets, find_sell_targets};
use super::state::{LedgerDelta, StateMirror};
use super::store::{GridStore, WriteBatch};
use super::tiers::TierTable;
use super::types::{
    BootstrapMeta, BootstrapOrder, FillBatch, FillEvent, FundingEntry, FundingPayment,
    GridStateSummary, Order, OrderRequest, OrderSide, OrderStatus, OrderType, Position,
    TimeInForce,
};

/// Decimals used for bootstrap position shares
const BOOTSTRAP_SHARE_DECIMALS: u32 = 4;

/// Fills of one order id within a batch, merged
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedFill {
    pub oid: u64,
    pub side: OrderSide,
    pub size: f64,
    /// Size-weighted average price
    pub price: f64,
    pub fee: f64,
    pub trade_ids: Vec<u64>,
}

/// Group fills by order id in first-appearance order
pub fn aggregate_fills(fills: &[FillEvent]) -> Vec<AggregatedFill> {
    let mut groups: Vec<AggregatedFill> = Vec::new();
    let mut index: HashMap<u64, usize> = HashMap::new();
    let mut notional: Vec<f64> = Vec::new();

    for fill in fills {
        match index.get(&fill.oid) {
            Some(&i) => {
                let group = &mut groups[i];
                group.size += fill.size;
                group.fee += fill.fee;
                group.trade_ids.push(fill.trade_id);
                notional[i] += fill.price * fill.size;
            }
            None => {
                index.insert(fill.oid, groups.len());
                notional.push(fill.price * fill.size);
                groups.push(AggregatedFill {
                    oid: fill.oid,
                    side: fill.side,
                    size: fill.size,
                    price: fill.price,
                    fee: fill.fee,
                    trade_ids: vec![fill.trade_id],
                });
            }
        }
    }

    for (group, notional) in groups.iter_mut().zip(notional) {
        if group.size > 0.0 {
            group.price = notional / group.size;
        }
    }
    groups
}

/// Lines a bootstrap at `current_price` covers and their summed tier size.
///
/// Returns `(start_index, line_count, notional)`.
pub fn bootstrap_plan(grid: &Grid, tiers: &TierTable, current_price: f64) -> (usize, usize, f64) {
    let start = grid.upper_grid_index(current_price);
    let lines = &grid.lines()[start..];
    let notional: f64 = lines.iter().map(|&line| tiers.size_for(line)).sum();
    (start, lines.len(), notional)
}

/// Split a bootstrap fill across the lines at and above the upper grid
/// index of `initial_price`, proportional to tier size.
///
/// Shares are floored to 4 decimals and what flooring leaves over goes to
/// the nearest line, so the whole fill stays on the ledger. A line whose
/// share is zero gets no position.
pub fn distribute_bootstrap(
    grid: &Grid,
    tiers: &TierTable,
    strategy_id: u64,
    initial_price: f64,
    fill_size: f64,
    fill_price: f64,
) -> Vec<Position> {
    let start = grid.upper_grid_index(initial_price);
    let count = grid.len() - start;
    if count == 0 {
        return Vec::new();
    }

    let weights: Vec<f64> = grid.lines()[start..]
        .iter()
        .map(|&line| tiers.size_for(line))
        .collect();
    let total_weight: f64 = weights.iter().sum();

    let mut sizes: Vec<f64> = weights
        .iter()
        .map(|weight| {
            let share = if total_weight > 0.0 {
                fill_size * weight / total_weight
            } else {
                fill_size / count as f64
            };
            floor_to(share, BOOTSTRAP_SHARE_DECIMALS)
        })
        .collect();
    let residual = fill_size - sizes.iter().sum::<f64>();
    if residual > PRICE_EPSILON {
        sizes[0] = round_size(sizes[0] + residual);
    }

    let mut positions = Vec::with_capacity(count);
    for (offset, size) in sizes.into_iter().enumerate() {
        let index = start + offset;
        if size <= 0.0 {
            continue;
        }
        let line = grid.lines()[index];
        positions.push(Position::open(
            strategy_id,
            size,
            line,
            fill_price,
            grid.close_line_for(index),
        ));
    }
    positions
}

fn round_price(price: f64) -> f64 {
    (price * 100.0).round() / 100.0
}

/// Strip float noise from a summed size
fn round_size(size: f64) -> f64 {
    (size * 1e8).round() / 1e8
}

/// What a fill group did to the ledger
#[derive(Debug, Clone, PartialEq)]
pub enum FillOutcome {
    Bootstrapped { oid: u64, positions: usize },
    Opened { oid: u64, position_id: Uuid, grid_price: f64 },
    /// Sell filled short of the position; the rest stays open
    Reduced { oid: u64, position_id: Uuid, pnl: f64, remaining: f64 },
    Closed { oid: u64, position_id: Uuid, pnl: f64 },
}

/// Result of handling one fill batch
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub outcomes: Vec<FillOutcome>,
    pub duplicates: usize,
    pub dropped: usize,
    pub synced: Option<SyncReport>,
}

/// Result of one synchronization pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub cancelled: usize,
    pub buys_placed: usize,
    pub sells_placed: usize,
}

/// Recently seen trade ids, bounded
#[derive(Debug)]
struct TradeDedup {
    seen: HashSet<u64>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl TradeDedup {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, trade_id: u64) -> bool {
        self.seen.contains(&trade_id)
    }

    fn remember(&mut self, trade_id: u64) {
        if !self.seen.insert(trade_id) {
            return;
        }
        self.order.push_back(trade_id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
    }
}

/// Owns the state mirror and applies every event to it.
///
/// Not shared: the runner task holds the only instance.
pub struct Reconciler<E: GridExchange, S: GridStore> {
    config: EngineConfig,
    state: StateMirror,
    exchange: Arc<E>,
    store: Arc<S>,
    dedup: TradeDedup,
    last_price: Option<f64>,
    /// Last sync failed or went out without a price for buys
    resync_needed: bool,
}

impl<E: GridExchange, S: GridStore> Reconciler<E, S> {
    pub fn new(config: EngineConfig, state: StateMirror, exchange: Arc<E>, store: Arc<S>) -> Self {
        let dedup = TradeDedup::new(config.dedup_capacity);
        Self {
            config,
            state,
            exchange,
            store,
            dedup,
            last_price: None,
            resync_needed: false,
        }
    }

    pub fn state(&self) -> &StateMirror {
        &self.state
    }

    #[cfg(test)]
    pub(crate) fn state_mut(&mut self) -> &mut StateMirror {
        &mut self.state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn last_price(&self) -> Option<f64> {
        self.last_price
    }

    /// A price tick should run a synchronization pass
    pub fn needs_resync(&self) -> bool {
        self.resync_needed
    }

    /// Bootstrap order still unfilled after `bootstrap_timeout_ms`
    pub fn bootstrap_expired(&self) -> bool {
        let placed_at = match self
            .state
            .bootstrap()
            .and_then(|slot| self.state.order(slot.oid))
        {
            Some(order) => order.created_at,
            None => return false,
        };
        let age = Utc::now().signed_duration_since(placed_at).num_milliseconds();
        age >= 0 && age as u64 >= self.config.bootstrap_timeout_ms
    }

    /// Record the latest market price
    pub fn update_price(&mut self, price: f64) {
        if price.is_finite() && price > 0.0 {
            self.last_price = Some(price);
        } else {
            warn!("Ignoring invalid price tick: {}", price);
        }
    }

    // ---- fills -----------------------------------------------------------

    /// Apply a batch of fills, then run one synchronization pass if anything
    /// changed.
    pub async fn handle_fill_batch(&mut self, batch: &FillBatch) -> GridResult<BatchReport> {
        let mut report = BatchReport::default();

        if batch.is_snapshot {
            debug!("Ignoring fill snapshot with {} fills", batch.fills.len());
            return Ok(report);
        }

        let mut in_batch = HashSet::new();
        let fresh: Vec<FillEvent> = batch
            .fills
            .iter()
            .filter(|fill| !self.dedup.contains(fill.trade_id) && in_batch.insert(fill.trade_id))
            .cloned()
            .collect();
        report.duplicates = batch.fills.len() - fresh.len();
        if report.duplicates > 0 {
            info!("Skipping {} already processed fills", report.duplicates);
        }

        for group in aggregate_fills(&fresh) {
            match self.apply_fill(&group).await {
                Ok(outcome) => report.outcomes.push(outcome),
                Err(GridError::Reconciliation { oid, reason }) => {
                    warn!("Dropping fill for oid={}: {}", oid, reason);
                    report.dropped += 1;
                }
                Err(e) => {
                    error!("Failed to apply fill for oid={}: {}", group.oid, e);
                    return Err(e);
                }
            }
            for trade_id in &group.trade_ids {
                self.dedup.remember(*trade_id);
            }
        }

        if !report.outcomes.is_empty() {
            report.synced = Some(self.synchronize().await?);
        }
        Ok(report)
    }

    async fn apply_fill(&mut self, fill: &AggregatedFill) -> GridResult<FillOutcome> {
        let (order, late) = match (self.state.order(fill.oid), self.state.cancelled_order(fill.oid)) {
            (Some(order), _) => (order.clone(), false),
            (None, Some(order)) => (order.clone(), true),
            (None, None) => {
                return Err(GridError::Reconciliation {
                    oid: fill.oid,
                    reason: "unknown order".into(),
                })
            }
        };

        if !late && !order.status.is_resting() {
            return Err(GridError::Reconciliation {
                oid: fill.oid,
                reason: format!("order already {:?}", order.status),
            });
        }
        if order.side != fill.side {
            return Err(GridError::Reconciliation {
                oid: fill.oid,
                reason: format!("fill side {:?} does not match order side {:?}", fill.side, order.side),
            });
        }
        if late {
            warn!(
                "Fill for oid={} arrived after it was cancelled, applying {} at {}",
                fill.oid, fill.size, fill.price
            );
        }

        info!(
            "Fill received: oid={}, side={}, grid={}, price={}, size={}, fee={}",
            fill.oid,
            fill.side.as_str(),
            order.grid_price,
            fill.price,
            fill.size,
            fill.fee
        );

        match (order.order_type, order.side) {
            (OrderType::InitialPositionsBuyUp, _) => self.apply_bootstrap_fill(order, fill, late).await,
            (OrderType::Regular, OrderSide::Buy) => self.apply_buy_fill(order, fill, late).await,
            (OrderType::Regular, OrderSide::Sell) => self.apply_sell_fill(order, fill, late).await,
        }
    }

    /// Order row with `fill` accumulated. A cancelled order that was not
    /// completed by a racing fill stays CANCELLED.
    fn filled_order(order: &Order, fill: &AggregatedFill, late: bool) -> Order {
        let mut row = order.with_fill(fill.size, fill.price, fill.fee);
        if late && row.status != OrderStatus::Filled {
            row.status = OrderStatus::Cancelled;
        }
        row
    }

    async fn apply_bootstrap_fill(
        &mut self,
        order: Order,
        fill: &AggregatedFill,
        late: bool,
    ) -> GridResult<FillOutcome> {
        let meta = match (self.state.bootstrap(), order.bootstrap) {
            (Some(slot), _) if slot.oid == order.id => slot.meta,
            // Cancelled bootstrap filled anyway; only usable while nothing replaced it
            (None, Some(meta)) if late && self.state.open_positions().next().is_none() => meta,
            _ => {
                return Err(GridError::Reconciliation {
                    oid: order.id,
                    reason: "bootstrap already distributed".into(),
                })
            }
        };

        let positions = distribute_bootstrap(
            self.state.grid(),
            self.state.tiers(),
            self.state.strategy().id,
            meta.initial_price,
            fill.size,
            fill.price,
        );
        if positions.is_empty() {
            error!(
                "Bootstrap fill of {} for oid={} could not be split above {}",
                fill.size, order.id, meta.initial_price
            );
        } else if positions.len() != meta.number_of_positions {
            warn!(
                "Bootstrap expected {} positions, created {}",
                meta.number_of_positions,
                positions.len()
            );
        }

        // The bootstrap is one-shot: whatever arrived closes it
        let row = order
            .with_fill(fill.size, fill.price, fill.fee)
            .with_status(OrderStatus::Filled);
        let strategy = self.state.strategy_with(LedgerDelta::fee(fill.fee));
        self.store
            .commit(
                WriteBatch::new()
                    .strategy(strategy.clone())
                    .positions(positions.clone())
                    .order(row),
            )
            .await?;

        let count = positions.len();
        if self.state.bootstrap().map(|slot| slot.oid) == Some(order.id) {
            self.state.take_bootstrap();
        }
        for position in positions {
            info!(
                "Bootstrap position opened: grid={}, close={}, size={}",
                position.grid_open_price, position.grid_close_price, position.size
            );
            self.state.upsert_position(position);
        }
        self.state.forget_order(order.id);
        self.state.replace_strategy(strategy);

        Ok(FillOutcome::Bootstrapped {
            oid: order.id,
            positions: count,
        })
    }

    async fn apply_buy_fill(
        &mut self,
        order: Order,
        fill: &AggregatedFill,
        late: bool,
    ) -> GridResult<FillOutcome> {
        let (index, line) = match self.state.grid().line_at_or_below(order.grid_price) {
            Some(found) => found,
            None => {
                return Err(GridError::Reconciliation {
                    oid: order.id,
                    reason: format!("no grid line at or below {}", order.grid_price),
                })
            }
        };

        // Earlier fills of this order, then any position already on the line
        let existing = order
            .position_id
            .and_then(|id| self.state.position(&id))
            .filter(|p| p.is_open())
            .or_else(|| self.state.open_position_at(line))
            .cloned();
        let position = match existing {
            Some(existing) => {
                if order.position_id != Some(existing.id) {
                    warn!(
                        "Grid line {} already holds position {}, merging fill oid={} size={} price={}",
                        line, existing.id, order.id, fill.size, fill.price
                    );
                }
                existing.increased(fill.size, fill.price)
            }
            None => Position::open(
                self.state.strategy().id,
                fill.size,
                line,
                fill.price,
                self.state.grid().close_line_for(index),
            ),
        };

        let mut row = Self::filled_order(&order, fill, late);
        row.position_id = Some(position.id);
        if row.status != OrderStatus::Filled {
            info!(
                "Order {} filled {} of {} so far",
                order.id, row.filled_size, order.size
            );
        }
        let strategy = self.state.strategy_with(LedgerDelta::fee(fill.fee));

        self.store
            .commit(
                WriteBatch::new()
                    .strategy(strategy.clone())
                    .position(position.clone())
                    .order(row.clone()),
            )
            .await?;

        let position_id = position.id;
        info!(
            "Position opened: grid={}, avg={}, close={}, size={}",
            position.grid_open_price, position.avg_open_price, position.grid_close_price, position.size
        );
        self.state.upsert_position(position);
        self.state.record_order(row);
        self.state.replace_strategy(strategy);

        Ok(FillOutcome::Opened {
            oid: order.id,
            position_id,
            grid_price: line,
        })
    }

    async fn apply_sell_fill(
        &mut self,
        order: Order,
        fill: &AggregatedFill,
        late: bool,
    ) -> GridResult<FillOutcome> {
        let position = match order.position_id.and_then(|id| self.state.position(&id)) {
            Some(position) if position.is_open() => position.clone(),
            _ => {
                return Err(GridError::Reconciliation {
                    oid: order.id,
                    reason: "sell has no open position linked".into(),
                })
            }
        };
        if fill.size > position.size + PRICE_EPSILON {
            warn!(
                "Sell {} filled {} against position size {}",
                order.id, fill.size, position.size
            );
        }

        let pnl = position.pnl_at(fill.price, fill.size);
        let remaining = position.size - fill.size;
        let mut row = Self::filled_order(&order, fill, late);
        row.closed_pnl = Some(order.closed_pnl.unwrap_or(0.0) + pnl);
        let close_price = row.average_price.unwrap_or(fill.price);
        let updated = if remaining > PRICE_EPSILON {
            position.reduced(fill.size, close_price, pnl)
        } else {
            position.closed(close_price, pnl)
        };
        let strategy = self.state.strategy_with(LedgerDelta::trade(pnl, fill.fee));

        self.store
            .commit(
                WriteBatch::new()
                    .strategy(strategy.clone())
                    .position(updated.clone())
                    .order(row.clone()),
            )
            .await?;

        self.state.record_order(row);
        self.state.replace_strategy(strategy.clone());
        if updated.is_open() {
            info!(
                "Position reduced: grid={}, sold={} at {}, left={}, pnl={:.4}, balance={:.4}",
                position.grid_open_price, fill.size, fill.price, updated.size, pnl, strategy.balance
            );
            self.state.upsert_position(updated);
            return Ok(FillOutcome::Reduced {
                oid: order.id,
                position_id: position.id,
                pnl,
                remaining,
            });
        }

        info!(
            "Position closed: grid={} -> {}, pnl={:.4}, fee={}, balance={:.4}",
            position.grid_open_price, fill.price, pnl, fill.fee, strategy.balance
        );
        self.state.remove_position(&position.id);

        Ok(FillOutcome::Closed {
            oid: order.id,
            position_id: position.id,
            pnl,
        })
    }

    // ---- funding ---------------------------------------------------------

    /// Book a funding payment and reset every price modifier
    pub async fn handle_funding(&mut self, payment: &FundingPayment) -> GridResult<()> {
        let strategy = self.state.strategy_with(LedgerDelta::funding(payment.amount));
        let entry = FundingEntry {
            strategy_id: strategy.id,
            amount: payment.amount,
            rate: payment.rate,
            time: payment.time,
        };
        self.store
            .commit(WriteBatch::new().strategy(strategy.clone()).funding(entry))
            .await?;

        info!(
            "Funding applied: amount={}, rate={}, balance={:.4}",
            payment.amount, payment.rate, strategy.balance
        );
        self.state.replace_strategy(strategy);
        self.state.clear_modifiers();
        Ok(())
    }

    // ---- synchronization -------------------------------------------------

    /// Cancel every resting order on the exchange and mark them CANCELLED
    pub async fn cancel_resting_orders(&mut self) -> GridResult<usize> {
        let cancelled = with_timeout(self.config.exchange_timeout_ms, self.exchange.cancel_all_orders()).await?;
        debug!("Exchange cancelled {} orders", cancelled);

        let rows: Vec<Order> = self
            .state
            .open_orders()
            .map(|o| o.with_status(OrderStatus::Cancelled))
            .collect();
        if rows.is_empty() {
            return Ok(0);
        }

        let mut batch = WriteBatch::new();
        for row in &rows {
            batch = batch.order(row.clone());
        }
        self.store.commit(batch).await?;

        let count = rows.len();
        if let Some(slot) = self.state.bootstrap().copied() {
            if rows.iter().any(|row| row.id == slot.oid) {
                self.state.take_bootstrap();
            }
        }
        self.state.retire_cancelled(rows);
        Ok(count)
    }

    /// The exchange reports an order gone from the book (cancelled or
    /// expired) with no further fills coming
    pub async fn handle_order_cancelled(&mut self, oid: u64) -> GridResult<()> {
        let order = match self.state.order(oid) {
            Some(order) => order.clone(),
            None => {
                debug!("Cancel notice for untracked order {}", oid);
                self.state.forget_order(oid);
                return Ok(());
            }
        };

        let row = order.with_status(OrderStatus::Cancelled);
        self.store.save_order(&row).await?;
        self.state.forget_order(oid);

        if self.state.bootstrap().map(|slot| slot.oid) == Some(oid) {
            self.state.take_bootstrap();
            warn!("Bootstrap order {} left the book unfilled", oid);
        } else {
            info!("Order {} cancelled by the exchange", oid);
            self.resync_needed = true;
        }
        Ok(())
    }

    /// Replace the resting order set with one derived from current state.
    ///
    /// A failed cancel aborts before anything changes; a failed placement
    /// aborts the rest of the pass. Both are retried on the next trigger.
    pub async fn synchronize(&mut self) -> GridResult<SyncReport> {
        let mut report = SyncReport::default();

        if !self.state.strategy().enabled {
            debug!("Strategy disabled, skipping sync");
            return Ok(report);
        }
        if let Some(slot) = self.state.bootstrap() {
            debug!("Bootstrap order {} pending, skipping sync", slot.oid);
            return Ok(report);
        }

        self.resync_needed = true;
        report.cancelled = match self.cancel_resting_orders().await {
            Ok(count) => count,
            Err(e) => {
                warn!("Cancel failed, sync aborted: {}", e);
                return Err(e);
            }
        };

        let buys = match self.last_price {
            Some(price) => find_buy_targets(&self.state, price, self.config.buy_order_limit),
            None => {
                debug!("No market price yet, skipping buy targets");
                Vec::new()
            }
        };
        let sells = find_sell_targets(&self.state, self.config.sell_order_limit);
        let step = self.state.grid().step();

        for target in buys {
            let modifier = self.state.next_modifier(OrderSide::Buy, target.price);
            let limit_price = apply_modifier(OrderSide::Buy, target.price, modifier, step);
            let size = floor_to(target.size / limit_price, self.config.size_decimals);
            if size <= 0.0 {
                debug!("Buy at {} rounds to zero size, skipped", target.price);
                continue;
            }
            let request = OrderRequest::new(OrderSide::Buy, target.price, limit_price, size);
            self.place_and_record(&request).await?;
            report.buys_placed += 1;
        }

        for target in sells {
            let modifier = self.state.next_modifier(OrderSide::Sell, target.price);
            let limit_price = apply_modifier(OrderSide::Sell, target.price, modifier, step);
            let request =
                OrderRequest::new(OrderSide::Sell, target.price, limit_price, target.size).closing(target.position_id);
            self.place_and_record(&request).await?;
            report.sells_placed += 1;
        }

        self.resync_needed = self.last_price.is_none();
        info!(
            "Sync complete: cancelled={}, buys={}, sells={}",
            report.cancelled, report.buys_placed, report.sells_placed
        );
        Ok(report)
    }

    async fn place_and_record(&mut self, request: &OrderRequest) -> GridResult<u64> {
        debug!(
            "Placing {} at grid {} limit {} size {}",
            request.side.as_str(),
            request.grid_price,
            request.limit_price,
            request.size
        );
        let oid = match with_timeout(self.config.exchange_timeout_ms, self.exchange.place_order(request)).await {
            Ok(oid) => oid,
            Err(e) => {
                warn!(
                    "Placement at grid {} failed, sync aborted: {}",
                    request.grid_price, e
                );
                return Err(e);
            }
        };

        let order = Order::placed(oid, self.state.strategy().id, request);
        self.store.save_order(&order).await?;
        self.state.upsert_order(order);
        info!(
            "Order placed: oid={}, side={}, grid={}, limit={}",
            oid,
            request.side.as_str(),
            request.grid_price,
            request.limit_price
        );
        Ok(oid)
    }

    // ---- bootstrap -------------------------------------------------------

    /// Acquire the positions implied by grid lines above market.
    ///
    /// Returns the bootstrap oid, or `None` when nothing needed buying.
    pub async fn bootstrap(&mut self, current_price: f64) -> GridResult<Option<u64>> {
        if self.state.open_positions().next().is_some() {
            debug!("Open positions exist, no bootstrap needed");
            return Ok(None);
        }
        if let Some(slot) = self.state.bootstrap() {
            info!("Bootstrap order {} already pending", slot.oid);
            return Ok(None);
        }

        let (start, count, notional) = bootstrap_plan(self.state.grid(), self.state.tiers(), current_price);
        if notional <= 0.0 {
            info!(
                "Nothing to bootstrap at {} (upper index {}, {} lines)",
                current_price, start, count
            );
            return Ok(None);
        }

        let size = floor_to(notional / current_price, BOOTSTRAP_SHARE_DECIMALS);
        if size <= 0.0 {
            info!("Bootstrap notional {} rounds to zero size at {}", notional, current_price);
            return Ok(None);
        }
        let limit_price = round_price(current_price * (1.0 + self.config.bootstrap_slippage));
        let meta = BootstrapMeta {
            initial_price: current_price,
            number_of_positions: count,
        };
        let request = OrderRequest::new(OrderSide::Buy, current_price, limit_price, size)
            .with_tif(TimeInForce::Ioc)
            .bootstrap(meta);

        info!(
            "Placing bootstrap buy: price={}, limit={}, size={}, lines={}, notional={}",
            current_price, limit_price, size, count, notional
        );

        let max_attempts = self.config.max_bootstrap_retries;
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            match with_timeout(self.config.exchange_timeout_ms, self.exchange.place_order(&request)).await {
                Ok(oid) => {
                    let order = Order::placed(oid, self.state.strategy().id, &request);
                    self.store.save_order(&order).await?;
                    self.state.upsert_order(order);
                    self.state.set_bootstrap(BootstrapOrder { oid, meta });
                    info!("Bootstrap order placed: oid={}, attempt={}", oid, attempt);
                    return Ok(Some(oid));
                }
                Err(e) => {
                    warn!(
                        "Bootstrap placement attempt {}/{} failed: {}",
                        attempt, max_attempts, e
                    );
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        let delay = self.config.retry_delay_ms(attempt);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                }
            }
        }

        error!("Bootstrap gave up after {} attempts", max_attempts);
        Err(GridError::OrderPlacementFailed {
            attempts: max_attempts,
            reason: last_error,
        })
    }

    // ---- activation ------------------------------------------------------

    /// Persist the enabled flag, then mirror it
    pub async fn set_enabled(&mut self, enabled: bool) -> GridResult<()> {
        let mut strategy = self.state.strategy().clone();
        strategy.enabled = enabled;
        self.store.save_strategy(&strategy).await?;
        self.state.replace_strategy(strategy);
        info!("Strategy {} enabled={}", self.state.strategy().id, enabled);
        Ok(())
    }

    /// Snapshot of the ledger, marked to `current_price` when given
    pub fn summary(&self, current_price: Option<f64>) -> GridStateSummary {
        let strategy = self.state.strategy();
        let price = current_price.or(self.last_price);
        let (open_positions, open_size, unrealized_pnl) =
            self.state
                .open_positions()
                .fold((0usize, 0.0, 0.0), |(count, size, pnl), p| {
                    let mark = price.map(|px| p.pnl_at(px, p.size)).unwrap_or(0.0);
                    (count + 1, size + p.size, pnl + mark)
                });

        GridStateSummary {
            strategy_id: strategy.id,
            enabled: strategy.enabled,
            balance: strategy.balance,
            realized_pnl: strategy.realized_pnl,
            total_fees: strategy.total_fees,
            total_funding: strategy.total_funding,
            open_positions,
            open_size,
            resting_buys: self.state.count_resting(OrderSide::Buy),
            resting_sells: self.state.count_resting(OrderSide::Sell),
            bootstrap_pending: self.state.bootstrap().is_some(),
            unrealized_pnl,
        }
    }
}
