//! Core data types for grid reconciliation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// Convert to exchange side string
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl From<&str> for OrderSide {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "B" | "BUY" => OrderSide::Buy,
            _ => OrderSide::Sell,
        }
    }
}

/// Lifecycle of a virtual position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Opened,
    Closed,
}

/// Lifecycle of an exchange order as tracked locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Opened,
    Cancelled,
    Filled,
    PartiallyFilled,
}

impl OrderStatus {
    /// Order may still receive fills
    pub fn is_resting(&self) -> bool {
        matches!(self, OrderStatus::Opened | OrderStatus::PartiallyFilled)
    }
}

/// What an order was placed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    /// Grid buy below market or grid sell closing a position
    #[default]
    Regular,
    /// One-time buy acquiring every position above market at activation
    InitialPositionsBuyUp,
}

/// Time in force for limit orders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TimeInForce {
    /// Good til cancelled
    #[default]
    Gtc,
    /// Immediate or cancel
    Ioc,
    /// Add liquidity only
    Alo,
}

/// Strategy row: grid, capital and running ledger totals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: u64,
    pub asset: String,
    pub enabled: bool,
    /// Strictly ascending grid line prices
    pub grid: Vec<f64>,
    pub min_price: f64,
    pub max_price: f64,
    /// Capital allocated at creation
    pub margin: f64,
    /// margin + realized_pnl - total_fees + total_funding
    pub balance: f64,
    #[serde(default)]
    pub realized_pnl: f64,
    #[serde(default)]
    pub total_fees: f64,
    #[serde(default)]
    pub total_funding: f64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Strategy {
    /// Balance recomputed from the ledger totals
    pub fn ledger_balance(&self) -> f64 {
        self.margin + self.realized_pnl - self.total_fees + self.total_funding
    }

    /// Soft-deleted strategies are never loaded for trading
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Virtual position bought on one grid line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub strategy_id: u64,
    /// Size in base units
    pub size: f64,
    pub status: PositionStatus,
    /// Grid line the position was bought on
    pub grid_open_price: f64,
    /// Actual fill price
    pub avg_open_price: f64,
    /// Next grid line up, fixed at open time
    pub grid_close_price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_close_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realized_pnl: Option<f64>,
    pub opened_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    /// Create a new OPENED position
    pub fn open(
        strategy_id: u64,
        size: f64,
        grid_open_price: f64,
        avg_open_price: f64,
        grid_close_price: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            strategy_id,
            size,
            status: PositionStatus::Opened,
            grid_open_price,
            avg_open_price,
            grid_close_price,
            avg_close_price: None,
            realized_pnl: None,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Opened
    }

    /// PnL of selling `size` of this position at `price`
    pub fn pnl_at(&self, price: f64, size: f64) -> f64 {
        (price - self.avg_open_price) * size
    }

    /// Copy of this position marked CLOSED at `price`, adding `pnl` to
    /// whatever was realized by earlier partial sells
    pub fn closed(&self, price: f64, pnl: f64) -> Self {
        let mut closed = self.clone();
        closed.status = PositionStatus::Closed;
        closed.avg_close_price = Some(price);
        closed.realized_pnl = Some(self.realized_pnl.unwrap_or(0.0) + pnl);
        closed.closed_at = Some(Utc::now());
        closed
    }

    /// Copy still OPENED with `sold` removed and `pnl` realized
    pub fn reduced(&self, sold: f64, price: f64, pnl: f64) -> Self {
        let mut reduced = self.clone();
        reduced.size = self.size - sold;
        reduced.avg_close_price = Some(price);
        reduced.realized_pnl = Some(self.realized_pnl.unwrap_or(0.0) + pnl);
        reduced
    }

    /// Copy grown by a further buy of `size` at `price`, size-weighted
    pub fn increased(&self, size: f64, price: f64) -> Self {
        let mut increased = self.clone();
        let total = self.size + size;
        if total > 0.0 {
            increased.avg_open_price = (self.avg_open_price * self.size + price * size) / total;
        }
        increased.size = total;
        increased
    }
}

/// Metadata recorded on the bootstrap order
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BootstrapMeta {
    /// Market price when the bootstrap order was placed
    pub initial_price: f64,
    /// Number of grid lines the fill is split across
    pub number_of_positions: usize,
}

/// Pending bootstrap order held in the single slot of the mirror
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BootstrapOrder {
    pub oid: u64,
    pub meta: BootstrapMeta,
}

/// Request to place an order
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub side: OrderSide,
    /// Grid line this order targets
    pub grid_price: f64,
    /// Price actually submitted (grid price shifted by the modifier)
    pub limit_price: f64,
    /// Size in base units
    pub size: f64,
    pub tif: TimeInForce,
    pub order_type: OrderType,
    /// Position a SELL closes
    pub position_id: Option<Uuid>,
    pub bootstrap: Option<BootstrapMeta>,
}

impl OrderRequest {
    /// Create a regular GTC order request
    pub fn new(side: OrderSide, grid_price: f64, limit_price: f64, size: f64) -> Self {
        Self {
            side,
            grid_price,
            limit_price,
            size,
            tif: TimeInForce::Gtc,
            order_type: OrderType::Regular,
            position_id: None,
            bootstrap: None,
        }
    }

    /// Builder: link the position a SELL closes
    pub fn closing(mut self, position_id: Uuid) -> Self {
        self.position_id = Some(position_id);
        self
    }

    /// Builder: set time in force
    pub fn with_tif(mut self, tif: TimeInForce) -> Self {
        self.tif = tif;
        self
    }

    /// Builder: mark as the bootstrap order
    pub fn bootstrap(mut self, meta: BootstrapMeta) -> Self {
        self.order_type = OrderType::InitialPositionsBuyUp;
        self.bootstrap = Some(meta);
        self
    }
}

/// Order row as tracked locally
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Exchange-assigned order id
    pub id: u64,
    pub strategy_id: u64,
    pub size: f64,
    pub side: OrderSide,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_id: Option<Uuid>,
    pub status: OrderStatus,
    pub order_type: OrderType,
    pub grid_price: f64,
    pub limit_price: f64,
    /// Cumulative size filled so far
    #[serde(default)]
    pub filled_size: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_price: Option<f64>,
    #[serde(default)]
    pub fee: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_pnl: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<BootstrapMeta>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Order row for an acknowledged placement
    pub fn placed(oid: u64, strategy_id: u64, request: &OrderRequest) -> Self {
        let now = Utc::now();
        Self {
            id: oid,
            strategy_id,
            size: request.size,
            side: request.side,
            position_id: request.position_id,
            status: OrderStatus::Opened,
            order_type: request.order_type,
            grid_price: request.grid_price,
            limit_price: request.limit_price,
            filled_size: 0.0,
            average_price: None,
            fee: 0.0,
            closed_pnl: None,
            bootstrap: request.bootstrap,
            created_at: now,
            updated_at: now,
        }
    }

    /// Copy with a new status and touched timestamp
    pub fn with_status(&self, status: OrderStatus) -> Self {
        let mut order = self.clone();
        order.status = status;
        order.updated_at = Utc::now();
        order
    }

    /// Copy with a further fill accumulated: size-weighted average price,
    /// summed fee, and FILLED once the whole size is done
    pub fn with_fill(&self, size: f64, price: f64, fee: f64) -> Self {
        let filled = self.filled_size + size;
        let status = if filled + 1e-9 < self.size {
            OrderStatus::PartiallyFilled
        } else {
            OrderStatus::Filled
        };
        let mut order = self.with_status(status);
        let previous = self.average_price.unwrap_or(price) * self.filled_size;
        if filled > 0.0 {
            order.average_price = Some((previous + price * size) / filled);
        }
        order.filled_size = filled;
        order.fee = self.fee + fee;
        order
    }

    /// Size still expected from the exchange
    pub fn remaining(&self) -> f64 {
        (self.size - self.filled_size).max(0.0)
    }
}

/// Single fill notification from the exchange
#[derive(Debug, Clone, PartialEq)]
pub struct FillEvent {
    /// Exchange trade id, unique per fill
    pub trade_id: u64,
    /// Exchange order ID
    pub oid: u64,
    pub side: OrderSide,
    pub price: f64,
    pub size: f64,
    pub fee: f64,
    /// Timestamp (ms)
    pub timestamp: u64,
}

/// Batch of fills delivered together
#[derive(Debug, Clone, Default)]
pub struct FillBatch {
    /// Initial snapshot replayed on subscription; ignored
    pub is_snapshot: bool,
    pub fills: Vec<FillEvent>,
}

impl FillBatch {
    pub fn new(fills: Vec<FillEvent>) -> Self {
        Self {
            is_snapshot: false,
            fills,
        }
    }
}

/// Funding payment notification (positive = received)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FundingPayment {
    pub amount: f64,
    pub rate: f64,
    pub time: u64,
}

/// Append-only funding ledger row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingEntry {
    pub strategy_id: u64,
    pub amount: f64,
    pub rate: f64,
    pub time: u64,
}

/// Events delivered by the account subscription
#[derive(Debug, Clone)]
pub enum AccountEvent {
    Fills(FillBatch),
    Funding(FundingPayment),
    /// Order left the book without filling further (cancelled, expired or
    /// an IOC that did not match)
    OrderCancelled(u64),
}

/// Grid line that needs a new resting BUY
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BuyTarget {
    pub grid_index: usize,
    pub price: f64,
    /// Notional size from the tier table
    pub size: f64,
}

/// Open position that needs a resting SELL
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SellTarget {
    pub position_id: Uuid,
    /// Stored close line of the position
    pub price: f64,
    /// Position size in base units
    pub size: f64,
}

/// Read snapshot for downstream metrics
#[derive(Debug, Clone)]
pub struct GridStateSummary {
    pub strategy_id: u64,
    pub enabled: bool,
    pub balance: f64,
    pub realized_pnl: f64,
    pub total_fees: f64,
    pub total_funding: f64,
    pub open_positions: usize,
    pub open_size: f64,
    pub resting_buys: usize,
    pub resting_sells: usize,
    pub bootstrap_pending: bool,
    pub unrealized_pnl: f64,
}
