//! Target selection - which grid lines need a resting BUY and which open
//! positions need a resting SELL. Pure reads over the mirror.

use super::state::StateMirror;
use super::types::{BuyTarget, OrderSide, SellTarget};

/// Nearest free lines strictly below market, scanned downward.
///
/// A line is free when it holds neither an OPENED position nor a resting BUY.
/// Lines whose tier size is 0 are skipped.
pub fn find_buy_targets(state: &StateMirror, current_price: f64, limit: usize) -> Vec<BuyTarget> {
    let grid = state.grid();
    let upper = grid.index_at_or_above(current_price);

    let mut targets = Vec::with_capacity(limit);
    for grid_index in (0..upper).rev() {
        if targets.len() >= limit {
            break;
        }
        let price = match grid.price_at(grid_index) {
            Some(price) => price,
            None => continue,
        };
        if state.has_open_position_at(price) || state.has_resting_order_at(OrderSide::Buy, price) {
            continue;
        }
        let size = state.size_for_grid(price);
        if size > 0.0 {
            targets.push(BuyTarget {
                grid_index,
                price,
                size,
            });
        }
    }
    targets
}

/// OPENED positions lacking a resting SELL, lowest close line first
pub fn find_sell_targets(state: &StateMirror, limit: usize) -> Vec<SellTarget> {
    let mut open: Vec<_> = state.open_positions().collect();
    open.sort_by(|a, b| {
        a.grid_close_price
            .total_cmp(&b.grid_close_price)
            .then_with(|| a.opened_at.cmp(&b.opened_at))
    });

    open.into_iter()
        .filter(|p| !state.has_resting_sell_for(&p.id))
        .take(limit)
        .map(|p| SellTarget {
            position_id: p.id,
            price: p.grid_close_price,
            size: p.size,
        })
        .collect()
}
