//! Price escalation modifiers
//!
//! Repeated orders on the same grid line are shifted by a small percentage of
//! the grid spacing, away from market, so the exchange never sees two
//! consecutive same-side orders resting at an identical unmodified price.

use std::collections::HashMap;

use super::types::OrderSide;

/// Cap applied once five or more modifiers are recorded on a side
pub const MAX_MODIFIER: f64 = 1.5;

/// Hashable key for a grid price
pub fn price_key(price: f64) -> i64 {
    (price * 1e6).round() as i64
}

/// Modifier for a line given how many are already recorded on that side
pub fn derive_modifier(recorded: usize) -> f64 {
    match recorded {
        0 => 0.0,
        1..=4 => 1.0 + 0.1 * recorded as f64,
        _ => MAX_MODIFIER,
    }
}

/// Resting price for a grid line: buys move down, sells move up
pub fn apply_modifier(side: OrderSide, grid_price: f64, modifier: f64, grid_step: f64) -> f64 {
    let offset = grid_step * modifier / 100.0;
    let price = match side {
        OrderSide::Buy => grid_price - offset,
        OrderSide::Sell => grid_price + offset,
    };
    (price * 100.0).round() / 100.0
}

/// Per-side, per-grid-price modifier maps
#[derive(Debug, Clone, Default)]
pub struct PriceModifiers {
    buy: HashMap<i64, f64>,
    sell: HashMap<i64, f64>,
}

impl PriceModifiers {
    pub fn new() -> Self {
        Self::default()
    }

    fn side_map(&self, side: OrderSide) -> &HashMap<i64, f64> {
        match side {
            OrderSide::Buy => &self.buy,
            OrderSide::Sell => &self.sell,
        }
    }

    fn side_map_mut(&mut self, side: OrderSide) -> &mut HashMap<i64, f64> {
        match side {
            OrderSide::Buy => &mut self.buy,
            OrderSide::Sell => &mut self.sell,
        }
    }

    pub fn get(&self, side: OrderSide, grid_price: f64) -> Option<f64> {
        self.side_map(side).get(&price_key(grid_price)).copied()
    }

    pub fn set(&mut self, side: OrderSide, grid_price: f64, modifier: f64) {
        self.side_map_mut(side).insert(price_key(grid_price), modifier);
    }

    pub fn count(&self, side: OrderSide) -> usize {
        self.side_map(side).len()
    }

    /// Drop every recorded modifier on both sides
    pub fn clear(&mut self) {
        self.buy.clear();
        self.sell.clear();
    }

    /// Modifier to use for the next order on `grid_price`.
    ///
    /// An unrecorded line derives its value from the side's count. A repeat
    /// on a line still at 0 escalates, so the same line is never reused at
    /// its unmodified price twice in a row.
    pub fn next_for(&mut self, side: OrderSide, grid_price: f64) -> f64 {
        let modifier = match self.get(side, grid_price) {
            None => derive_modifier(self.count(side)),
            Some(current) if current == 0.0 => derive_modifier(self.count(side).max(1)),
            Some(current) => current,
        };
        self.set(side, grid_price, modifier);
        modifier
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_modifier_schedule() {
        assert_eq!(derive_modifier(0), 0.0);
        assert!((derive_modifier(1) - 1.1).abs() < 1e-12);
        assert!((derive_modifier(4) - 1.4).abs() < 1e-12);
        assert_eq!(derive_modifier(5), 1.5);
        assert_eq!(derive_modifier(50), 1.5);
    }

    #[test]
    fn test_apply_modifier_moves_away_from_market() {
        assert_eq!(apply_modifier(OrderSide::Buy, 3800.0, 1.1, 400.0), 3795.6);
        assert_eq!(apply_modifier(OrderSide::Sell, 4200.0, 1.5, 400.0), 4206.0);
        assert_eq!(apply_modifier(OrderSide::Buy, 3800.0, 0.0, 400.0), 3800.0);
    }

    #[test]
    fn test_first_line_unmodified_then_escalates() {
        let mut modifiers = PriceModifiers::new();

        assert_eq!(modifiers.next_for(OrderSide::Buy, 3800.0), 0.0);
        // Repeat on the same line must not stay unmodified
        let repeat = modifiers.next_for(OrderSide::Buy, 3800.0);
        assert!(repeat > 0.0);
        // Stable afterwards
        assert_eq!(modifiers.next_for(OrderSide::Buy, 3800.0), repeat);
    }

    #[test]
    fn test_new_lines_use_side_count() {
        let mut modifiers = PriceModifiers::new();
        modifiers.next_for(OrderSide::Sell, 4200.0);
        let second = modifiers.next_for(OrderSide::Sell, 4600.0);
        assert!((second - 1.1).abs() < 1e-12);

        // Buy side is independent
        assert_eq!(modifiers.next_for(OrderSide::Buy, 3400.0), 0.0);
    }

    #[test]
    fn test_clear_resets_both_sides() {
        let mut modifiers = PriceModifiers::new();
        modifiers.set(OrderSide::Buy, 3800.0, 1.2);
        modifiers.set(OrderSide::Sell, 4200.0, 1.3);
        modifiers.clear();
        assert_eq!(modifiers.count(OrderSide::Buy), 0);
        assert_eq!(modifiers.get(OrderSide::Sell, 4200.0), None);
    }
}
