//! Grid definition - the fixed price ladder orders rest on

use serde::{Deserialize, Serialize};

use super::errors::{GridError, GridResult};

/// Tolerance when comparing prices that went through float arithmetic
pub const PRICE_EPSILON: f64 = 1e-9;

/// Floor `value` to `decimals` places.
///
/// A relative nudge absorbs representation error, so `0.0048` floors to
/// `0.0048` instead of `0.0047`.
pub fn floor_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    let scaled = value * factor;
    (scaled + scaled.abs() * PRICE_EPSILON).floor() / factor
}

/// Build the ascending price ladder for `(min_price, max_price, line_count)`.
///
/// One line gives the midpoint; otherwise lines are linearly interpolated
/// with `step = (max - min) / (line_count - 1)`. Every price is floored to
/// one decimal.
pub fn define_grid(min_price: f64, max_price: f64, line_count: u32) -> GridResult<Vec<f64>> {
    if line_count == 0 {
        return Err(GridError::InvalidConfig("line_count must be at least 1".into()));
    }

    if line_count == 1 {
        return Ok(vec![floor_to((min_price + max_price) / 2.0, 1)]);
    }

    let step = (max_price - min_price) / (line_count - 1) as f64;
    let lines: Vec<f64> = (0..line_count)
        .map(|i| floor_to(min_price + step * i as f64, 1))
        .collect();

    if !is_strictly_ascending(&lines) {
        return Err(GridError::InvalidConfig(format!(
            "grid [{}, {}] with {} lines is not strictly ascending",
            min_price, max_price, line_count
        )));
    }

    Ok(lines)
}

fn is_strictly_ascending(lines: &[f64]) -> bool {
    lines.windows(2).all(|w| w[0] < w[1])
}

/// Validated price ladder with line lookup helpers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    lines: Vec<f64>,
    /// Spacing used for modifiers and the synthetic line above the top
    step: f64,
}

impl Grid {
    /// Define a new ladder from bounds and line count
    pub fn define(min_price: f64, max_price: f64, line_count: u32) -> GridResult<Self> {
        let lines = define_grid(min_price, max_price, line_count)?;
        Self::from_lines(lines, min_price, max_price)
    }

    /// Wrap stored grid lines, validating the ordering
    pub fn from_lines(lines: Vec<f64>, min_price: f64, max_price: f64) -> GridResult<Self> {
        if lines.is_empty() {
            return Err(GridError::InvalidConfig("grid has no lines".into()));
        }
        if !is_strictly_ascending(&lines) {
            return Err(GridError::InvalidConfig("grid lines must be strictly ascending".into()));
        }

        let step = match lines.len() {
            1 => (max_price - min_price) / 2.0,
            n => lines[n - 1] - lines[n - 2],
        };
        if step <= 0.0 {
            return Err(GridError::InvalidConfig(format!(
                "grid spacing must be positive, got {}",
                step
            )));
        }

        Ok(Self { lines, step })
    }

    pub fn lines(&self) -> &[f64] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    pub fn price_at(&self, index: usize) -> Option<f64> {
        self.lines.get(index).copied()
    }

    /// Index of the first line >= `price`, or `len()` above the top
    pub fn index_at_or_above(&self, price: f64) -> usize {
        self.lines.partition_point(|&line| line < price)
    }

    /// First line a bootstrap acquires a position for.
    ///
    /// The first line at or above market is left free; it is the close line
    /// of the nearest buy below market. Returns `len()` when nothing is left.
    pub fn upper_grid_index(&self, price: f64) -> usize {
        (self.index_at_or_above(price) + 1).min(self.lines.len())
    }

    /// Highest line <= `price`
    pub fn line_at_or_below(&self, price: f64) -> Option<(usize, f64)> {
        let idx = self
            .lines
            .partition_point(|&line| line <= price + PRICE_EPSILON);
        idx.checked_sub(1).map(|i| (i, self.lines[i]))
    }

    /// Close line for a position opened on `index`: the next line up, or a
    /// synthetic line one step beyond the top
    pub fn close_line_for(&self, index: usize) -> f64 {
        match self.lines.get(index + 1) {
            Some(next) => *next,
            None => {
                let top = self.lines[self.lines.len() - 1];
                floor_to(top + self.step, 1)
            }
        }
    }
}
