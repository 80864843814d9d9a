//! Order-size tier table

use serde::{Deserialize, Serialize};

use super::errors::{GridError, GridResult};

/// Contiguous price range mapped to a fixed notional order size
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderSizeTier {
    pub level_start: f64,
    pub level_end: f64,
    /// Quote notional (e.g. USDT) per order
    pub size: f64,
}

impl OrderSizeTier {
    pub fn new(level_start: f64, level_end: f64, size: f64) -> Self {
        Self {
            level_start,
            level_end,
            size,
        }
    }
}

/// Ordered, non-overlapping tiers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierTable {
    tiers: Vec<OrderSizeTier>,
}

impl TierTable {
    pub fn new(tiers: Vec<OrderSizeTier>) -> Self {
        Self { tiers }
    }

    pub fn tiers(&self) -> &[OrderSizeTier] {
        &self.tiers
    }

    /// Notional size for a grid line, 0 when no tier matches.
    ///
    /// Every tier is `[start, end)` except the last, which is `[start, end]`.
    /// Assumes the table is sorted; no validation happens here.
    pub fn size_for(&self, grid_price: f64) -> f64 {
        let last = self.tiers.len().saturating_sub(1);
        self.tiers
            .iter()
            .enumerate()
            .find(|(i, tier)| {
                grid_price >= tier.level_start
                    && (grid_price < tier.level_end || (*i == last && grid_price <= tier.level_end))
            })
            .map(|(_, tier)| tier.size)
            .unwrap_or(0.0)
    }

    /// Reject tables the lookup cannot handle: empty, inverted, gapped or overlapping
    pub fn validate(&self) -> GridResult<()> {
        if self.tiers.is_empty() {
            return Err(GridError::InvalidConfig("at least one order size tier is required".into()));
        }

        for tier in &self.tiers {
            if tier.level_start >= tier.level_end {
                return Err(GridError::InvalidConfig(format!(
                    "tier [{}, {}] has an inverted range",
                    tier.level_start, tier.level_end
                )));
            }
            if tier.size < 0.0 {
                return Err(GridError::InvalidConfig(format!(
                    "tier [{}, {}] has negative size {}",
                    tier.level_start, tier.level_end, tier.size
                )));
            }
        }

        for pair in self.tiers.windows(2) {
            if (pair[0].level_end - pair[1].level_start).abs() > f64::EPSILON {
                return Err(GridError::InvalidConfig(format!(
                    "tiers must be contiguous: {} followed by {}",
                    pair[0].level_end, pair[1].level_start
                )));
            }
        }

        Ok(())
    }
}
