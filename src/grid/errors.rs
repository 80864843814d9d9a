//! Grid-specific error types

use thiserror::Error;

/// Errors that can occur in grid reconciliation
#[derive(Error, Debug, Clone)]
pub enum GridError {
    #[error("Invalid grid configuration: {0}")]
    InvalidConfig(String),

    #[error("Strategy not found: id {0}")]
    StrategyNotFound(u64),

    #[error("Reconciliation error for oid {oid}: {reason}")]
    Reconciliation { oid: u64, reason: String },

    #[error("Exchange error: {0}")]
    Exchange(String),

    #[error("Exchange call timed out after {0}ms")]
    Timeout(u64),

    #[error("Order placement failed after {attempts} attempts: {reason}")]
    OrderPlacementFailed { attempts: u32, reason: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Engine is in invalid state for operation: {current_state}")]
    InvalidState { current_state: String },

    #[error("JSON parse error: {0}")]
    JsonParse(String),
}

impl GridError {
    /// Whether the error came from the exchange side (placement, cancel, timeout)
    pub fn is_exchange(&self) -> bool {
        matches!(
            self,
            GridError::Exchange(_) | GridError::Timeout(_) | GridError::OrderPlacementFailed { .. }
        )
    }
}

impl From<serde_json::Error> for GridError {
    fn from(err: serde_json::Error) -> Self {
        GridError::JsonParse(err.to_string())
    }
}

impl From<std::io::Error> for GridError {
    fn from(err: std::io::Error) -> Self {
        GridError::Persistence(err.to_string())
    }
}

impl From<config::ConfigError> for GridError {
    fn from(err: config::ConfigError) -> Self {
        GridError::InvalidConfig(err.to_string())
    }
}

/// Result type for grid operations
pub type GridResult<T> = std::result::Result<T, GridError>;
