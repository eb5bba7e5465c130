//! Error types shared across the collector crates
//!
//! Comprehensive error taxonomy using thiserror

use thiserror::Error;

/// Errors parsing decimal values from the exchange.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NumericError {
    #[error("Invalid decimal: {0}")]
    InvalidDecimal(String),

    #[error("Negative value not allowed: {0}")]
    Negative(String),
}

/// Record-level validation errors.
///
/// A record that fails validation is never buffered and never persisted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("Invalid instrument symbol: {0:?}")]
    InvalidInstrument(String),

    #[error("Invalid order side: {0:?}")]
    InvalidSide(String),

    #[error("{kind} record for {instrument} has non-positive local receive time {value}")]
    NonPositiveReceiveTime {
        kind: &'static str,
        instrument: String,
        value: i64,
    },

    #[error("Invalid numeric field: {0}")]
    Numeric(#[from] NumericError),
}
