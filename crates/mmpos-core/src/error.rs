//! Error types for mmpos-core.

use thiserror::Error;

/// Core error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid fraction: {0} bps (expected 1..=10000)")]
    InvalidFraction(u32),

    #[error("Invalid market: {0}")]
    InvalidMarket(String),

    #[error("Invalid liquidity snapshot: liquidity={liquidity} shortfall={shortfall}")]
    InvalidSnapshot { liquidity: String, shortfall: String },

    #[error("Arithmetic overflow in {0}")]
    Overflow(&'static str),

    #[error("Division by zero in {0}")]
    DivisionByZero(&'static str),

    #[error("Decimal conversion error: {0}")]
    DecimalConversion(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
