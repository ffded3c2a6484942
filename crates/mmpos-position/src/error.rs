//! Position manager error types.
//!
//! Protocol rejections surface as the failing step's variant with the
//! collaborator's status code. Transport failures surface as `Protocol`.

use mmpos_core::{Address, CoreError, StatusCode, U256};
use mmpos_protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PositionError {
    #[error("Token transfer failed: {0}")]
    TransferFailed(String),

    #[error("Mint failed with status {code}")]
    MintFailed { code: StatusCode },

    #[error("Redeem failed with status {code}")]
    RedeemFailed { code: StatusCode },

    #[error("Entering market {market} failed with status {code}")]
    MarketEntryFailed { market: Address, code: StatusCode },

    #[error("Liquidity query failed: {0}")]
    LiquidityQueryFailed(String),

    #[error("Insufficient collateral: shortfall {shortfall}")]
    InsufficientCollateral { shortfall: U256 },

    #[error("No borrowing capacity")]
    NoLiquidity,

    #[error("Borrow limit rounds to zero")]
    ZeroMaxBorrow,

    #[error("Borrow failed with status {code}")]
    BorrowFailed { code: StatusCode },

    #[error("Repay failed with status {code}")]
    RepayFailed { code: StatusCode },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Insufficient shares in {market}: requested {requested}, held {held}")]
    InsufficientShares {
        market: Address,
        requested: U256,
        held: U256,
    },

    #[error("Invalid fraction: {0} bps")]
    InvalidFraction(u32),

    #[error("Invalid market: {0}")]
    InvalidMarket(String),

    #[error("No price available for {0}")]
    PriceUnavailable(Address),

    #[error("Arithmetic error: {0}")]
    ArithmeticOverflow(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl PositionError {
    /// Stable identifier for metrics labels and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            PositionError::TransferFailed(_) => "transfer_failed",
            PositionError::MintFailed { .. } => "mint_failed",
            PositionError::RedeemFailed { .. } => "redeem_failed",
            PositionError::MarketEntryFailed { .. } => "market_entry_failed",
            PositionError::LiquidityQueryFailed(_) => "liquidity_query_failed",
            PositionError::InsufficientCollateral { .. } => "insufficient_collateral",
            PositionError::NoLiquidity => "no_liquidity",
            PositionError::ZeroMaxBorrow => "zero_max_borrow",
            PositionError::BorrowFailed { .. } => "borrow_failed",
            PositionError::RepayFailed { .. } => "repay_failed",
            PositionError::InvalidAmount(_) => "invalid_amount",
            PositionError::InsufficientShares { .. } => "insufficient_shares",
            PositionError::InvalidFraction(_) => "invalid_fraction",
            PositionError::InvalidMarket(_) => "invalid_market",
            PositionError::PriceUnavailable(_) => "price_unavailable",
            PositionError::ArithmeticOverflow(_) => "arithmetic_overflow",
            PositionError::Protocol(_) => "protocol",
        }
    }
}

impl From<CoreError> for PositionError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidAmount(msg) => PositionError::InvalidAmount(msg),
            CoreError::InvalidFraction(bps) => PositionError::InvalidFraction(bps),
            CoreError::InvalidMarket(msg) => PositionError::InvalidMarket(msg),
            CoreError::InvalidSnapshot { .. } => {
                PositionError::LiquidityQueryFailed(err.to_string())
            }
            CoreError::Overflow(_)
            | CoreError::DivisionByZero(_)
            | CoreError::DecimalConversion(_) => PositionError::ArithmeticOverflow(err.to_string()),
        }
    }
}

pub type PositionResult<T> = Result<T, PositionError>;
