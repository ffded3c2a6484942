//! Core domain types for money-market position management.
//!
//! This crate provides the types shared by the protocol adapters and the
//! position manager:
//! - `Market`: an immutable (underlying asset, share market) pair with decimals
//! - `Position`: local bookkeeping of supplied shares, collateral and borrows
//! - `LiquiditySnapshot`: account liquidity/shortfall as reported by the registry
//! - `FractionBps`: validated basis-point fraction for borrow sizing
//! - `fixed`: checked fixed-point arithmetic over `U256`

pub mod error;
pub mod fixed;
pub mod market;
pub mod position;
pub mod types;

pub use alloy::primitives::{Address, U256};
pub use error::{CoreError, Result};
pub use market::Market;
pub use position::Position;
pub use types::{FractionBps, LiquiditySnapshot, StatusCode};
