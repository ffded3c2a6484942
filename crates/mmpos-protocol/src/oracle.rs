//! Price oracle capability.

use alloy::primitives::{Address, U256};

use crate::collaborators::BoxFuture;
use crate::error::ProtocolResult;

/// Reports the reference-currency price of one whole unit of a market's
/// underlying asset, scaled 1e18. Zero means the price is unavailable.
pub trait PriceOracle: Send + Sync {
    fn underlying_price(&self, market: Address) -> BoxFuture<'_, ProtocolResult<U256>>;
}
