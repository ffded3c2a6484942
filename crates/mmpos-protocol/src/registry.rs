//! Risk registry capability (market listing, collateral, account liquidity).

use alloy::primitives::{Address, U256};
use mmpos_core::{LiquiditySnapshot, StatusCode};

use crate::collaborators::BoxFuture;
use crate::error::{ProtocolError, ProtocolResult};

/// Raw account liquidity response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountLiquidity {
    pub status: StatusCode,
    pub liquidity: U256,
    pub shortfall: U256,
}

impl AccountLiquidity {
    /// Validate a successful response into a snapshot.
    ///
    /// A response carrying both liquidity and shortfall is malformed.
    pub fn into_snapshot(self) -> ProtocolResult<LiquiditySnapshot> {
        LiquiditySnapshot::new(self.liquidity, self.shortfall)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Listing state of a market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MarketInfo {
    pub is_listed: bool,
    /// Collateral factor mantissa (scaled 1e18).
    pub collateral_factor: U256,
}

pub trait RiskRegistry: Send + Sync {
    /// Flag `markets` as collateral for `account`; one status per element.
    fn enter_markets(
        &self,
        account: Address,
        markets: Vec<Address>,
    ) -> BoxFuture<'_, ProtocolResult<Vec<StatusCode>>>;

    fn account_liquidity(
        &self,
        account: Address,
    ) -> BoxFuture<'_, ProtocolResult<AccountLiquidity>>;

    fn market_info(&self, market: Address) -> BoxFuture<'_, ProtocolResult<MarketInfo>>;
}
