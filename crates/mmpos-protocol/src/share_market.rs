//! Share market capability (yield-bearing share token with lending).

use alloy::primitives::{Address, U256};
use mmpos_core::StatusCode;

use crate::collaborators::BoxFuture;
use crate::error::ProtocolResult;

/// Share market: converts deposits into shares and back, and tracks loans.
///
/// `market` is the share market's address. State-changing calls report
/// protocol rejections as a non-zero [`StatusCode`].
pub trait ShareMarket: Send + Sync {
    /// Mint shares for `amount` of underlying drawn from `minter`.
    fn mint(
        &self,
        market: Address,
        minter: Address,
        amount: U256,
    ) -> BoxFuture<'_, ProtocolResult<StatusCode>>;

    /// Burn `shares` and pay the underlying out to `redeemer`.
    fn redeem(
        &self,
        market: Address,
        redeemer: Address,
        shares: U256,
    ) -> BoxFuture<'_, ProtocolResult<StatusCode>>;

    /// Borrow `amount` of underlying to `borrower`.
    fn borrow(
        &self,
        market: Address,
        borrower: Address,
        amount: U256,
    ) -> BoxFuture<'_, ProtocolResult<StatusCode>>;

    /// Repay `amount` of `payer`'s borrow, drawing underlying from `payer`.
    fn repay_borrow(
        &self,
        market: Address,
        payer: Address,
        amount: U256,
    ) -> BoxFuture<'_, ProtocolResult<StatusCode>>;

    /// Share balance of `account`.
    fn balance_of(&self, market: Address, account: Address)
        -> BoxFuture<'_, ProtocolResult<U256>>;

    /// Current exchange rate mantissa (underlying per share, scaled 1e18).
    fn exchange_rate(&self, market: Address) -> BoxFuture<'_, ProtocolResult<U256>>;

    /// Supply rate per block mantissa.
    fn supply_rate(&self, market: Address) -> BoxFuture<'_, ProtocolResult<U256>>;

    /// Principal plus accrued interest owed by `account`.
    fn borrow_balance(
        &self,
        market: Address,
        account: Address,
    ) -> BoxFuture<'_, ProtocolResult<U256>>;
}
