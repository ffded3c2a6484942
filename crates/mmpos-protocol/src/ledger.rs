//! Asset ledger capability (fungible token).

use alloy::primitives::{Address, U256};

use crate::collaborators::BoxFuture;
use crate::error::ProtocolResult;

/// Fungible-asset ledger.
///
/// `token` selects the asset; the acting account is always explicit. A
/// rejected transfer (insufficient balance or allowance) is `Ok(false)`, not
/// an error.
pub trait AssetLedger: Send + Sync {
    /// Balance of `account` in `token`'s smallest unit.
    fn balance_of(&self, token: Address, account: Address) -> BoxFuture<'_, ProtocolResult<U256>>;

    /// Move `amount` from `from` (the acting account) to `to`.
    fn transfer(
        &self,
        token: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> BoxFuture<'_, ProtocolResult<bool>>;

    /// Pull `amount` from `from` to `to` using `spender`'s allowance.
    fn transfer_from(
        &self,
        token: Address,
        spender: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> BoxFuture<'_, ProtocolResult<bool>>;

    /// Set `spender`'s allowance over `owner`'s balance to exactly `amount`.
    fn approve(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
        amount: U256,
    ) -> BoxFuture<'_, ProtocolResult<()>>;

    fn allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> BoxFuture<'_, ProtocolResult<U256>>;

    fn decimals(&self, token: Address) -> BoxFuture<'_, ProtocolResult<u8>>;
}
