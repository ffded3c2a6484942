//! Local bookkeeping for one account's money-market position.
//!
//! The position only records what collaborators have already confirmed.
//! Outstanding borrow balances accrue interest externally, so the recorded
//! borrow amounts are principal bookkeeping; the authoritative balance is
//! always read from the share market.

use alloy::primitives::{Address, U256};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{CoreError, Result};

/// Position owned by a single position manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Position {
    /// Share market -> shares held.
    supplied_shares: BTreeMap<Address, U256>,
    /// Share markets entered as collateral. Never shrinks.
    entered_collateral: BTreeSet<Address>,
    /// Share market -> recorded borrow principal. Entries close at zero.
    recorded_borrows: BTreeMap<Address, U256>,
}

impl Position {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shares recorded for a share market.
    pub fn supplied_shares(&self, share_market: &Address) -> U256 {
        self.supplied_shares
            .get(share_market)
            .copied()
            .unwrap_or(U256::ZERO)
    }

    /// All share markets with a non-zero share balance.
    pub fn supplied_markets(&self) -> impl Iterator<Item = (&Address, &U256)> {
        self.supplied_shares.iter()
    }

    pub fn credit_shares(&mut self, share_market: Address, shares: U256) -> Result<()> {
        if shares.is_zero() {
            return Ok(());
        }
        let entry = self.supplied_shares.entry(share_market).or_insert(U256::ZERO);
        *entry = entry
            .checked_add(shares)
            .ok_or(CoreError::Overflow("credit_shares"))?;
        Ok(())
    }

    /// Replace the recorded shares for a market with an observed balance.
    pub fn set_supplied_shares(&mut self, share_market: Address, shares: U256) {
        if shares.is_zero() {
            self.supplied_shares.remove(&share_market);
        } else {
            self.supplied_shares.insert(share_market, shares);
        }
    }

    /// Remove exactly `shares`; fails without mutating if fewer are recorded.
    pub fn debit_shares(&mut self, share_market: Address, shares: U256) -> Result<()> {
        let held = self.supplied_shares(&share_market);
        let remaining = held.checked_sub(shares).ok_or_else(|| {
            CoreError::InvalidAmount(format!("debit of {shares} exceeds recorded {held} shares"))
        })?;
        if remaining.is_zero() {
            self.supplied_shares.remove(&share_market);
        } else {
            self.supplied_shares.insert(share_market, remaining);
        }
        Ok(())
    }

    /// Record a market as collateral. Returns `true` if it was newly entered.
    pub fn mark_entered(&mut self, share_market: Address) -> bool {
        self.entered_collateral.insert(share_market)
    }

    pub fn is_entered(&self, share_market: &Address) -> bool {
        self.entered_collateral.contains(share_market)
    }

    pub fn entered_collateral(&self) -> impl Iterator<Item = &Address> {
        self.entered_collateral.iter()
    }

    pub fn record_borrow(&mut self, share_market: Address, amount: U256) -> Result<()> {
        if amount.is_zero() {
            return Ok(());
        }
        let entry = self.recorded_borrows.entry(share_market).or_insert(U256::ZERO);
        *entry = entry
            .checked_add(amount)
            .ok_or(CoreError::Overflow("record_borrow"))?;
        Ok(())
    }

    /// Reduce recorded principal, flooring at zero. Returns what remains.
    pub fn record_repay(&mut self, share_market: Address, amount: U256) -> U256 {
        let current = self.recorded_borrow(&share_market);
        let remaining = current.saturating_sub(amount);
        if remaining.is_zero() {
            self.recorded_borrows.remove(&share_market);
        } else {
            self.recorded_borrows.insert(share_market, remaining);
        }
        remaining
    }

    pub fn recorded_borrow(&self, share_market: &Address) -> U256 {
        self.recorded_borrows
            .get(share_market)
            .copied()
            .unwrap_or(U256::ZERO)
    }

    /// Markets with an open (non-zero) recorded borrow.
    pub fn open_borrows(&self) -> impl Iterator<Item = (&Address, &U256)> {
        self.recorded_borrows.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.supplied_shares.is_empty()
            && self.entered_collateral.is_empty()
            && self.recorded_borrows.is_empty()
    }
}
