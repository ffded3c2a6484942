//! Market identification.
//!
//! A market pairs one underlying asset ledger with the share market that
//! issues yield-bearing shares against it. The pair is fixed at construction.

use alloy::primitives::{Address, U256};
use rust_decimal::Decimal;
use std::fmt;

use crate::error::{CoreError, Result};
use crate::fixed::{self, MAX_POW10};

/// Borrowable/collateral-able asset pair.
///
/// Fields are private so a constructed market cannot be re-pointed at a
/// different share market or underlying.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Market {
    underlying: Address,
    share_market: Address,
    underlying_decimals: u8,
    share_decimals: u8,
    symbol: Option<String>,
}

impl Market {
    /// Create a market.
    ///
    /// # Errors
    /// Returns `CoreError::InvalidMarket` if either address is zero, both
    /// addresses are equal, or a decimal count cannot be represented as a
    /// power of ten in `U256`.
    pub fn new(
        underlying: Address,
        share_market: Address,
        underlying_decimals: u8,
        share_decimals: u8,
    ) -> Result<Self> {
        if underlying.is_zero() || share_market.is_zero() {
            return Err(CoreError::InvalidMarket(
                "underlying and share market must be non-zero addresses".to_string(),
            ));
        }
        if underlying == share_market {
            return Err(CoreError::InvalidMarket(format!(
                "share market {share_market} cannot be its own underlying"
            )));
        }
        let max = MAX_POW10 as u8;
        if underlying_decimals > max || share_decimals > max {
            return Err(CoreError::InvalidMarket(format!(
                "decimals out of range: underlying={underlying_decimals} share={share_decimals}"
            )));
        }

        Ok(Self {
            underlying,
            share_market,
            underlying_decimals,
            share_decimals,
            symbol: None,
        })
    }

    /// Attach a display symbol (e.g. "DAI").
    #[must_use]
    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    #[inline]
    pub fn underlying(&self) -> Address {
        self.underlying
    }

    #[inline]
    pub fn share_market(&self) -> Address {
        self.share_market
    }

    #[inline]
    pub fn underlying_decimals(&self) -> u8 {
        self.underlying_decimals
    }

    #[inline]
    pub fn share_decimals(&self) -> u8 {
        self.share_decimals
    }

    pub fn symbol(&self) -> Option<&str> {
        self.symbol.as_deref()
    }

    /// Render an underlying amount in whole units.
    pub fn to_decimal(&self, amount: U256) -> Result<Decimal> {
        fixed::to_decimal(amount, self.underlying_decimals)
    }

    /// Render a share amount in whole shares.
    pub fn shares_to_decimal(&self, shares: U256) -> Result<Decimal> {
        fixed::to_decimal(shares, self.share_decimals)
    }

    /// Parse a whole-unit underlying amount (e.g. "12.5").
    pub fn parse_amount(&self, value: &str) -> Result<U256> {
        fixed::parse_units(value, self.underlying_decimals)
    }

    /// Parse a whole-share amount.
    pub fn parse_shares(&self, value: &str) -> Result<U256> {
        fixed::parse_units(value, self.share_decimals)
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.symbol {
            Some(symbol) => write!(f, "{symbol}"),
            None => write!(f, "{}", self.share_market),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    #[test]
    fn test_market_new() {
        let market = Market::new(addr(1), addr(2), 18, 8).unwrap().with_symbol("DAI");
        assert_eq!(market.underlying(), addr(1));
        assert_eq!(market.share_market(), addr(2));
        assert_eq!(market.underlying_decimals(), 18);
        assert_eq!(market.share_decimals(), 8);
        assert_eq!(market.to_string(), "DAI");
    }

    #[test]
    fn test_market_rejects_self_reference() {
        assert!(Market::new(addr(3), addr(3), 18, 8).is_err());
        assert!(Market::new(Address::ZERO, addr(3), 18, 8).is_err());
        assert!(Market::new(addr(1), addr(2), 78, 8).is_err());
    }

    #[test]
    fn test_market_display_without_symbol() {
        let market = Market::new(addr(1), addr(2), 6, 8).unwrap();
        assert_eq!(market.to_string(), addr(2).to_string());
    }

    #[test]
    fn test_market_amount_helpers() {
        let market = Market::new(addr(1), addr(2), 6, 8).unwrap();
        let amount = market.parse_amount("12.5").unwrap();
        assert_eq!(amount, U256::from(12_500_000u64));
        assert_eq!(market.to_decimal(amount).unwrap(), dec!(12.5));
        assert_eq!(
            market.shares_to_decimal(U256::from(250_000_000u64)).unwrap(),
            dec!(2.5)
        );
    }
}
