//! Value types exchanged between the registry, the share markets and the manager.

use alloy::primitives::U256;
use std::fmt;

use crate::error::{CoreError, Result};

// ============================================================================
// StatusCode
// ============================================================================

/// Status code returned by protocol operations (`0` = success).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StatusCode(pub u64);

impl StatusCode {
    pub const OK: Self = Self(0);

    #[inline]
    pub fn new(code: u64) -> Self {
        Self(code)
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn code(&self) -> u64 {
        self.0
    }

    /// Saturating conversion from an on-chain `uint256` status.
    pub fn from_u256(value: U256) -> Self {
        Self(u64::try_from(value).unwrap_or(u64::MAX))
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// FractionBps
// ============================================================================

/// Fraction of a computed maximum, in basis points (`0 < bps <= 10_000`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FractionBps(u16);

impl FractionBps {
    /// Basis points in one whole.
    pub const DENOMINATOR: u16 = 10_000;

    /// 100% of the maximum.
    pub const FULL: Self = Self(Self::DENOMINATOR);

    pub fn new(bps: u16) -> Result<Self> {
        if bps == 0 || bps > Self::DENOMINATOR {
            return Err(CoreError::InvalidFraction(u32::from(bps)));
        }
        Ok(Self(bps))
    }

    #[inline]
    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for FractionBps {
    type Error = CoreError;

    fn try_from(bps: u16) -> Result<Self> {
        Self::new(bps)
    }
}

impl fmt::Display for FractionBps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}%", self.0 / 100, self.0 % 100)
    }
}

// ============================================================================
// LiquiditySnapshot
// ============================================================================

/// Account liquidity as reported by the risk registry at one point in time.
///
/// Both values are reference-currency amounts scaled by 1e18. At most one of
/// them is nonzero. Snapshots are computed per call and never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LiquiditySnapshot {
    liquidity: U256,
    shortfall: U256,
}

impl LiquiditySnapshot {
    /// Build a snapshot, rejecting a simultaneous liquidity and shortfall.
    pub fn new(liquidity: U256, shortfall: U256) -> Result<Self> {
        if !liquidity.is_zero() && !shortfall.is_zero() {
            return Err(CoreError::InvalidSnapshot {
                liquidity: liquidity.to_string(),
                shortfall: shortfall.to_string(),
            });
        }
        Ok(Self {
            liquidity,
            shortfall,
        })
    }

    /// Snapshot of an account with excess borrowing power.
    pub fn with_liquidity(liquidity: U256) -> Self {
        Self {
            liquidity,
            shortfall: U256::ZERO,
        }
    }

    /// Snapshot of an account under water.
    pub fn with_shortfall(shortfall: U256) -> Self {
        Self {
            liquidity: U256::ZERO,
            shortfall,
        }
    }

    #[inline]
    pub fn liquidity(&self) -> U256 {
        self.liquidity
    }

    #[inline]
    pub fn shortfall(&self) -> U256 {
        self.shortfall
    }

    #[inline]
    pub fn has_shortfall(&self) -> bool {
        !self.shortfall.is_zero()
    }

    #[inline]
    pub fn has_liquidity(&self) -> bool {
        !self.liquidity.is_zero()
    }
}
