//! Fixed-point arithmetic over `U256`.
//!
//! Protocol quantities arrive as integers in each token's smallest unit, and
//! rates/prices as 1e18-scaled mantissas. All helpers use checked math and
//! truncate toward zero, which never overstates a balance or a borrow limit.

use alloy::primitives::U256;
use rust_decimal::Decimal;

use crate::error::{CoreError, Result};
use crate::types::FractionBps;

/// Decimal scale of exchange rates, prices, collateral factors and liquidity.
pub const MANTISSA_DECIMALS: u8 = 18;

/// `10^18` as `U256`.
pub const MANTISSA_ONE: U256 = U256::from_limbs([1_000_000_000_000_000_000, 0, 0, 0]);

/// Largest power of ten representable in a `U256`.
pub const MAX_POW10: u32 = 77;

/// Compute `10^exp` with overflow checking.
pub fn pow10(exp: u32) -> Result<U256> {
    if exp > MAX_POW10 {
        return Err(CoreError::Overflow("pow10"));
    }
    U256::from(10u8)
        .checked_pow(U256::from(exp))
        .ok_or(CoreError::Overflow("pow10"))
}

/// Divide by `10^exp` for a non-negative exponent, multiply by `10^-exp` otherwise.
///
/// Lets callers express a decimal re-denomination as one signed exponent
/// without caring which side of the fraction it lands on.
pub fn rescale(value: U256, exp: i32) -> Result<U256> {
    if exp >= 0 {
        Ok(value / pow10(exp.unsigned_abs())?)
    } else {
        value
            .checked_mul(pow10(exp.unsigned_abs())?)
            .ok_or(CoreError::Overflow("rescale"))
    }
}

/// `a * b / denominator`, truncating.
pub fn mul_div(a: U256, b: U256, denominator: U256, context: &'static str) -> Result<U256> {
    if denominator.is_zero() {
        return Err(CoreError::DivisionByZero(context));
    }
    let product = a.checked_mul(b).ok_or(CoreError::Overflow(context))?;
    Ok(product / denominator)
}

/// Estimate the underlying-equivalent of a share balance.
///
/// `shares * exchange_rate / 10^(18 + underlying_decimals - share_decimals)`
///
/// The exponent is signed: when `share_decimals` exceeds
/// `18 + underlying_decimals` the adjustment becomes a multiplication.
/// With the protocol's exchange-rate mantissa the result is denominated at
/// the share token's decimal scale (it equals the underlying's smallest unit
/// whenever both tokens share the same decimals).
pub fn estimate_underlying(
    shares: U256,
    exchange_rate: U256,
    underlying_decimals: u8,
    share_decimals: u8,
) -> Result<U256> {
    let exp =
        i32::from(MANTISSA_DECIMALS) + i32::from(underlying_decimals) - i32::from(share_decimals);
    let product = shares
        .checked_mul(exchange_rate)
        .ok_or(CoreError::Overflow("estimate_underlying"))?;
    rescale(product, exp)
}

/// Convert shares into the underlying's smallest unit: `shares * rate / 1e18`.
pub fn shares_to_underlying(shares: U256, exchange_rate: U256) -> Result<U256> {
    mul_div(shares, exchange_rate, MANTISSA_ONE, "shares_to_underlying")
}

/// Convert an underlying amount into shares: `amount * 1e18 / rate`.
pub fn underlying_to_shares(amount: U256, exchange_rate: U256) -> Result<U256> {
    mul_div(amount, MANTISSA_ONE, exchange_rate, "underlying_to_shares")
}

/// Maximum borrowable amount in the borrowed asset's smallest unit.
///
/// `liquidity * 10^borrow_decimals / price`. Liquidity and price share the
/// 1e18 reference-currency scale, so `10^borrow_decimals` re-denominates the
/// quotient into native units.
pub fn max_borrow(liquidity: U256, price: U256, borrow_decimals: u8) -> Result<U256> {
    let scale = pow10(u32::from(borrow_decimals))?;
    mul_div(liquidity, scale, price, "max_borrow")
}

/// `amount * bps / 10_000`, truncating.
pub fn apply_fraction(amount: U256, fraction: FractionBps) -> Result<U256> {
    mul_div(
        amount,
        U256::from(fraction.as_u16()),
        U256::from(FractionBps::DENOMINATOR),
        "apply_fraction",
    )
}

/// Reference-currency value (1e18-scaled) of `amount` at `price` per whole unit.
pub fn reference_value(amount: U256, price: U256, decimals: u8) -> Result<U256> {
    mul_div(amount, price, pow10(u32::from(decimals))?, "reference_value")
}

/// Multiply by a 1e18 mantissa (collateral factor, rate).
pub fn mul_mantissa(value: U256, mantissa: U256) -> Result<U256> {
    mul_div(value, mantissa, MANTISSA_ONE, "mul_mantissa")
}

/// Render an integer amount with `decimals` as a `Decimal` for display.
///
/// Fails for values beyond `Decimal`'s 96-bit mantissa.
pub fn to_decimal(amount: U256, decimals: u8) -> Result<Decimal> {
    let raw: u128 = amount
        .try_into()
        .map_err(|_| CoreError::DecimalConversion(format!("{amount} exceeds u128")))?;
    let signed = i128::try_from(raw)
        .map_err(|_| CoreError::DecimalConversion(format!("{amount} exceeds i128")))?;
    Decimal::try_from_i128_with_scale(signed, u32::from(decimals))
        .map(|d| d.normalize())
        .map_err(|e| CoreError::DecimalConversion(e.to_string()))
}

/// Parse a whole-unit amount string such as `"12.5"` into smallest units.
pub fn parse_units(value: &str, decimals: u8) -> Result<U256> {
    let trimmed = value.trim();
    let (int_part, frac_part) = match trimmed.split_once('.') {
        Some((i, f)) => (i, f),
        None => (trimmed, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(CoreError::InvalidAmount(format!("empty amount: {value:?}")));
    }
    if frac_part.len() > usize::from(decimals) {
        return Err(CoreError::InvalidAmount(format!(
            "{value} has more than {decimals} decimal places"
        )));
    }
    if !int_part.chars().chain(frac_part.chars()).all(|c| c.is_ascii_digit()) {
        return Err(CoreError::InvalidAmount(format!("not a number: {value:?}")));
    }

    let padded = format!("{int_part}{frac_part:0<width$}", width = usize::from(decimals));
    let digits = padded.trim_start_matches('0');
    if digits.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::from_str_radix(digits, 10).map_err(|e| CoreError::InvalidAmount(e.to_string()))
}
