//! Fixed-point arithmetic.
//!
//! Amounts are `u128` base units of an 18-decimal asset. Any product that can
//! exceed 128 bits is carried in `U256` and narrowed back with an explicit
//! overflow check. Swap and liquidity formulas follow the constant-product
//! AMM with a 0.3% input fee.

use primitive_types::{U256, U512};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use crate::types::{Amount, EngineError};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Decimal places of every amount.
pub const DECIMALS: u32 = 18;
/// 1.0 in fixed-point.
pub const WAD: u128 = 1_000_000_000_000_000_000;
/// Input fraction kept after the AMM fee (997 / 1000).
pub const FEE_NUMERATOR: u128 = 997;
pub const FEE_DENOMINATOR: u128 = 1_000;
/// Basis-point denominator for slippage tolerances.
pub const BPS_DENOMINATOR: u128 = 10_000;

pub fn wad() -> U256 {
    U256::from(WAD)
}

// ---------------------------------------------------------------------------
// Wide arithmetic
// ---------------------------------------------------------------------------

/// `a * b / denominator`, floored. The product is carried in 512 bits, so
/// only a quotient that does not fit 256 bits is an overflow.
pub fn mul_div(a: U256, b: U256, denominator: U256) -> Result<U256, EngineError> {
    if denominator.is_zero() {
        return Err(EngineError::DivisionByZero);
    }
    let quotient = a.full_mul(b) / U512::from(denominator);
    U256::try_from(quotient).map_err(|_| EngineError::MathOverflow)
}

/// `mul_div` over base-unit amounts, narrowed back to `u128`.
pub fn mul_div_amount(a: Amount, b: Amount, denominator: Amount) -> Result<Amount, EngineError> {
    to_amount(mul_div(U256::from(a), U256::from(b), U256::from(denominator))?)
}

/// Narrow a 256-bit value to an amount.
pub fn to_amount(value: U256) -> Result<Amount, EngineError> {
    if value > U256::from(u128::MAX) {
        Err(EngineError::MathOverflow)
    } else {
        Ok(value.as_u128())
    }
}

// ---------------------------------------------------------------------------
// Constant-product formulas
// ---------------------------------------------------------------------------

/// Output of an exact-input swap against `(reserve_in, reserve_out)`.
pub fn get_amount_out(
    amount_in: Amount,
    reserve_in: Amount,
    reserve_out: Amount,
) -> Result<Amount, EngineError> {
    if reserve_in == 0 || reserve_out == 0 {
        return Err(EngineError::DivisionByZero);
    }
    let in_with_fee = U256::from(amount_in) * U256::from(FEE_NUMERATOR);
    let numerator = in_with_fee
        .checked_mul(U256::from(reserve_out))
        .ok_or(EngineError::MathOverflow)?;
    let denominator = U256::from(reserve_in) * U256::from(FEE_DENOMINATOR) + in_with_fee;
    to_amount(numerator / denominator)
}

/// Equivalent amount of the other asset at the current reserve ratio.
pub fn quote(amount_a: Amount, reserve_a: Amount, reserve_b: Amount) -> Result<Amount, EngineError> {
    if reserve_a == 0 || reserve_b == 0 {
        return Err(EngineError::DivisionByZero);
    }
    mul_div_amount(amount_a, reserve_b, reserve_a)
}

/// Amounts an add-liquidity call actually uses from the desired amounts,
/// keeping the pair's current ratio. An empty pair takes both as given.
pub fn optimal_liquidity_amounts(
    desired_a: Amount,
    desired_b: Amount,
    reserve_a: Amount,
    reserve_b: Amount,
) -> Result<(Amount, Amount), EngineError> {
    if reserve_a == 0 && reserve_b == 0 {
        return Ok((desired_a, desired_b));
    }
    let b_optimal = quote(desired_a, reserve_a, reserve_b)?;
    if b_optimal <= desired_b {
        return Ok((desired_a, b_optimal));
    }
    let a_optimal = quote(desired_b, reserve_b, reserve_a)?;
    Ok((a_optimal.min(desired_a), desired_b))
}

/// Portion of a single-sided deposit to swap so that the remainder and the
/// swap output match the post-swap reserve ratio.
///
/// `s = (sqrt(r * (3988009 r + 3988000 a)) - 1997 r) / 1994` for a 0.3% fee.
pub fn optimal_swap_amount(amount_in: Amount, reserve_in: Amount) -> Result<Amount, EngineError> {
    if reserve_in == 0 {
        return Err(EngineError::DivisionByZero);
    }
    let r = U256::from(reserve_in);
    let a = U256::from(amount_in);
    let inner = r
        .checked_mul(U256::from(3_988_009u64))
        .and_then(|x| x.checked_add(a.checked_mul(U256::from(3_988_000u64))?))
        .and_then(|x| x.checked_mul(r))
        .ok_or(EngineError::MathOverflow)?;
    let root = inner.integer_sqrt();
    let offset = r * U256::from(1_997u64);
    if root <= offset {
        return Ok(0);
    }
    to_amount((root - offset) / U256::from(1_994u64))
}

/// Geometric mean of the reserves: the pair's liquidity invariant `sqrt(k)`.
pub fn reserve_depth(reserve0: Amount, reserve1: Amount) -> U256 {
    (U256::from(reserve0) * U256::from(reserve1)).integer_sqrt()
}

/// Lower bound accepted for an expected amount under a bps tolerance.
pub fn apply_slippage(amount: Amount, slippage_bps: u32) -> Amount {
    let keep = BPS_DENOMINATOR.saturating_sub(slippage_bps as u128);
    // keep <= BPS_DENOMINATOR, so the quotient always fits.
    mul_div_amount(amount, keep, BPS_DENOMINATOR).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Human-readable units
// ---------------------------------------------------------------------------

/// Convert base units to a decimal number of whole tokens.
pub fn to_decimal(amount: Amount) -> Option<Decimal> {
    let signed = i128::try_from(amount).ok()?;
    Decimal::try_from_i128_with_scale(signed, DECIMALS)
        .ok()
        .map(|d| d.normalize())
}

/// Format base units as whole tokens, e.g. `1.5`.
pub fn format_amount(amount: Amount) -> String {
    match to_decimal(amount) {
        Some(d) => d.to_string(),
        None => format!("{amount}e-{DECIMALS}"),
    }
}

/// Parse a decimal token quantity (e.g. `"0.25"`) into base units.
pub fn parse_amount(text: &str) -> Result<Amount, EngineError> {
    let value = Decimal::from_str(text.trim())
        .map_err(|e| EngineError::Config(format!("invalid amount '{text}': {e}")))?;
    if value.is_sign_negative() {
        return Err(EngineError::Config(format!("negative amount '{text}'")));
    }
    let whole = value.trunc();
    let fraction = value - whole;

    let whole_units = whole
        .to_u128()
        .ok_or_else(|| EngineError::Config(format!("amount '{text}' out of range")))?
        .checked_mul(WAD)
        .ok_or(EngineError::MathOverflow)?;
    let fraction_units = (fraction * Decimal::from(WAD as u64))
        .trunc()
        .to_u128()
        .ok_or_else(|| EngineError::Config(format!("amount '{text}' out of range")))?;

    whole_units
        .checked_add(fraction_units)
        .ok_or(EngineError::MathOverflow)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_mul_div_uses_wide_intermediate() {
        // u128::MAX * 2 overflows u128 but the quotient fits.
        let result = mul_div_amount(u128::MAX, 2, 4).unwrap();
        assert_eq!(result, u128::MAX / 2);
    }

    #[test]
    fn test_mul_div_overflow_is_an_error() {
        assert_eq!(
            mul_div_amount(u128::MAX, u128::MAX, 1),
            Err(EngineError::MathOverflow)
        );
        assert_eq!(
            mul_div(U256::MAX, U256::from(2u8), U256::one()),
            Err(EngineError::MathOverflow)
        );
    }

    #[test]
    fn test_mul_div_product_may_exceed_256_bits() {
        // 2^255 * 4 / 8 == 2^254
        let half = U256::one() << 255;
        assert_eq!(
            mul_div(half, U256::from(4u8), U256::from(8u8)),
            Ok(U256::one() << 254)
        );
    }

    #[test]
    fn test_mul_div_by_zero() {
        assert_eq!(mul_div_amount(1, 1, 0), Err(EngineError::DivisionByZero));
    }

    #[test]
    fn test_get_amount_out_matches_constant_product() {
        // 1 in against 10/10 reserves with 0.3% fee.
        let out = get_amount_out(WAD, 10 * WAD, 10 * WAD).unwrap();
        // 997 * 10 / (10000 + 997) = 0.906610893...
        assert_eq!(out, 906_610_893_880_149_131);
        assert!(get_amount_out(WAD, 0, WAD).is_err());
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote(WAD, WAD, 4 * WAD).unwrap(), 4 * WAD);
        assert_eq!(quote(0, WAD, 4 * WAD).unwrap(), 0);
    }

    #[test]
    fn test_optimal_swap_amount_is_about_half() {
        let reserve = 1_000 * WAD;
        let amount = WAD;
        let swap = optimal_swap_amount(amount, reserve).unwrap();
        // Slightly above half to pay the fee, well below the full amount.
        assert!(swap > amount / 2);
        assert!(swap < amount / 2 + amount / 100);
    }

    #[test]
    fn test_optimal_swap_amount_leaves_matching_ratio() {
        let (ra, rb) = (4 * WAD, 2 * WAD);
        let amount = WAD;
        let swap = optimal_swap_amount(amount, ra).unwrap();
        let out = get_amount_out(swap, ra, rb).unwrap();
        let (ra2, rb2) = (ra + swap, rb - out);
        let remaining = amount - swap;
        let needed_b = quote(remaining, ra2, rb2).unwrap();
        // The remainder pairs with the output within rounding.
        let diff = needed_b.abs_diff(out);
        assert!(diff <= out / 1_000_000, "diff={diff}");
    }

    #[test]
    fn test_reserve_depth() {
        assert_eq!(reserve_depth(4 * WAD, WAD), U256::from(2 * WAD));
        assert!(reserve_depth(0, WAD).is_zero());
    }

    #[test]
    fn test_apply_slippage() {
        assert_eq!(apply_slippage(10_000, 50), 9_950);
        assert_eq!(apply_slippage(10_000, 0), 10_000);
        assert_eq!(apply_slippage(10_000, 20_000), 0);
    }

    #[test]
    fn test_format_and_parse_amount() {
        assert_eq!(format_amount(WAD), "1");
        assert_eq!(format_amount(WAD / 4), "0.25");
        assert_eq!(parse_amount("1.5").unwrap(), WAD + WAD / 2);
        assert_eq!(parse_amount("0.000000000000000001").unwrap(), 1);
        assert!(parse_amount("-1").is_err());
        assert!(parse_amount("abc").is_err());
        assert_eq!(to_decimal(3 * WAD / 2), Some(dec!(1.5)));
    }
}
