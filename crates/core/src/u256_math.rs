//! Fixed-point U256 arithmetic shared by the ledger, pool and engine.
//!
//! Amounts, prices and ratios are 18-decimal WAD values. Stability-pool
//! per-unit terms use the wider 27-decimal [`HIGH_PRECISION`] so that
//! floor division loses less per offset.

use alloy::primitives::{U256, U512};

/// WAD constant: 1e18 for 18-decimal fixed-point arithmetic
pub const WAD: U256 = U256::from_limbs([1_000_000_000_000_000_000u64, 0, 0, 0]);

/// 1e27, precision of the stability pool's per-unit gain terms
pub const HIGH_PRECISION: U256 = U256::from_limbs([11_515_845_246_265_065_472u64, 54_210_108, 0, 0]);

/// Factor by which the running product is rescaled when it gets too small
pub const SCALE_FACTOR: U256 = U256::from_limbs([1_000_000_000u64, 0, 0, 0]);

/// Basis points denominator (10000 = 100%)
pub const BPS_DENOMINATOR: U256 = U256::from_limbs([10_000u64, 0, 0, 0]);

/// Upper bound on the exponent fed to [`dec_pow`] (1000 years of minutes)
pub const MAX_DECAY_MINUTES: u64 = 525_600_000;

/// 10^exp as U256.
#[inline]
pub fn pow10(exp: u8) -> U256 {
    U256::from(10u64).pow(U256::from(exp))
}

/// Whole tokens to WAD.
#[inline]
pub fn wad(units: u64) -> U256 {
    U256::from(units) * WAD
}

/// Basis points to a WAD fraction (10000 bps = 1e18).
#[inline]
pub fn bps_to_wad(bps: u32) -> U256 {
    U256::from(bps) * pow10(14)
}

/// Apply basis points: value * bps / 10000.
#[inline]
pub fn apply_basis_points(value: U256, basis_points: u32) -> U256 {
    mul_div(value, U256::from(basis_points), BPS_DENOMINATOR).unwrap_or(U256::MAX)
}

/// `a * b / denominator` with a 512-bit intermediate product. `None` when
/// the quotient does not fit or the denominator is zero.
#[inline]
pub fn mul_div(a: U256, b: U256, denominator: U256) -> Option<U256> {
    if denominator.is_zero() {
        return None;
    }
    if let Some(product) = a.checked_mul(b) {
        return Some(product / denominator);
    }
    let wide: U512 = a.widening_mul(b);
    let quotient = wide / U512::from_limbs_slice(denominator.as_limbs());
    if quotient.bit_len() > 256 {
        return None;
    }
    Some(U256::from_limbs_slice(&quotient.as_limbs()[..4]))
}

/// Multiply two WAD values: (a * b) / WAD
#[inline]
pub fn wad_mul(a: U256, b: U256) -> Option<U256> {
    mul_div(a, b, WAD)
}

/// Divide two WAD values: (a * WAD) / b
#[inline]
pub fn wad_div(a: U256, b: U256) -> Option<U256> {
    mul_div(a, WAD, b)
}

/// WAD multiplication rounding half up, used by [`dec_pow`].
#[inline]
fn dec_mul(a: U256, b: U256) -> U256 {
    a.saturating_mul(b).saturating_add(WAD / U256::from(2u64)) / WAD
}

/// `base^minutes` for a WAD `base <= 1`, by repeated squaring.
///
/// The exponent is capped at [`MAX_DECAY_MINUTES`].
pub fn dec_pow(base: U256, minutes: u64) -> U256 {
    let mut n = minutes.min(MAX_DECAY_MINUTES);
    if n == 0 {
        return WAD;
    }

    let mut x = base;
    let mut y = WAD;
    while n > 1 {
        if n % 2 == 1 {
            y = dec_mul(x, y);
        }
        x = dec_mul(x, x);
        n /= 2;
    }
    dec_mul(x, y)
}

/// Collateral ratio: coll * price / debt.
///
/// Returns U256::MAX if debt is zero.
#[inline]
pub fn compute_cr(collateral: U256, debt: U256, price: U256) -> U256 {
    if debt.is_zero() {
        return U256::MAX;
    }
    mul_div(collateral, price, debt).unwrap_or(U256::MAX)
}

/// Nominal collateral ratio: coll * WAD / debt, independent of price.
///
/// Returns U256::MAX if debt is zero.
#[inline]
pub fn compute_nominal_cr(collateral: U256, debt: U256) -> U256 {
    if debt.is_zero() {
        return U256::MAX;
    }
    wad_div(collateral, debt).unwrap_or(U256::MAX)
}

/// Parse a decimal string such as "9.95" into WAD.
pub fn parse_wad(input: &str) -> Option<U256> {
    let input = input.trim();
    let (whole, fraction) = match input.split_once('.') {
        Some((w, f)) => (w, f),
        None => (input, ""),
    };
    if fraction.len() > 18 || (whole.is_empty() && fraction.is_empty()) {
        return None;
    }
    if !whole.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }

    let whole = if whole.is_empty() {
        U256::ZERO
    } else {
        U256::from_str_radix(whole, 10).ok()?
    };
    let fraction = if fraction.is_empty() {
        U256::ZERO
    } else {
        U256::from_str_radix(fraction, 10).ok()? * pow10(18 - fraction.len() as u8)
    };
    whole.checked_mul(WAD)?.checked_add(fraction)
}

/// Convert WAD (18 decimals) to f64.
/// Use only for display/logging, not for computation.
#[inline]
pub fn wad_to_f64(value: U256) -> f64 {
    if value <= U256::from(u128::MAX) {
        let v: u128 = value.to();
        v as f64 / 1e18
    } else {
        f64::INFINITY
    }
}

/// Safe minimum of two U256 values
#[inline]
pub fn min(a: U256, b: U256) -> U256 {
    if a < b {
        a
    } else {
        b
    }
}

/// Safe maximum of two U256 values
#[inline]
pub fn max(a: U256, b: U256) -> U256 {
    if a > b {
        a
    } else {
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(WAD, pow10(18));
        assert_eq!(HIGH_PRECISION, pow10(27));
        assert_eq!(SCALE_FACTOR, pow10(9));
        assert_eq!(bps_to_wad(10_000), WAD);
        assert_eq!(bps_to_wad(11_000), WAD + WAD / U256::from(10u64));
    }

    #[test]
    fn test_apply_basis_points() {
        // 0.5% of 10 tokens = 0.05
        assert_eq!(apply_basis_points(wad(10), 50), parse_wad("0.05").unwrap());
        assert_eq!(apply_basis_points(wad(10), 0), U256::ZERO);
    }

    #[test]
    fn test_compute_cr() {
        // 10 collateral @ 2000, 5000 debt -> 400%
        let cr = compute_cr(wad(10), wad(5_000), wad(2_000));
        assert_eq!(cr, wad(4));

        // price halves -> 200%
        let cr = compute_cr(wad(10), wad(5_000), wad(1_000));
        assert_eq!(cr, wad(2));

        assert_eq!(compute_cr(wad(1), U256::ZERO, wad(1)), U256::MAX);
    }

    #[test]
    fn test_nominal_cr() {
        assert_eq!(compute_nominal_cr(wad(10), wad(5_000)), WAD / U256::from(500u64));
        assert_eq!(compute_nominal_cr(wad(10), U256::ZERO), U256::MAX);
    }

    #[test]
    fn test_dec_pow_half_life() {
        // 12h half-life: 0.999037758833783^720 ~= 0.5
        let factor = U256::from(999_037_758_833_783_000u64);
        let decayed = dec_pow(factor, 720);
        let half = WAD / U256::from(2u64);
        let tolerance = pow10(12);
        let diff = if decayed > half { decayed - half } else { half - decayed };
        assert!(diff < tolerance, "decayed = {decayed}");

        assert_eq!(dec_pow(factor, 0), WAD);
        assert_eq!(dec_pow(factor, 1), factor);
    }

    #[test]
    fn test_parse_wad() {
        assert_eq!(parse_wad("9.95"), Some(wad(995) / U256::from(100u64)));
        assert_eq!(parse_wad("5000"), Some(wad(5_000)));
        assert_eq!(parse_wad(".5"), Some(WAD / U256::from(2u64)));
        assert_eq!(parse_wad("0.000000000000000001"), Some(U256::from(1u64)));
        assert_eq!(parse_wad("1.0000000000000000001"), None);
        assert_eq!(parse_wad("abc"), None);
        assert_eq!(parse_wad(""), None);
    }

    #[test]
    fn test_mul_div_guards() {
        assert_eq!(mul_div(wad(1), wad(1), U256::ZERO), None);
        assert_eq!(mul_div(U256::MAX, U256::from(2u64), U256::from(1u64)), None);
        // The product overflows 256 bits but the quotient fits
        assert_eq!(
            mul_div(U256::MAX, U256::from(2u64), U256::from(4u64)),
            Some(U256::MAX / U256::from(2u64))
        );
        let big = wad(10_000) * wad(1_000);
        assert_eq!(mul_div(big * wad(1), big, big), Some(big * wad(1)));
        assert_eq!(wad_mul(wad(3), wad(2)), Some(wad(6)));
        assert_eq!(wad_div(wad(3), wad(2)), Some(wad(3) / U256::from(2u64)));
    }

    #[test]
    fn test_wad_to_f64() {
        assert!((wad_to_f64(wad(1_000)) - 1000.0).abs() < 1e-9);
    }
}
