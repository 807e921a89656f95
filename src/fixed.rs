// Fixed-point money math. All prices, sizes, and balances are i128 integers
// carrying one of the named scales below; multiply-divide goes through BigInt
// so 1e18 x 1e18 products cannot overflow.

use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};

/// Quote price per base token, 1e18-scaled.
pub const PRICE_SCALE: i128 = 1_000_000_000_000_000_000;
/// Base token quantity, 1e18-scaled.
pub const SIZE_SCALE: i128 = 1_000_000_000_000_000_000;
/// Leverage, fee rates, basis points, 1e4-scaled.
pub const RATE_SCALE: i128 = 10_000;

/// Divisor applied to 1e18-scaled prices before insertion into a float-keyed
/// sorted index. Leaves 1e6 resolution; must match every index reader.
pub const SCORE_SCALE: i128 = 1_000_000_000_000;

/// Largest price a f64-scored index can hold without precision loss
/// (~9e9 in the quote unit once descaled).
pub const MAX_SCORE_PRICE: i128 = 9_000_000_000 * PRICE_SCALE;

/// a * b / d with truncation toward zero. Panics on d == 0.
pub fn mul_div(a: i128, b: i128, d: i128) -> i128 {
    assert!(d != 0, "mul_div by zero");
    let n = BigInt::from(a) * BigInt::from(b) / BigInt::from(d);
    n.to_i128().unwrap_or_else(|| {
        if n.is_negative() {
            i128::MIN
        } else {
            i128::MAX
        }
    })
}

/// Unrealized PnL of a position: (mark - entry) * size * sign / PRICE_SCALE.
pub fn pnl(entry: i128, mark: i128, size: i128, is_long: bool) -> i128 {
    let sign = if is_long { 1 } else { -1 };
    mul_div(mark - entry, size * sign, PRICE_SCALE)
}

/// Notional value of a size at a price: size * price / PRICE_SCALE.
pub fn notional(size: i128, price: i128) -> i128 {
    mul_div(size, price, PRICE_SCALE)
}

/// Parse a stored amount: integer strings, decimal strings, and scientific
/// notation are accepted; anything unrecognizable yields the fallback. Used
/// when deserializing store hashes, which must never fail a read path.
pub fn parse_fixed(input: &str, fallback: i128) -> i128 {
    let s = input.trim();
    if s.is_empty() {
        return fallback;
    }
    if let Ok(v) = s.parse::<i128>() {
        return v;
    }
    // Decimal or scientific: parse via BigInt mantissa to keep precision.
    parse_decimal(s).unwrap_or(fallback)
}

fn parse_decimal(s: &str) -> Option<i128> {
    let (mantissa_str, exp) = match s.find(['e', 'E']) {
        Some(pos) => {
            let exp: i32 = s[pos + 1..].parse().ok()?;
            (&s[..pos], exp)
        }
        None => (s, 0i32),
    };

    let negative = mantissa_str.starts_with('-');
    let unsigned = mantissa_str.trim_start_matches(['-', '+']);
    let (int_part, frac_part) = match unsigned.find('.') {
        Some(pos) => (&unsigned[..pos], &unsigned[pos + 1..]),
        None => (unsigned, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.chars().all(|c| c.is_ascii_digit()) || !frac_part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let digits: String = format!("{}{}", int_part, frac_part);
    let mut value: BigInt = digits.parse().ok()?;
    let shift = exp - frac_part.len() as i32;
    if shift > 0 {
        value *= BigInt::from(10).pow(shift as u32);
    } else if shift < 0 {
        let divisor = BigInt::from(10).pow((-shift) as u32);
        value /= divisor;
    }
    if negative {
        value = -value;
    }
    if value.is_zero() {
        return Some(0);
    }
    value.to_i128()
}

/// Truncate a 1e18-scaled price to the f64 score used by sorted indexes.
/// Returns None when the price exceeds the representable maximum.
pub fn price_to_score(price: i128) -> Option<f64> {
    if price < 0 || price > MAX_SCORE_PRICE {
        return None;
    }
    Some((price / SCORE_SCALE) as f64)
}

/// Render an i128 amount as the decimal string used on the wire.
pub fn to_wire(amount: i128) -> String {
    amount.to_string()
}

/// Render a 1e4-scaled rate as a percentage string with two decimals
/// (e.g. 10000 bp -> "100.00").
pub fn rate_to_percent(rate_bp: i128) -> String {
    let sign = if rate_bp < 0 { "-" } else { "" };
    let abs = rate_bp.abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mul_div_survives_wide_products() {
        // 100e18 * 5e18 / 1e18 would overflow i128 mid-product without BigInt
        let price = 100 * PRICE_SCALE;
        let size = 5 * SIZE_SCALE;
        assert_eq!(mul_div(size, price, PRICE_SCALE), 500 * SIZE_SCALE);
    }

    #[test]
    fn mul_div_truncates_toward_zero() {
        assert_eq!(mul_div(7, 1, 2), 3);
        assert_eq!(mul_div(-7, 1, 2), -3);
    }

    #[test]
    fn pnl_sign_follows_direction() {
        let entry = 100 * PRICE_SCALE;
        let mark = 110 * PRICE_SCALE;
        let size = SIZE_SCALE;
        assert_eq!(pnl(entry, mark, size, true), 10 * PRICE_SCALE);
        assert_eq!(pnl(entry, mark, size, false), -10 * PRICE_SCALE);
        assert_eq!(pnl(mark, entry, size, true), -10 * PRICE_SCALE);
    }

    #[test]
    fn notional_descale() {
        assert_eq!(notional(2 * SIZE_SCALE, 3 * PRICE_SCALE), 6 * SIZE_SCALE);
    }

    #[test]
    fn parse_integer_strings() {
        assert_eq!(parse_fixed("1000000000000000000", 0), PRICE_SCALE);
        assert_eq!(parse_fixed("-42", 0), -42);
        assert_eq!(parse_fixed("  7 ", 0), 7);
    }

    #[test]
    fn parse_decimal_and_scientific() {
        assert_eq!(parse_fixed("1.5e18", 0), 1_500_000_000_000_000_000);
        assert_eq!(parse_fixed("2e18", 0), 2 * PRICE_SCALE);
        assert_eq!(parse_fixed("1.25", 0), 1);
        assert_eq!(parse_fixed("-3.5e2", 0), -350);
    }

    #[test]
    fn parse_garbage_returns_fallback() {
        assert_eq!(parse_fixed("", 99), 99);
        assert_eq!(parse_fixed("not-a-number", -1), -1);
        assert_eq!(parse_fixed("1.2.3", 5), 5);
        assert_eq!(parse_fixed("e18", 5), 5);
    }

    #[test]
    fn score_truncation_and_bound() {
        let price = 2 * PRICE_SCALE;
        assert_eq!(price_to_score(price), Some(2_000_000.0));
        assert!(price_to_score(MAX_SCORE_PRICE + 1).is_none());
        assert!(price_to_score(-1).is_none());
    }

    #[test]
    fn percent_rendering() {
        assert_eq!(rate_to_percent(10000), "100.00");
        assert_eq!(rate_to_percent(4550), "45.50");
        assert_eq!(rate_to_percent(7), "0.07");
        assert_eq!(rate_to_percent(-250), "-2.50");
    }
}
