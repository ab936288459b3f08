//! Fixed-point money.
//!
//! All monetary fields in the ledger and the system of record are `Amount`:
//! integer minor units at 8 decimal places. Floating point only appears at
//! the serialization boundary (gateway decimal strings, display). Summing
//! f64 across millions of small settlements drifts; summing i64 does not.

/// Integer minor units, 8 decimal places. Stored as SQLite INTEGER.
pub type Amount = i64;

/// Conversion factor: 1 coin = 100_000_000 units.
pub const AMOUNT_SCALE: i64 = 100_000_000;

/// Convert a display value to minor units.
#[inline]
pub fn to_amount(value: f64) -> Amount {
    (value * AMOUNT_SCALE as f64).round() as Amount
}

/// Convert minor units to a display value.
#[inline]
pub fn from_amount(amount: Amount) -> f64 {
    amount as f64 / AMOUNT_SCALE as f64
}

/// Render minor units as a decimal string ("12.34567890").
///
/// Used for the gateway wire format, which takes decimal strings, and for
/// operator-facing output. Negative amounts keep their sign.
pub fn format_amount(amount: Amount) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    let whole = abs / AMOUNT_SCALE as u64;
    let frac = abs % AMOUNT_SCALE as u64;
    format!("{}{}.{:08}", sign, whole, frac)
}

/// Parse a gateway decimal string into minor units.
pub fn parse_amount(s: &str) -> Option<Amount> {
    let s = s.trim();
    let (sign, s) = match s.strip_prefix('-') {
        Some(rest) => (-1i64, rest),
        None => (1i64, s),
    };
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if frac.len() > 8 {
        return None;
    }
    let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut frac_units: i64 = 0;
    if !frac.is_empty() {
        frac_units = frac.parse().ok()?;
        for _ in 0..(8 - frac.len()) {
            frac_units *= 10;
        }
    }
    Some(sign * (whole.checked_mul(AMOUNT_SCALE)?.checked_add(frac_units)?))
}

/// Percentage applied to an amount in integer math.
///
/// `pct` is a display percentage (30.0 == 30%). Widened through i128 so the
/// intermediate product cannot overflow.
pub fn percent_of(amount: Amount, pct: f64) -> Amount {
    let bps = (pct * 100.0).round() as i128;
    ((amount as i128 * bps) / 10_000) as Amount
}
