//! Fixed-point trace timestamps.
//!
//! Trace files store microseconds as decimal literals (`1712.345`). They are
//! scaled by 1000 into integer nanoseconds directly from the digits, never via
//! `f64`, so millions of events accumulate no rounding error.

use serde_json::Value;

use crate::error::{AnalysisError, Result};

/// Integer nanoseconds.
pub type Ns = i64;

const FRACTION_DIGITS: usize = 3;

/// Parses a non-negative decimal microsecond literal into nanoseconds.
///
/// An `e`/`E` exponent shifts the decimal point before scaling. Digits beyond
/// the third fractional place are truncated toward zero.
pub fn parse_fixed_point(text: &str) -> Result<Ns> {
    let invalid = || AnalysisError::InvalidTimestamp(text.to_string());
    let text = text.trim();
    let (mantissa, exponent) = match text.split_once(['e', 'E']) {
        Some((m, e)) => (m, e.parse::<i64>().map_err(|_| invalid())?),
        None => (text, 0),
    };
    let (whole, fraction) = match mantissa.split_once('.') {
        Some((w, f)) => (w, f),
        None => (mantissa, ""),
    };
    let whole = whole.strip_prefix('+').unwrap_or(whole);
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    // Position of the nanosecond point within the concatenated digits.
    let digits = format!("{whole}{fraction}");
    let point = (whole.len() as i64)
        .checked_add(exponent)
        .and_then(|p| p.checked_add(FRACTION_DIGITS as i64))
        .ok_or_else(invalid)?;
    if point <= 0 {
        return Ok(0);
    }
    let point = usize::try_from(point).map_err(|_| invalid())?;
    let integral = if point <= digits.len() {
        &digits[..point]
    } else {
        &digits[..]
    };
    let padding = point.saturating_sub(digits.len());

    let mut ns: Ns = 0;
    for digit in integral.bytes().map(|b| (b - b'0') as i64) {
        ns = ns.checked_mul(10).and_then(|n| n.checked_add(digit)).ok_or_else(invalid)?;
    }
    for _ in 0..padding {
        if ns == 0 {
            break;
        }
        ns = ns.checked_mul(10).ok_or_else(invalid)?;
    }
    Ok(ns)
}

/// Reads a timestamp field that may be encoded as a JSON number or string.
pub fn from_json(value: &Value) -> Result<Ns> {
    match value {
        Value::Number(n) => parse_fixed_point(&n.to_string()),
        Value::String(s) => parse_fixed_point(s),
        other => Err(AnalysisError::InvalidTimestamp(other.to_string())),
    }
}

/// Nanoseconds to seconds, for display-oriented metrics only.
pub fn ns_to_secs(ns: Ns) -> f64 {
    ns as f64 / 1e9
}
