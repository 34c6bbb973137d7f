//! Minor-unit (cents) formatting and parsing. Amounts are never floating point.

/// Formats cents as dollars, e.g. `1234` → `$12.34`, `-5` → `-$0.05`.
pub fn format_minor_units(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}${}.{:02}", abs / 100, abs % 100)
}

/// Parses a dollar amount into cents.
///
/// Accepts an optional leading `-` and `$` (in either order), whole dollars,
/// and up to two fractional digits; further fractional digits are truncated.
/// `"12"`, `"12.3"`, `".50"`, `"-$4.99"` are all valid.
pub fn parse_minor_units(input: &str) -> Option<i64> {
    let mut s = input.trim();
    let mut negative = false;
    loop {
        if let Some(rest) = s.strip_prefix('-')
            && !negative
        {
            negative = true;
            s = rest;
        } else if let Some(rest) = s.strip_prefix('$') {
            s = rest;
        } else {
            break;
        }
    }
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let dollars: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let cents: i64 = match frac.len() {
        0 => 0,
        1 => frac.parse::<i64>().ok()? * 10,
        _ => frac[..2].parse().ok()?,
    };
    let total = dollars.checked_mul(100)?.checked_add(cents)?;
    Some(if negative { -total } else { total })
}
