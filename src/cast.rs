//! Defensive casts: a value that cannot be parsed becomes `None`, never an error

use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("valid email regex")
});

/// Trim; blank becomes `None`.
pub fn clean_text(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Trimmed integer. Integral decimals such as `"12.0"` are accepted.
pub fn parse_int(value: Option<&str>) -> Option<i64> {
    let trimmed = value?.trim();
    if let Ok(n) = trimmed.parse::<i64>() {
        return Some(n);
    }
    let d = Decimal::from_str(trimmed).ok()?;
    if d.fract().is_zero() {
        d.trunc().to_i64()
    } else {
        None
    }
}

/// Monetary amount; a leading `$` and thousands separators are ignored.
pub fn parse_price(value: Option<&str>) -> Option<Decimal> {
    let cleaned: String = value?
        .trim()
        .trim_start_matches('$')
        .chars()
        .filter(|c| *c != ',')
        .collect();
    Decimal::from_str(cleaned.trim()).ok()
}

/// Parse a date trying each format in priority order. Formats carrying a
/// time component are parsed as timestamps and truncated to the date.
pub fn parse_date(value: Option<&str>, formats: &[String]) -> Option<NaiveDate> {
    let trimmed = value?.trim();
    formats.iter().find_map(|format| {
        if format.contains("%H") {
            NaiveDateTime::parse_from_str(trimmed, format)
                .ok()
                .map(|ts| ts.date())
        } else {
            NaiveDate::parse_from_str(trimmed, format).ok()
        }
    })
}

/// Lowercase, trim and strip a `mailto:` prefix.
pub fn normalize_email(value: Option<&str>) -> Option<String> {
    let lowered = clean_text(value)?.to_lowercase();
    let stripped = lowered.strip_prefix("mailto:").unwrap_or(&lowered).trim();
    (!stripped.is_empty()).then(|| stripped.to_string())
}

/// Keep only ASCII digits; no digits becomes `None`.
pub fn digits_only(value: Option<&str>) -> Option<String> {
    let digits: String = value?.chars().filter(char::is_ascii_digit).collect();
    (!digits.is_empty()).then_some(digits)
}

pub fn is_valid_email(value: &str) -> bool {
    EMAIL_RE.is_match(value)
}

/// True when the value carries leading or trailing whitespace.
pub fn has_padding(value: &str) -> bool {
    value.trim().len() != value.len()
}
