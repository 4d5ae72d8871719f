//! Numeric coercion at the store boundary.
//!
//! Source columns are filled by scrapers and may hold "-", "£12,500",
//! "3rd" or plain numbers. Everything numeric passes through
//! [`parse_number`] exactly once, when a raw record is built.

use regex::Regex;
use rusqlite::types::ValueRef;
use std::sync::OnceLock;

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-?\d+(?:\.\d+)?").unwrap())
}

fn integer_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").unwrap())
}

/// Parse a loosely formatted number.
///
/// Currency symbols and thousands separators are stripped. Returns `None`
/// for blanks, dashes and anything without a finite number in it.
pub fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, '£' | '€' | '$' | ','))
        .collect();
    if cleaned.is_empty() || cleaned == "-" {
        return None;
    }
    if let Ok(v) = cleaned.parse::<f64>() {
        return v.is_finite().then_some(v);
    }
    number_re()
        .find(&cleaned)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// First unsigned integer in a string ("Class 4" -> 4, "12 days" -> 12).
pub fn first_integer(raw: &str) -> Option<i64> {
    integer_re()
        .find(raw)
        .and_then(|m| m.as_str().parse::<i64>().ok())
}

/// Coerce a dynamically typed SQLite value to a number.
pub fn number_from_sql(value: ValueRef<'_>) -> Option<f64> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i as f64),
        ValueRef::Real(f) => f.is_finite().then_some(f),
        ValueRef::Text(t) => std::str::from_utf8(t).ok().and_then(parse_number),
        ValueRef::Blob(_) => None,
    }
}

/// Coerce a dynamically typed SQLite value to trimmed, non-empty text.
pub fn text_from_sql(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null | ValueRef::Blob(_) => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) => std::str::from_utf8(t)
            .ok()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
    }
}
