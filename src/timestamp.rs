//! Tolerant timestamp parsing.
//!
//! The action log, the server event table, and arbitrary `new_data`/`previous_data`
//! payloads carry timestamps written by several different layers over the life of
//! the product, so this parser accepts a handful of on-wire and in-store shapes
//! instead of assuming one canonical format.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampError(pub String);

impl fmt::Display for TimestampError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unparseable timestamp: {:?}", self.0)
    }
}

impl std::error::Error for TimestampError {}

const SPACE_OFFSET_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f %z", "%Y-%m-%d %H:%M:%S %z"];

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

/// Parse a timestamp tolerating several on-wire and in-store formats.
///
/// Preference order: RFC 3339 (with or without fractional seconds) first,
/// then the `Z`-suffixed literal form, then space-separated forms with a
/// numeric or named timezone — including the duplicated-offset quirk
/// `"2024-01-02 03:04:05 -0700 -0700"` that shows up in some legacy rows.
pub fn parse_timestamp(input: &str) -> Result<DateTime<Utc>, TimestampError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(TimestampError(input.to_string()));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%SZ") {
        return Ok(Utc.from_utc_datetime(&ndt));
    }

    let deduped = dedupe_trailing_offset(s);

    for fmt in SPACE_OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(&deduped, fmt) {
            return Ok(dt.with_timezone(&Utc));
        }
    }

    let stripped = strip_named_timezone(&deduped);
    for fmt in NAIVE_FORMATS {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(&stripped, fmt) {
            return Ok(Utc.from_utc_datetime(&ndt));
        }
    }

    Err(TimestampError(input.to_string()))
}

/// Collapse the quirky `"... -0700 -0700"` duplicated-offset suffix to a single offset.
fn dedupe_trailing_offset(s: &str) -> String {
    let tokens: Vec<&str> = s.split_whitespace().collect();
    if tokens.len() >= 2 {
        let last = tokens[tokens.len() - 1];
        let second_last = tokens[tokens.len() - 2];
        if last == second_last && is_numeric_offset(last) {
            return tokens[..tokens.len() - 1].join(" ");
        }
    }
    s.to_string()
}

fn is_numeric_offset(tok: &str) -> bool {
    let bytes = tok.as_bytes();
    bytes.len() == 5
        && (bytes[0] == b'+' || bytes[0] == b'-')
        && bytes[1..].iter().all(u8::is_ascii_digit)
}

/// Strip a trailing named timezone literal (`UTC`, `GMT`) that chrono can't parse directly;
/// both are always zero-offset in this store so dropping the literal is lossless.
fn strip_named_timezone(s: &str) -> String {
    for suffix in [" UTC", " GMT", " Z"] {
        if let Some(stripped) = s.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3339_with_nanos() {
        let dt = parse_timestamp("2024-03-05T10:15:30.123456789Z").unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-03-05T10:15:30.123456789+00:00");
    }

    #[test]
    fn parses_rfc3339() {
        let dt = parse_timestamp("2024-03-05T10:15:30+02:00").unwrap();
        let expected = parse_timestamp("2024-03-05T08:15:30Z").unwrap();
        assert_eq!(dt.timestamp(), expected.timestamp());
    }

    #[test]
    fn parses_z_literal() {
        let dt = parse_timestamp("2024-03-05T10:15:30Z").unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-03-05T10:15:30+00:00");
    }

    #[test]
    fn parses_space_separated_with_numeric_offset() {
        let dt = parse_timestamp("2024-03-05 10:15:30 -0700").unwrap();
        assert_eq!(dt.timestamp(), parse_timestamp("2024-03-05T17:15:30Z").unwrap().timestamp());
    }

    #[test]
    fn parses_duplicated_offset_quirk() {
        let dt = parse_timestamp("2024-03-05 10:15:30 -0700 -0700").unwrap();
        assert_eq!(dt.timestamp(), parse_timestamp("2024-03-05T17:15:30Z").unwrap().timestamp());
    }

    #[test]
    fn parses_naive_space_separated() {
        let dt = parse_timestamp("2024-03-05 10:15:30").unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-03-05T10:15:30+00:00");
    }

    #[test]
    fn parses_named_timezone_suffix() {
        let dt = parse_timestamp("2024-03-05 10:15:30 UTC").unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-03-05T10:15:30+00:00");
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_timestamp("not a date").is_err());
        assert!(parse_timestamp("").is_err());
    }
}
