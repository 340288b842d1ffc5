//! Timestamp parsing
//!
//! Upstream fetchers are not consistent about how they stamp records: Spotify
//! and Strava emit RFC 3339 strings, chess.com emits epoch seconds, and some
//! fetchers write epoch milliseconds. Landing-file names carry a compact
//! timestamp after the data type.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

use crate::error::{CommonError, Result};

/// Epoch values above this are treated as milliseconds (year 5138 in seconds).
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

const FILE_FORMATS: &[&str] = &[
    "%Y%m%dT%H%M%SZ",
    "%Y%m%dT%H%M%S",
    "%Y%m%d_%H%M%S",
    "%Y%m%d%H%M%S",
    "%Y-%m-%dT%H-%M-%S",
];

/// Parse a capture timestamp carried in a JSON payload.
///
/// Accepts RFC 3339 strings, naive `YYYY-MM-DD HH:MM:SS` strings (assumed
/// UTC), and integer epoch seconds or milliseconds (as numbers or digit-only
/// strings).
pub fn parse_capture_timestamp(value: &Value) -> Result<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp_str(s),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                from_epoch(i)
            } else if let Some(f) = n.as_f64() {
                from_epoch_fractional(f)
            } else {
                Err(CommonError::Timestamp(n.to_string()))
            }
        }
        other => Err(CommonError::Timestamp(format!(
            "expected string or number, got {}",
            json_type_name(other)
        ))),
    }
}

/// Parse a timestamp string (see [`parse_capture_timestamp`]).
pub fn parse_timestamp_str(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(i) = s.parse::<i64>() {
            return from_epoch(i);
        }
    }

    Err(CommonError::Timestamp(s.to_string()))
}

/// Parse the timestamp suffix of a landing file name.
///
/// Returns `None` rather than an error: file names written by hand or by an
/// older fetcher may not carry one, and callers fall back to object metadata.
pub fn parse_file_timestamp(s: &str) -> Option<DateTime<Utc>> {
    for format in FILE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    if s.len() == 10 && s.bytes().all(|b| b.is_ascii_digit()) {
        return s.parse::<i64>().ok().and_then(|secs| from_epoch(secs).ok());
    }

    None
}

fn from_epoch(value: i64) -> Result<DateTime<Utc>> {
    let parsed = if value.unsigned_abs() >= EPOCH_MILLIS_THRESHOLD.unsigned_abs() {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    };

    parsed.ok_or_else(|| CommonError::Timestamp(value.to_string()))
}

fn from_epoch_fractional(value: f64) -> Result<DateTime<Utc>> {
    if !value.is_finite() {
        return Err(CommonError::Timestamp(value.to_string()));
    }
    let millis = if value.abs() >= EPOCH_MILLIS_THRESHOLD as f64 {
        value as i64
    } else {
        (value * 1000.0) as i64
    };
    DateTime::from_timestamp_millis(millis).ok_or_else(|| CommonError::Timestamp(value.to_string()))
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
