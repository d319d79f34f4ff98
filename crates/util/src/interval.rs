//! Parsing of short interval literals such as `"10s"`, `"2m"` or `"1h"`.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IntervalError {
    #[error("interval is empty")]
    Empty,
    #[error("invalid interval '{0}': expected a whole number with an optional ms/s/m/h suffix")]
    Malformed(String),
}

/// Parse an interval literal.
///
/// Accepts a whole number followed by `ms`, `s`, `m` or `h` (case-insensitive).
/// A bare number is read as seconds.
pub fn parse_interval(raw_interval: &str) -> Result<Duration, IntervalError> {
    let trimmed = raw_interval.trim();
    if trimmed.is_empty() {
        return Err(IntervalError::Empty);
    }
    let malformed = || IntervalError::Malformed(trimmed.to_string());

    let split_at = trimmed.find(|character: char| !character.is_ascii_digit()).unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split_at);
    let value: u64 = number.parse().map_err(|_| malformed())?;

    match unit.to_ascii_lowercase().as_str() {
        "" | "s" => Ok(Duration::from_secs(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "m" => value.checked_mul(60).map(Duration::from_secs).ok_or_else(malformed),
        "h" => value.checked_mul(3_600).map(Duration::from_secs).ok_or_else(malformed),
        _ => Err(malformed()),
    }
}
