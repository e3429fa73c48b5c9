//! Parsing of client-supplied reservation windows.
//!
//! Bounds arrive as RFC 3339 strings with an explicit UTC offset and are
//! reduced to Unix milliseconds. Fractions finer than a millisecond are
//! rejected rather than truncated. Ordering of the two bounds is left to the
//! caller.

use chrono::{DateTime, SecondsFormat};

use crate::limits::{MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
use crate::model::Ms;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowError {
    /// One or both bounds were missing.
    Empty,
    Malformed { field: &'static str, value: String },
    SubMillisecond { field: &'static str, value: String },
    OutOfRange { field: &'static str, value: String },
}

impl std::fmt::Display for WindowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WindowError::Empty => write!(f, "empty time range not supported"),
            WindowError::Malformed { field, value } => {
                write!(f, "malformed timestamp: `{field}` was not RFC 3339 with offset: {value:?}")
            }
            WindowError::SubMillisecond { field, value } => {
                write!(f, "malformed timestamp: `{field}` is finer than a millisecond: {value:?}")
            }
            WindowError::OutOfRange { field, value } => {
                write!(f, "timestamp out of range: `{field}` = {value:?}")
            }
        }
    }
}

impl std::error::Error for WindowError {}

/// Validate both bounds of a window. Both must be present and well-formed.
pub fn parse_window(start: &str, end: &str) -> Result<(Ms, Ms), WindowError> {
    if start.trim().is_empty() || end.trim().is_empty() {
        return Err(WindowError::Empty);
    }
    let start = parse_timestamp("start", start)?;
    let end = parse_timestamp("end", end)?;
    Ok((start, end))
}

pub fn parse_timestamp(field: &'static str, value: &str) -> Result<Ms, WindowError> {
    let dt = DateTime::parse_from_rfc3339(value.trim()).map_err(|_| WindowError::Malformed {
        field,
        value: value.to_string(),
    })?;
    if dt.timestamp_subsec_nanos() % 1_000_000 != 0 {
        return Err(WindowError::SubMillisecond {
            field,
            value: value.to_string(),
        });
    }
    let ms = dt.timestamp_millis();
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&ms) {
        return Err(WindowError::OutOfRange {
            field,
            value: value.to_string(),
        });
    }
    Ok(ms)
}

/// Render milliseconds back to RFC 3339 in UTC, e.g. `2024-01-01T00:00:00.000Z`.
pub fn format_timestamp(ms: Ms) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| ms.to_string())
}
