//! Timestamp helpers.
//!
//! Upstream feeds carry epoch milliseconds; canonical records carry ISO-8601
//! UTC strings. Conversion goes through `chrono`.

use chrono::{DateTime, SecondsFormat, Utc};

/// Current wall-clock time as an ISO-8601 UTC string with millisecond precision.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time as **milliseconds** since Unix epoch.
#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert epoch milliseconds to an ISO-8601 UTC string.
///
/// Returns `None` when the value is outside chrono's representable range.
pub fn ms_to_iso(ms: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp_millis(ms).map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Shift an RFC 3339 timestamp by `ms` milliseconds, re-rendered in UTC.
pub fn shift_iso(s: &str, ms: i64) -> Option<String> {
    let dt = DateTime::parse_from_rfc3339(s).ok()?.with_timezone(&Utc);
    let shifted = dt.checked_add_signed(chrono::TimeDelta::try_milliseconds(ms)?)?;
    Some(shifted.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Whether `s` parses as an RFC 3339 / ISO-8601 timestamp with offset.
pub fn is_iso_timestamp(s: &str) -> bool {
    DateTime::parse_from_rfc3339(s).is_ok()
}
