//! Wall-clock helpers. Local receive times are Unix nanoseconds.

use chrono::Utc;

/// Current time as Unix nanoseconds.
pub fn unix_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Current time as Unix milliseconds.
pub fn unix_millis() -> i64 {
    Utc::now().timestamp_millis()
}
