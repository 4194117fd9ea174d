//! Timestamp helpers.
//!
//! Every backend stores instants as Unix epoch milliseconds, so `now()` is
//! truncated to millisecond precision to keep records identical after a
//! round trip through any store.

use chrono::{DateTime, Utc};

/// Current time, truncated to whole milliseconds.
pub fn now() -> DateTime<Utc> {
    from_millis(Utc::now().timestamp_millis())
}

/// Convert an instant to Unix epoch milliseconds.
pub fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

/// Convert Unix epoch milliseconds back to an instant.
///
/// Out-of-range values collapse to the epoch.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
