//! Clock helpers.
//!
//! Everything time-related goes through here so expiry checks and archive
//! timestamps agree on one clock.

use chrono::{DateTime, Utc};

/// Current time
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Current Unix timestamp in milliseconds
pub fn now_timestamp_millis() -> i64 {
    Utc::now().timestamp_millis()
}
