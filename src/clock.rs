//! Thin wrapper around wall-clock time so call sites read `now_unix()`
//! instead of reaching for `SystemTime` directly everywhere.

use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
