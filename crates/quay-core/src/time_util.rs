//! Wall-clock time helpers.
//!
//! Book timestamps and request nonces are expressed as integer offsets from the
//! Unix epoch. A clock set before 1970 yields zero rather than an error.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[inline]
fn since_epoch() -> Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
}

/// Current time as **seconds** since Unix epoch.
#[inline]
pub fn now_secs() -> u64 {
    since_epoch().as_secs()
}

/// Current time as **milliseconds** since Unix epoch.
#[inline]
pub fn now_ms() -> u64 {
    since_epoch().as_millis() as u64
}

/// Current time as **microseconds** since Unix epoch.
#[inline]
pub fn now_us() -> u64 {
    since_epoch().as_micros() as u64
}
