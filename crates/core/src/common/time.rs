//! Wall-clock helpers, seconds as `f64`.
//!
//! Expiry parameters, probe timings and LRU timestamps are all absolute
//! wall-clock seconds. `f64` seconds keep the arithmetic (TTL sums, grace
//! offsets, negative sentinels) trivial.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Returns the current wall-clock time in seconds since the epoch.
pub fn real() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

/// Sleeps for `dur` seconds; negative or zero durations return immediately.
pub fn sleep(dur: f64) {
    if dur > 0.0 {
        std::thread::sleep(Duration::from_secs_f64(dur));
    }
}

/// Converts a non-negative seconds value to a `Duration`, clamping at zero.
pub fn duration(dur: f64) -> Duration {
    if dur > 0.0 {
        Duration::from_secs_f64(dur)
    } else {
        Duration::from_secs(0)
    }
}
