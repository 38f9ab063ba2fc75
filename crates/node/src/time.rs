//! Wall-clock milliseconds.
//!
//! The service loop measures its own waits against wall time so that host
//! suspend/resume shows up as a large overshoot. `Instant` is not suitable
//! for that on every platform, so everything timing-related in this crate
//! uses this epoch-millisecond clock.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
