//! Wall-clock helpers.
//!
//! Snapshot and heartbeat timestamps travel over the wire as Unix seconds
//! with sub-second precision. Interval logic uses [`std::time::Instant`].

use chrono::Utc;

/// Current wall-clock time as Unix seconds.
pub fn unix_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Seconds elapsed since `timestamp`, clamped at zero for clock skew.
pub fn age_of(timestamp: f64, now: f64) -> f64 {
    (now - timestamp).max(0.0)
}
