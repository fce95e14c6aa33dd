//! Utility functions.

use std::time::Duration;

/// Seed the tensor backend's RNG.
pub fn set_seed(_seed: u64) {
    #[cfg(feature = "torch")]
    tch::manual_seed(_seed as i64);
}

/// Format a duration as "1h 2m 3s", dropping leading zero units.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;

    if h > 0 {
        format!("{}h {}m {}s", h, m, s)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}
