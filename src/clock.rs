//! Process-wide nanosecond clock.
//!
//! All message timestamps are nanoseconds since the Unix epoch, anchored once
//! per process and advanced with a monotonic [`Instant`]. Timestamps taken in
//! one process never go backwards, and timestamps from two processes on the
//! same host are comparable, which is what latency measurement needs.
//!
//! Call [`init`] early (before the first message is built) so the anchor is
//! not taken lazily in the middle of a hot path.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

struct Anchor {
    epoch_nanos: u64,
    instant: Instant,
}

static ANCHOR: OnceLock<Anchor> = OnceLock::new();

fn anchor() -> &'static Anchor {
    ANCHOR.get_or_init(|| Anchor {
        epoch_nanos: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0),
        instant: Instant::now(),
    })
}

/// Initialize the process clock. Idempotent.
pub fn init() {
    let _ = anchor();
}

/// Current time in nanoseconds since the Unix epoch.
#[inline]
pub fn now_nanos() -> u64 {
    let anchor = anchor();
    anchor.epoch_nanos + anchor.instant.elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic() {
        init();
        let a = now_nanos();
        let b = now_nanos();
        assert!(b >= a);
    }

    #[test]
    fn test_close_to_system_time() {
        let system = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos() as u64;
        let ours = now_nanos();
        let skew = system.abs_diff(ours);
        assert!(skew < 1_000_000_000, "skew {} ns", skew);
    }
}
