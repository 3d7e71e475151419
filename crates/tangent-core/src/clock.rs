//! Monotonic timestamps for input events
//!
//! All event timestamps in the pipeline are nanoseconds on a single
//! monotonic timeline anchored at the first call in the process. Kernel
//! event timestamps use CLOCK_REALTIME and can jump; readers stamp events
//! here at fetch time instead, which is within the same poll interval.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds since the process clock epoch.
///
/// The first caller anchors the epoch; call this early in startup so device
/// readers and the audio thread share a dense timeline.
pub fn monotonic_ns() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_never_decreases() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }
}
