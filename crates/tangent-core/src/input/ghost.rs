//! Keyboard-matrix ghost suppression
//!
//! Some laptop matrices bounce: a held key emits rapid down/up pairs on the
//! same scan-code within a millisecond. The filter collapses such a burst
//! to the first down and the last up. Ups that terminate a burst cannot be
//! recognized as final until the window expires, so they are parked and
//! delivered by `flush`, which the reader calls on every poll wakeup.

use std::collections::HashMap;

use crate::types::RawKey;

/// Alternating transitions closer than this are matrix bounce
pub const GHOST_WINDOW_NS: u64 = 1_000_000;

#[derive(Debug)]
struct KeyState {
    emitted_down: bool,
    last_ns: u64,
    pending_up: bool,
}

/// Per-device bounce filter. One instance per reader; not shared.
#[derive(Debug, Default)]
pub struct GhostFilter {
    keys: HashMap<RawKey, KeyState>,
}

impl GhostFilter {
    pub fn new() -> Self {
        Self {
            keys: HashMap::with_capacity(32),
        }
    }

    /// Decide whether a key transition should be delivered now.
    pub fn filter(&mut self, raw: RawKey, down: bool, t_ns: u64) -> bool {
        match self.keys.get_mut(&raw) {
            None => {
                self.keys.insert(
                    raw,
                    KeyState {
                        emitted_down: down,
                        last_ns: t_ns,
                        pending_up: false,
                    },
                );
                true
            }
            Some(state) => {
                let dt = t_ns.saturating_sub(state.last_ns);
                state.last_ns = t_ns;
                if dt >= GHOST_WINDOW_NS {
                    state.pending_up = false;
                    if state.emitted_down == down {
                        // Redundant transition (e.g. a parked up already
                        // flushed, or autorepeat leakage)
                        false
                    } else {
                        state.emitted_down = down;
                        true
                    }
                } else if down {
                    // Re-down inside the window: bounce, swallow it and
                    // cancel any parked up so the key stays held
                    state.pending_up = false;
                    false
                } else {
                    // Up inside the window: park it; it only counts if the
                    // burst ends here
                    if state.emitted_down {
                        state.pending_up = true;
                    }
                    false
                }
            }
        }
    }

    /// Deliver parked ups whose window has expired. Appends `(raw, t)`
    /// pairs to `out`; the reader forwards them as normal key-ups.
    pub fn flush(&mut self, now_ns: u64, out: &mut Vec<(RawKey, u64)>) {
        for (&raw, state) in self.keys.iter_mut() {
            if state.pending_up && now_ns.saturating_sub(state.last_ns) >= GHOST_WINDOW_NS {
                state.pending_up = false;
                state.emitted_down = false;
                out.push((raw, now_ns));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: RawKey = RawKey(44);

    #[test]
    fn test_clean_press_release_passes() {
        let mut filter = GhostFilter::new();
        assert!(filter.filter(KEY, true, 0));
        assert!(filter.filter(KEY, false, 50_000_000));
    }

    #[test]
    fn test_bounce_burst_collapses_to_first_down_last_up() {
        let mut filter = GhostFilter::new();
        // down, up, down, up all inside 1.2 ms
        assert!(filter.filter(KEY, true, 0));
        assert!(!filter.filter(KEY, false, 400_000));
        assert!(!filter.filter(KEY, true, 800_000));
        assert!(!filter.filter(KEY, false, 1_200_000));

        // Window expires: the parked up comes out of flush
        let mut out = Vec::new();
        filter.flush(2_300_000, &mut out);
        assert_eq!(out, vec![(KEY, 2_300_000)]);

        // Nothing further
        out.clear();
        filter.flush(5_000_000, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_bounce_resolving_down_keeps_key_held() {
        let mut filter = GhostFilter::new();
        assert!(filter.filter(KEY, true, 0));
        assert!(!filter.filter(KEY, false, 300_000));
        assert!(!filter.filter(KEY, true, 600_000));

        // Burst ended held-down: no parked up to deliver
        let mut out = Vec::new();
        filter.flush(2_000_000, &mut out);
        assert!(out.is_empty());

        // A later real release passes normally
        assert!(filter.filter(KEY, false, 60_000_000));
    }

    #[test]
    fn test_flushed_up_suppresses_trailing_duplicate() {
        let mut filter = GhostFilter::new();
        filter.filter(KEY, true, 0);
        filter.filter(KEY, false, 500_000);
        let mut out = Vec::new();
        filter.flush(2_000_000, &mut out);
        assert_eq!(out.len(), 1);

        // The kernel's own (late) duplicate of that up is redundant now
        assert!(!filter.filter(KEY, false, 2_500_000 + GHOST_WINDOW_NS));
    }

    #[test]
    fn test_keys_filter_independently() {
        let mut filter = GhostFilter::new();
        let other = RawKey(45);
        assert!(filter.filter(KEY, true, 0));
        // A different key 0.1 ms later is not part of KEY's burst
        assert!(filter.filter(other, true, 100_000));
    }
}
