//! Input-thread-confined performance state
//!
//! One small record owns every knob the performer can turn: octave,
//! transpose, program, layer and arp modes, sustain, modifier keys. Only
//! the fan-in task mutates it, between handling one input event and the
//! next; the audio thread never reads it — it only sees the note events
//! derived from it. Other threads observe changes through telemetry.

use std::collections::HashMap;

use crate::arp::ArpMode;
use crate::types::{RawKey, LAYER_CHANNEL};

/// Octave bounds (MIDI octaves, C-based)
pub const OCTAVE_MIN: u8 = 0;
pub const OCTAVE_MAX: u8 = 8;

/// Transpose bounds in semitones
pub const TRANSPOSE_MIN: i8 = -12;
pub const TRANSPOSE_MAX: i8 = 12;

/// Layer mode state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerState {
    pub on: bool,
    pub program: u8,
    pub channel: u8,
}

impl Default for LayerState {
    fn default() -> Self {
        Self {
            on: false,
            program: 48,
            channel: LAYER_CHANNEL,
        }
    }
}

/// The single source of truth for performance state.
#[derive(Debug)]
pub struct StateCore {
    pub octave: u8,
    pub transpose: i8,
    pub program: u8,
    pub layer: LayerState,
    pub arp_mode: ArpMode,
    pub sustain_pressed: bool,
    pub shift_held: bool,
    pub ctrl_held: bool,
    last_event_ns: HashMap<RawKey, u64>,
}

impl StateCore {
    pub fn new(octave: u8, program: u8) -> Self {
        debug_assert!((OCTAVE_MIN..=OCTAVE_MAX).contains(&octave));
        Self {
            octave,
            transpose: 0,
            program,
            layer: LayerState::default(),
            arp_mode: ArpMode::Off,
            sustain_pressed: false,
            shift_held: false,
            ctrl_held: false,
            last_event_ns: HashMap::new(),
        }
    }

    /// Bump the octave, saturating at the bounds. Returns true if changed.
    pub fn octave_up(&mut self) -> bool {
        if self.octave < OCTAVE_MAX {
            self.octave += 1;
            true
        } else {
            false
        }
    }

    pub fn octave_down(&mut self) -> bool {
        if self.octave > OCTAVE_MIN {
            self.octave -= 1;
            true
        } else {
            false
        }
    }

    pub fn transpose_up(&mut self) -> bool {
        if self.transpose < TRANSPOSE_MAX {
            self.transpose += 1;
            true
        } else {
            false
        }
    }

    pub fn transpose_down(&mut self) -> bool {
        if self.transpose > TRANSPOSE_MIN {
            self.transpose -= 1;
            true
        } else {
            false
        }
    }

    /// Set the program, wrapping into [0, 127] like the +/- program keys do.
    pub fn set_program(&mut self, program: i32) {
        self.program = program.rem_euclid(128) as u8;
    }

    /// Cycle the arpeggiator to its next mode and return it.
    pub fn cycle_arp(&mut self) -> ArpMode {
        self.arp_mode = self.arp_mode.next();
        self.arp_mode
    }

    /// Record the time of a key event and return the previous one, if any.
    ///
    /// Feeds the fan-in's duplicate-strike guard: a down repeating within
    /// the ghosting window is discarded even when it slipped past the
    /// reader-side filter.
    pub fn touch_key(&mut self, raw: RawKey, t_ns: u64) -> Option<u64> {
        self.last_event_ns.insert(raw, t_ns)
    }

    /// Forget per-key timing memory (panic, device removal).
    pub fn clear_key_times(&mut self) {
        self.last_event_ns.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_octave_saturates() {
        let mut state = StateCore::new(8, 0);
        assert!(!state.octave_up());
        assert_eq!(state.octave, 8);
        for _ in 0..10 {
            state.octave_down();
        }
        assert_eq!(state.octave, 0);
        assert!(!state.octave_down());
    }

    #[test]
    fn test_transpose_saturates() {
        let mut state = StateCore::new(6, 0);
        for _ in 0..20 {
            state.transpose_up();
        }
        assert_eq!(state.transpose, TRANSPOSE_MAX);
        for _ in 0..40 {
            state.transpose_down();
        }
        assert_eq!(state.transpose, TRANSPOSE_MIN);
    }

    #[test]
    fn test_program_wraps() {
        let mut state = StateCore::new(6, 127);
        state.set_program(128);
        assert_eq!(state.program, 0);
        state.set_program(-1);
        assert_eq!(state.program, 127);
    }

    #[test]
    fn test_arp_cycles_through_all_modes() {
        let mut state = StateCore::new(6, 0);
        let mut seen = vec![state.arp_mode];
        for _ in 0..5 {
            seen.push(state.cycle_arp());
        }
        assert_eq!(seen.first(), seen.last());
        assert_eq!(seen.len() - 1, 5);
    }

    #[test]
    fn test_touch_key_returns_previous() {
        let mut state = StateCore::new(6, 0);
        assert_eq!(state.touch_key(RawKey(44), 100), None);
        assert_eq!(state.touch_key(RawKey(44), 250), Some(100));
    }
}
