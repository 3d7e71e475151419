//! Arpeggiator: held-set sequencing and the sample-accurate clock
//!
//! The sequencer half ([`Arpeggiator`]) lives in the fan-in task: it owns
//! the set of physically held pitches and decides which pitch sounds on
//! each tick. The clock half ([`ArpClock`]) lives in the audio callback:
//! tick boundaries are derived from buffer positions, not wall time, so
//! tempo stays stable no matter what the UI or input threads are doing.
//! Ticks travel from the audio thread to the fan-in task over a dedicated
//! SPSC ring.
//!
//! Arp-synthesized events carry their own origin and never re-enter the
//! arpeggiator.

use serde::{Deserialize, Serialize};

/// Arpeggiator mode; toggling cycles through these in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArpMode {
    #[default]
    Off,
    Up,
    Down,
    UpDown,
    Random,
}

impl ArpMode {
    pub fn next(self) -> Self {
        match self {
            ArpMode::Off => ArpMode::Up,
            ArpMode::Up => ArpMode::Down,
            ArpMode::Down => ArpMode::UpDown,
            ArpMode::UpDown => ArpMode::Random,
            ArpMode::Random => ArpMode::Off,
        }
    }

    pub fn is_on(self) -> bool {
        self != ArpMode::Off
    }

    pub fn label(self) -> &'static str {
        match self {
            ArpMode::Off => "off",
            ArpMode::Up => "up",
            ArpMode::Down => "down",
            ArpMode::UpDown => "up-down",
            ArpMode::Random => "random",
        }
    }
}

/// What one tick produces: release the previous arp note, strike the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArpStep {
    pub release: Option<u8>,
    pub strike: Option<u8>,
}

/// Held-set sequencer. Owned by the fan-in task.
pub struct Arpeggiator {
    mode: ArpMode,
    /// Held pitches, ascending
    held: Vec<u8>,
    step: usize,
    ascending: bool,
    sounding: Option<u8>,
    rng: u64,
}

impl Arpeggiator {
    pub fn new(seed: u64) -> Self {
        Self {
            mode: ArpMode::Off,
            held: Vec::with_capacity(16),
            step: 0,
            ascending: true,
            sounding: None,
            rng: seed | 1,
        }
    }

    pub fn mode(&self) -> ArpMode {
        self.mode
    }

    /// Switch mode, resetting the sweep position. Returns the pitch to
    /// release if a note was sounding (always released on mode changes so
    /// the new ordering starts clean).
    pub fn set_mode(&mut self, mode: ArpMode) -> Option<u8> {
        self.mode = mode;
        self.step = 0;
        self.ascending = true;
        self.sounding.take()
    }

    pub fn held(&self) -> &[u8] {
        &self.held
    }

    /// A key went down while the arp is on.
    pub fn hold(&mut self, pitch: u8) {
        if let Err(pos) = self.held.binary_search(&pitch) {
            self.held.insert(pos, pitch);
        }
    }

    /// A key came up. If the held set empties while a note is sounding,
    /// that note is released immediately rather than on the next tick.
    pub fn release(&mut self, pitch: u8) -> Option<u8> {
        if let Ok(pos) = self.held.binary_search(&pitch) {
            self.held.remove(pos);
        }
        if self.held.is_empty() {
            self.sounding.take()
        } else {
            None
        }
    }

    /// Drop everything (panic, device removal). Returns the sounding pitch.
    pub fn clear(&mut self) -> Option<u8> {
        self.held.clear();
        self.step = 0;
        self.ascending = true;
        self.sounding.take()
    }

    /// Advance one clock tick.
    pub fn tick(&mut self) -> ArpStep {
        if !self.mode.is_on() || self.held.is_empty() {
            return ArpStep {
                release: self.sounding.take(),
                strike: None,
            };
        }
        let next = self.next_pitch();
        ArpStep {
            release: self.sounding.replace(next),
            strike: Some(next),
        }
    }

    fn next_pitch(&mut self) -> u8 {
        let len = self.held.len();
        match self.mode {
            ArpMode::Up => {
                let pitch = self.held[self.step % len];
                self.step = (self.step + 1) % len;
                pitch
            }
            ArpMode::Down => {
                let pitch = self.held[len - 1 - (self.step % len)];
                self.step = (self.step + 1) % len;
                pitch
            }
            ArpMode::UpDown => {
                let idx = self.step.min(len - 1);
                let pitch = self.held[idx];
                if len > 1 {
                    if self.ascending {
                        if self.step + 1 >= len {
                            self.ascending = false;
                            self.step = len - 2;
                        } else {
                            self.step += 1;
                        }
                    } else if self.step == 0 {
                        self.ascending = true;
                        self.step = 1;
                    } else {
                        self.step -= 1;
                    }
                }
                pitch
            }
            ArpMode::Random => {
                // Inline LCG; no repeat when more than one pitch is held
                self.rng = self
                    .rng
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                let mut idx = ((self.rng >> 33) as usize) % len;
                if len > 1 && Some(self.held[idx]) == self.sounding {
                    idx = (idx + 1) % len;
                }
                self.held[idx]
            }
            ArpMode::Off => unreachable!("tick() gates on mode"),
        }
    }
}

/// Sample-accurate tick source, driven from the audio callback.
///
/// `advance(frames)` returns how many tick boundaries the buffer crossed.
/// Activation resets the phase so the first tick lands on the next buffer.
pub struct ArpClock {
    period_samples: u32,
    countdown: u32,
    active: bool,
}

impl ArpClock {
    /// `steps_per_beat` of 4 means 16th notes.
    pub fn new(sample_rate: u32, bpm: f32, steps_per_beat: u32) -> Self {
        let period = (sample_rate as f64 * 60.0 / (bpm as f64 * steps_per_beat as f64)) as u32;
        Self {
            period_samples: period.max(1),
            countdown: 0,
            active: false,
        }
    }

    pub fn period_samples(&self) -> u32 {
        self.period_samples
    }

    pub fn set_active(&mut self, active: bool) {
        if active && !self.active {
            // First tick fires immediately on the next buffer
            self.countdown = 0;
        }
        self.active = active;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Count tick boundaries inside a buffer of `frames` samples.
    pub fn advance(&mut self, frames: usize) -> u32 {
        if !self.active {
            return 0;
        }
        let mut remaining = frames as u32;
        let mut ticks = 0;
        while remaining >= self.countdown {
            remaining -= self.countdown;
            self.countdown = self.period_samples;
            ticks += 1;
        }
        self.countdown -= remaining;
        ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arp_with(mode: ArpMode, held: &[u8]) -> Arpeggiator {
        let mut arp = Arpeggiator::new(42);
        arp.set_mode(mode);
        for &pitch in held {
            arp.hold(pitch);
        }
        arp
    }

    fn strikes(arp: &mut Arpeggiator, n: usize) -> Vec<u8> {
        (0..n).filter_map(|_| arp.tick().strike).collect()
    }

    #[test]
    fn test_up_cycles_ascending() {
        let mut arp = arp_with(ArpMode::Up, &[60, 64, 67]);
        assert_eq!(strikes(&mut arp, 8), vec![60, 64, 67, 60, 64, 67, 60, 64]);
    }

    #[test]
    fn test_up_releases_previous_each_tick() {
        let mut arp = arp_with(ArpMode::Up, &[60, 64]);
        assert_eq!(arp.tick(), ArpStep { release: None, strike: Some(60) });
        assert_eq!(
            arp.tick(),
            ArpStep {
                release: Some(60),
                strike: Some(64)
            }
        );
    }

    #[test]
    fn test_down_cycles_descending() {
        let mut arp = arp_with(ArpMode::Down, &[60, 64, 67]);
        assert_eq!(strikes(&mut arp, 6), vec![67, 64, 60, 67, 64, 60]);
    }

    #[test]
    fn test_up_down_does_not_repeat_endpoints() {
        let mut arp = arp_with(ArpMode::UpDown, &[60, 64, 67]);
        assert_eq!(
            strikes(&mut arp, 9),
            vec![60, 64, 67, 64, 60, 64, 67, 64, 60]
        );
    }

    #[test]
    fn test_random_never_repeats_immediately() {
        let mut arp = arp_with(ArpMode::Random, &[60, 64, 67]);
        let seq = strikes(&mut arp, 200);
        for pair in seq.windows(2) {
            assert_ne!(pair[0], pair[1], "immediate repeat in {:?}", seq);
        }
    }

    #[test]
    fn test_random_single_note_repeats() {
        let mut arp = arp_with(ArpMode::Random, &[60]);
        assert_eq!(strikes(&mut arp, 3), vec![60, 60, 60]);
    }

    #[test]
    fn test_empty_held_set_releases_sounding_note() {
        let mut arp = arp_with(ArpMode::Up, &[60]);
        arp.tick();
        // Key comes up: the sounding note is released right away
        assert_eq!(arp.release(60), Some(60));
        assert_eq!(arp.tick(), ArpStep::default());
    }

    #[test]
    fn test_release_with_remaining_notes_keeps_sounding() {
        let mut arp = arp_with(ArpMode::Up, &[60, 64]);
        arp.tick();
        assert_eq!(arp.release(64), None);
        // Next tick releases the old note through the normal path
        let step = arp.tick();
        assert_eq!(step.release, Some(60));
        assert_eq!(step.strike, Some(60));
    }

    #[test]
    fn test_held_set_stays_sorted_and_unique() {
        let mut arp = arp_with(ArpMode::Up, &[67, 60, 64, 60]);
        assert_eq!(arp.held(), &[60, 64, 67]);
    }

    #[test]
    fn test_mode_change_releases_sounding() {
        let mut arp = arp_with(ArpMode::Up, &[60, 64]);
        arp.tick();
        assert_eq!(arp.set_mode(ArpMode::Down), Some(60));
    }

    #[test]
    fn test_clock_period_16ths_at_120_bpm() {
        // 120 BPM 16ths = 125 ms = 6000 samples at 48 kHz
        let clock = ArpClock::new(48_000, 120.0, 4);
        assert_eq!(clock.period_samples(), 6000);
    }

    #[test]
    fn test_clock_first_tick_immediate_then_periodic() {
        let mut clock = ArpClock::new(48_000, 120.0, 4);
        clock.set_active(true);

        let mut ticks = Vec::new();
        let mut sample = 0usize;
        // 1 second of 256-frame buffers
        for _ in 0..(48_000 / 256) {
            for _ in 0..clock.advance(256) {
                ticks.push(sample);
            }
            sample += 256;
        }
        // Boundaries at 0, 6000, 12000, ... each attributed to the buffer
        // that crossed them
        assert_eq!(ticks.len(), 8);
        assert_eq!(ticks[0], 0);
        for (i, &t) in ticks.iter().enumerate() {
            let ideal = i * 6000;
            assert!(
                t <= ideal && ideal < t + 256,
                "tick {} at buffer {} missed boundary {}",
                i,
                t,
                ideal
            );
        }
    }

    #[test]
    fn test_clock_inactive_produces_no_ticks() {
        let mut clock = ArpClock::new(48_000, 120.0, 4);
        assert_eq!(clock.advance(48_000), 0);
        clock.set_active(true);
        assert!(clock.advance(256) > 0);
        clock.set_active(false);
        assert_eq!(clock.advance(48_000), 0);
    }
}
