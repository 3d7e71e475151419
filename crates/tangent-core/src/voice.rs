//! Polyphonic voice allocation and note-lifecycle bookkeeping
//!
//! The allocator maps logical notes to renderer voices, enforces the
//! polyphony cap with a defined stealing policy, and tracks sustain-pedal
//! deferred releases. It runs in the input context; the renderer-level
//! events it decides on are returned to the caller for submission to the
//! realtime bus.
//!
//! A voice stays in the table after its note-off — it is still decaying in
//! the renderer and still occupies a polyphony slot until it is stolen.
//! Victim preference when the cap is hit:
//!
//! 1. sustain-deferred notes (key up, pedal holding them)
//! 2. decaying voices, oldest `released_at` first
//! 3. sounding voices, oldest `start_time` first
//!
//! Stealing a sounding or sustained voice emits exactly one extra note-off
//! for it; a decaying voice already had its note-off forwarded, so evicting
//! it emits nothing (a second off could cut a newer strike of the same
//! pitch).

use std::collections::HashMap;

use crate::types::{NoteEvent, Origin};

/// Application-level record that a pitch is currently wanted to sound
#[derive(Debug, Clone, Copy)]
pub struct HeldNote {
    pub pitch: u8,
    pub channel: u8,
    pub velocity_at_strike: u8,
    pub strike_time: u64,
    pub origin: Origin,
    pub sustained: bool,
}

/// One renderer voice. `id` is stable only for the voice's lifetime.
#[derive(Debug, Clone, Copy)]
pub struct Voice {
    pub id: u64,
    pub pitch: u8,
    pub channel: u8,
    pub velocity: u8,
    pub origin: Origin,
    pub start_time: u64,
    pub released_at: Option<u64>,
}

struct Held {
    note: HeldNote,
    voice_id: u64,
}

/// Voice allocator state. Exclusively owned by the fan-in task.
pub struct VoiceAllocator {
    voices: HashMap<u64, Voice>,
    /// Held notes keyed by (channel, pitch); at most one per key
    held: HashMap<(u8, u8), Held>,
    sustain: bool,
    max_polyphony: usize,
    next_id: u64,
}

impl VoiceAllocator {
    /// Tables are pre-sized so steady-state operation does not allocate.
    pub fn new(max_polyphony: usize) -> Self {
        Self {
            voices: HashMap::with_capacity(max_polyphony * 2),
            held: HashMap::with_capacity(max_polyphony * 2),
            sustain: false,
            max_polyphony,
            next_id: 0,
        }
    }

    /// Voices currently occupying polyphony slots (sounding or decaying)
    pub fn active(&self) -> usize {
        self.voices.len()
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    pub fn is_held(&self, channel: u8, pitch: u8) -> bool {
        self.held.contains_key(&(channel, pitch))
    }

    pub fn sustain(&self) -> bool {
        self.sustain
    }

    pub fn max_polyphony(&self) -> usize {
        self.max_polyphony
    }

    /// Strike a note.
    ///
    /// A pitch already held on the channel is re-triggered: the old voice
    /// is stolen (one off), then a fresh voice starts.
    pub fn note_on(
        &mut self,
        pitch: u8,
        velocity: u8,
        channel: u8,
        origin: Origin,
        now: u64,
        out: &mut Vec<NoteEvent>,
    ) {
        debug_assert!((1..=127).contains(&velocity));

        if let Some(held) = self.held.remove(&(channel, pitch)) {
            self.voices.remove(&held.voice_id);
            out.push(NoteEvent::Off {
                pitch,
                channel,
                origin,
            });
        }

        if self.voices.len() >= self.max_polyphony {
            self.evict(out);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.voices.insert(
            id,
            Voice {
                id,
                pitch,
                channel,
                velocity,
                origin,
                start_time: now,
                released_at: None,
            },
        );
        self.held.insert(
            (channel, pitch),
            Held {
                note: HeldNote {
                    pitch,
                    channel,
                    velocity_at_strike: velocity,
                    strike_time: now,
                    origin,
                    sustained: false,
                },
                voice_id: id,
            },
        );
        out.push(NoteEvent::On {
            pitch,
            velocity,
            channel,
            origin,
        });

        debug_assert!(self.voices.len() <= self.max_polyphony);
    }

    /// Release a note. Unknown pitches are dropped silently (idempotent).
    ///
    /// With sustain on, the release is deferred: the held note is marked
    /// and nothing is forwarded until the pedal lifts.
    pub fn note_off(
        &mut self,
        pitch: u8,
        channel: u8,
        origin: Origin,
        now: u64,
        out: &mut Vec<NoteEvent>,
    ) {
        let key = (channel, pitch);
        if !self.held.contains_key(&key) {
            return;
        }
        if self.sustain {
            if let Some(held) = self.held.get_mut(&key) {
                held.note.sustained = true;
            }
            return;
        }
        let held = self.held.remove(&key).expect("checked above");
        if let Some(voice) = self.voices.get_mut(&held.voice_id) {
            voice.released_at = Some(now);
        }
        out.push(NoteEvent::Off {
            pitch,
            channel,
            origin,
        });
    }

    /// Pedal state change. The off transition releases every
    /// sustain-deferred note; repeated transitions are idempotent.
    pub fn set_sustain(&mut self, on: bool, now: u64, out: &mut Vec<NoteEvent>) {
        if self.sustain && !on {
            let mut deferred: Vec<(u8, u8)> = self
                .held
                .iter()
                .filter(|(_, held)| held.note.sustained)
                .map(|(&key, _)| key)
                .collect();
            deferred.sort_unstable();
            for key in deferred {
                let held = self.held.remove(&key).expect("key collected above");
                if let Some(voice) = self.voices.get_mut(&held.voice_id) {
                    voice.released_at = Some(now);
                }
                out.push(NoteEvent::Off {
                    pitch: key.1,
                    channel: key.0,
                    origin: held.note.origin,
                });
            }
        }
        self.sustain = on;
    }

    /// Release every held note with the given origin (layer teardown,
    /// device removal cleanup for MIDI input).
    pub fn release_origin(&mut self, origin: Origin, now: u64, out: &mut Vec<NoteEvent>) {
        let mut keys: Vec<(u8, u8)> = self
            .held
            .iter()
            .filter(|(_, held)| held.note.origin == origin)
            .map(|(&key, _)| key)
            .collect();
        keys.sort_unstable();
        for key in keys {
            let held = self.held.remove(&key).expect("key collected above");
            if let Some(voice) = self.voices.get_mut(&held.voice_id) {
                voice.released_at = Some(now);
            }
            out.push(NoteEvent::Off {
                pitch: key.1,
                channel: key.0,
                origin,
            });
        }
    }

    /// Drop all bookkeeping. The caller submits the bus-level `Panic`,
    /// which releases every renderer voice in one stroke.
    pub fn panic(&mut self) {
        self.voices.clear();
        self.held.clear();
    }

    /// Evict one voice to make room, following the victim preference order.
    fn evict(&mut self, out: &mut Vec<NoteEvent>) {
        let victim = self
            .held
            .values()
            .filter(|held| held.note.sustained)
            .min_by_key(|held| (held.note.strike_time, held.voice_id))
            .map(|held| held.voice_id)
            .or_else(|| {
                self.voices
                    .values()
                    .filter(|voice| voice.released_at.is_some())
                    .min_by_key(|voice| (voice.released_at, voice.id))
                    .map(|voice| voice.id)
            })
            .or_else(|| {
                self.voices
                    .values()
                    .min_by_key(|voice| (voice.start_time, voice.id))
                    .map(|voice| voice.id)
            });

        let Some(id) = victim else { return };
        let voice = self.voices.remove(&id).expect("victim selected from table");
        self.held.retain(|_, held| held.voice_id != id);
        if voice.released_at.is_none() {
            out.push(NoteEvent::Off {
                pitch: voice.pitch,
                channel: voice.channel,
                origin: voice.origin,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offs(events: &[NoteEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|event| match event {
                NoteEvent::Off { pitch, .. } => Some(*pitch),
                _ => None,
            })
            .collect()
    }

    fn strike(alloc: &mut VoiceAllocator, pitch: u8, now: u64, out: &mut Vec<NoteEvent>) {
        alloc.note_on(pitch, 100, 0, Origin::Keyboard, now, out);
    }

    #[test]
    fn test_on_off_pair() {
        let mut alloc = VoiceAllocator::new(8);
        let mut out = Vec::new();
        strike(&mut alloc, 60, 0, &mut out);
        assert_eq!(alloc.active(), 1);
        assert!(alloc.is_held(0, 60));

        alloc.note_off(60, 0, Origin::Keyboard, 100, &mut out);
        assert!(!alloc.is_held(0, 60));
        // Voice keeps its slot while decaying
        assert_eq!(alloc.active(), 1);
        assert_eq!(offs(&out), vec![60]);
    }

    #[test]
    fn test_note_off_unknown_pitch_is_silent() {
        let mut alloc = VoiceAllocator::new(8);
        let mut out = Vec::new();
        alloc.note_off(61, 0, Origin::Keyboard, 0, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_retrigger_steals_same_pitch() {
        let mut alloc = VoiceAllocator::new(8);
        let mut out = Vec::new();
        strike(&mut alloc, 60, 0, &mut out);
        out.clear();

        strike(&mut alloc, 60, 10, &mut out);
        // Exactly one off for the stolen voice, then the fresh on
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], NoteEvent::Off { pitch: 60, .. }));
        assert!(matches!(out[1], NoteEvent::On { pitch: 60, .. }));
        assert_eq!(alloc.active(), 1);
    }

    #[test]
    fn test_sustain_defers_release() {
        let mut alloc = VoiceAllocator::new(8);
        let mut out = Vec::new();
        strike(&mut alloc, 60, 0, &mut out);
        alloc.set_sustain(true, 10, &mut out);
        out.clear();

        alloc.note_off(60, 0, Origin::Keyboard, 50, &mut out);
        assert!(out.is_empty(), "release must be deferred: {:?}", out);
        assert!(alloc.is_held(0, 60));

        alloc.set_sustain(false, 200, &mut out);
        assert_eq!(offs(&out), vec![60]);
        assert!(!alloc.is_held(0, 60));
    }

    #[test]
    fn test_sustain_toggle_is_idempotent() {
        let mut alloc = VoiceAllocator::new(8);
        let mut out = Vec::new();
        strike(&mut alloc, 60, 0, &mut out);
        out.clear();

        // Pump the pedal with no intervening notes: held set unchanged
        for i in 0..10 {
            alloc.set_sustain(true, 10 + i, &mut out);
            alloc.set_sustain(false, 20 + i, &mut out);
        }
        assert!(out.is_empty());
        assert!(alloc.is_held(0, 60));
        assert_eq!(alloc.held_count(), 1);
    }

    #[test]
    fn test_polyphony_cap_evicts_earliest() {
        let mut alloc = VoiceAllocator::new(4);
        let mut out = Vec::new();
        for (i, pitch) in [60u8, 62, 64, 65].iter().enumerate() {
            strike(&mut alloc, *pitch, i as u64, &mut out);
        }
        out.clear();

        strike(&mut alloc, 67, 10, &mut out);
        assert_eq!(alloc.active(), 4);
        // Earliest-struck voice evicted with exactly one extra off
        assert_eq!(offs(&out), vec![60]);
        assert!(!alloc.is_held(0, 60));
        assert!(alloc.is_held(0, 67));
    }

    #[test]
    fn test_eviction_prefers_sustained_then_released() {
        let mut alloc = VoiceAllocator::new(3);
        let mut out = Vec::new();
        strike(&mut alloc, 60, 0, &mut out);
        strike(&mut alloc, 62, 1, &mut out);
        strike(&mut alloc, 64, 2, &mut out);

        // 62 decays (released), 60 is pedal-held
        alloc.note_off(62, 0, Origin::Keyboard, 5, &mut out);
        alloc.set_sustain(true, 6, &mut out);
        alloc.note_off(60, 0, Origin::Keyboard, 7, &mut out);
        out.clear();

        // Sustained 60 goes first
        strike(&mut alloc, 65, 10, &mut out);
        assert_eq!(offs(&out), vec![60]);
        out.clear();

        // Then the decaying 62, whose off was already sent
        strike(&mut alloc, 67, 11, &mut out);
        assert_eq!(offs(&out), vec![], "decaying victim must not re-off");
        assert_eq!(alloc.active(), 3);
    }

    #[test]
    fn test_layer_origin_release() {
        let mut alloc = VoiceAllocator::new(8);
        let mut out = Vec::new();
        alloc.note_on(60, 100, 0, Origin::Keyboard, 0, &mut out);
        alloc.note_on(60, 80, 1, Origin::Layer, 0, &mut out);
        alloc.note_on(64, 80, 1, Origin::Layer, 1, &mut out);
        out.clear();

        alloc.release_origin(Origin::Layer, 10, &mut out);
        let released = offs(&out);
        assert_eq!(released, vec![60, 64]);
        // Primary note untouched
        assert!(alloc.is_held(0, 60));
    }

    #[test]
    fn test_layer_copy_holds_its_own_slot() {
        let mut alloc = VoiceAllocator::new(8);
        let mut out = Vec::new();
        alloc.note_on(60, 100, 0, Origin::Keyboard, 0, &mut out);
        alloc.note_on(60, 80, 1, Origin::Layer, 0, &mut out);
        // Same pitch on two channels: two voices, no steal
        assert_eq!(alloc.active(), 2);
        assert_eq!(out.iter().filter(|e| matches!(e, NoteEvent::Off { .. })).count(), 0);
    }

    #[test]
    fn test_panic_clears_everything() {
        let mut alloc = VoiceAllocator::new(8);
        let mut out = Vec::new();
        for pitch in [60u8, 62, 64] {
            strike(&mut alloc, pitch, 0, &mut out);
        }
        alloc.set_sustain(true, 1, &mut out);
        alloc.panic();
        assert_eq!(alloc.active(), 0);
        assert_eq!(alloc.held_count(), 0);
    }

    #[test]
    fn test_voice_count_never_exceeds_cap() {
        let mut alloc = VoiceAllocator::new(4);
        let mut out = Vec::new();
        for i in 0..40u64 {
            let pitch = (30 + (i * 7) % 60) as u8;
            strike(&mut alloc, pitch, i, &mut out);
            assert!(alloc.active() <= 4, "cap exceeded at step {}", i);
            if i % 3 == 0 {
                alloc.note_off(pitch, 0, Origin::Keyboard, i, &mut out);
            }
        }
    }
}
