//! Common types for Tangent
//!
//! This module contains the fundamental event and identifier types used
//! throughout the Tangent synthesizer controller: raw input events as they
//! leave the device readers, and note events as they cross the realtime bus
//! into the audio thread.

/// MIDI channel the keyboard plays on
pub const PRIMARY_CHANNEL: u8 = 0;

/// MIDI channel the layer copy plays on
pub const LAYER_CHANNEL: u8 = 1;

/// Sustain pedal controller number (MIDI CC 64)
pub const SUSTAIN_CC: u8 = 64;

/// All-notes-off controller number (MIDI CC 123)
pub const ALL_NOTES_OFF_CC: u8 = 123;

/// Reset-all-controllers number (MIDI CC 121)
pub const RESET_CONTROLLERS_CC: u8 = 121;

/// Default polyphony cap (voices across all channels)
pub const DEFAULT_MAX_POLYPHONY: usize = 64;

/// Velocity used when no timing information exists yet (first strike)
pub const BASELINE_VELOCITY: u8 = 80;

/// Opaque scan-code identifier for a physical key or button.
///
/// The value is the kernel key code; it is never interpreted outside the
/// key map and the control table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawKey(pub u16);

/// Supervisor-assigned identifier for one physical input device.
///
/// Ids are never reused within a process: a device that is unplugged and
/// plugged back in gets a fresh id and inherits no state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u32);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Absolute axis of a touch surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Pressure,
}

/// Typed input event as produced by a device reader or the MIDI port.
///
/// Timestamps are monotonic nanoseconds (see [`crate::clock`]), captured as
/// close to the kernel event as possible.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEvent {
    /// Key transitioned to pressed
    KeyDown { raw: RawKey, t: u64 },
    /// Key transitioned to released
    KeyUp { raw: RawKey, t: u64 },
    /// Absolute axis sample, normalized to [0, 1]
    AxisMove { axis: Axis, normalized: f32, t: u64 },
    /// Touch contact state changed
    Touch { on: bool, t: u64 },
    /// Raw MIDI message from an external port
    Midi { status: u8, d1: u8, d2: u8, t: u64 },
    /// Terminal event: the device is gone and its reader has exited
    DeviceGone { id: DeviceId },
}

/// Logical source of a note event.
///
/// Never consulted by the renderer; retained for telemetry and for keeping
/// arp- and layer-synthesized events out of the transforms that created them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Keyboard,
    MidiIn,
    Arp,
    Layer,
}

/// Event crossing the realtime bus from the input thread to the audio thread.
///
/// Value-typed and `Copy`: nothing on the bus shares mutable memory between
/// threads. The audio-side consumer matches exhaustively.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NoteEvent {
    On {
        pitch: u8,
        velocity: u8,
        channel: u8,
        origin: Origin,
    },
    Off {
        pitch: u8,
        channel: u8,
        origin: Origin,
    },
    Cc {
        channel: u8,
        controller: u8,
        value: u8,
    },
    /// Pitch bend, value in [-8192, 8191]
    Bend { channel: u8, value: i16 },
    Program { channel: u8, program: u8 },
    /// Immediate release of every voice; promoted to the head of the bus
    Panic,
}

impl NoteEvent {
    /// Channel the event applies to, if it is channel-scoped
    pub fn channel(&self) -> Option<u8> {
        match self {
            NoteEvent::On { channel, .. }
            | NoteEvent::Off { channel, .. }
            | NoteEvent::Cc { channel, .. }
            | NoteEvent::Bend { channel, .. }
            | NoteEvent::Program { channel, .. } => Some(*channel),
            NoteEvent::Panic => None,
        }
    }
}

/// How a velocity value was derived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VelocitySource {
    Timing,
    Pressure,
    Position,
    Fixed,
}

/// A computed strike velocity, always in [1, 127]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VelocityInfo {
    pub value: u8,
    pub source: VelocitySource,
}

impl VelocityInfo {
    pub fn new(value: u8, source: VelocitySource) -> Self {
        debug_assert!((1..=127).contains(&value));
        Self { value, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_event_is_copy_and_small() {
        // Bus slots are value-typed; keep the event within a couple of words
        // so the lossy ring stays cache-friendly.
        let size = std::mem::size_of::<NoteEvent>();
        assert!(size <= 8, "NoteEvent is {} bytes, expected <= 8", size);
    }

    #[test]
    fn test_note_event_channel() {
        let on = NoteEvent::On {
            pitch: 60,
            velocity: 100,
            channel: 0,
            origin: Origin::Keyboard,
        };
        assert_eq!(on.channel(), Some(0));
        assert_eq!(NoteEvent::Panic.channel(), None);
    }

    #[test]
    fn test_device_id_display() {
        assert_eq!(DeviceId(3).to_string(), "dev3");
    }
}
