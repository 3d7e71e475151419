//! Scan-code to note and control mapping
//!
//! Pure lookup tables translating raw key codes into pitch-class offsets or
//! control roles. The default layout spreads three overlapping octaves
//! across the QWERTY rows (bottom row bass, home row middle, top row
//! treble) with the sharps on the number row; offsets can be overridden
//! from the config file.
//!
//! The mapper holds no playing state. Octave and transpose are applied at
//! lookup time from values the caller reads out of the state core.

use std::collections::HashMap;

use evdev::Key;

use crate::types::RawKey;

/// Keyboard row a note key belongs to, used by position-based velocity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Row {
    Bottom,
    Home,
    Top,
}

/// Non-note role of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    OctaveUp,
    OctaveDown,
    TransposeUp,
    TransposeDown,
    ProgramUp,
    ProgramDown,
    Sustain,
    Panic,
    LayerToggle,
    ArpToggle,
    /// F1..F12 preset slot, 0-based
    Preset(u8),
    ShiftModifier,
    CtrlModifier,
}

/// Resolved meaning of a key press under the current modifier state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Note { offset: i8, row: Row },
    Control(ControlAction),
}

/// Static raw-key lookup tables
pub struct KeyMap {
    notes: HashMap<RawKey, (i8, Row)>,
    controls: HashMap<RawKey, ControlAction>,
    shifted_controls: HashMap<RawKey, ControlAction>,
    ctrl_controls: HashMap<RawKey, ControlAction>,
}

impl KeyMap {
    /// The default three-row QWERTY layout.
    ///
    /// Offsets are semitones relative to `octave * 12`; with the default
    /// octave of 6 the bottom row starts at C3 (48), the home row at middle
    /// C (60) and the top row at C5 (72).
    pub fn default_layout() -> Self {
        let mut notes = HashMap::new();

        let top: [(Key, i8); 12] = [
            (Key::KEY_Q, 0),
            (Key::KEY_W, 2),
            (Key::KEY_E, 4),
            (Key::KEY_R, 5),
            (Key::KEY_T, 7),
            (Key::KEY_Y, 9),
            (Key::KEY_U, 11),
            (Key::KEY_I, 12),
            (Key::KEY_O, 14),
            (Key::KEY_P, 16),
            (Key::KEY_LEFTBRACE, 17),
            (Key::KEY_RIGHTBRACE, 19),
        ];
        // Number row carries the sharps of the top row
        let sharps: [(Key, i8); 7] = [
            (Key::KEY_2, 1),
            (Key::KEY_3, 3),
            (Key::KEY_5, 6),
            (Key::KEY_6, 8),
            (Key::KEY_7, 10),
            (Key::KEY_9, 13),
            (Key::KEY_0, 15),
        ];
        let home: [(Key, i8); 11] = [
            (Key::KEY_A, -12),
            (Key::KEY_S, -10),
            (Key::KEY_D, -8),
            (Key::KEY_F, -7),
            (Key::KEY_G, -5),
            (Key::KEY_H, -3),
            (Key::KEY_J, -1),
            (Key::KEY_K, 0),
            (Key::KEY_L, 2),
            (Key::KEY_SEMICOLON, 4),
            (Key::KEY_APOSTROPHE, 5),
        ];
        let bottom: [(Key, i8); 10] = [
            (Key::KEY_Z, -24),
            (Key::KEY_X, -22),
            (Key::KEY_C, -20),
            (Key::KEY_V, -19),
            (Key::KEY_B, -17),
            (Key::KEY_N, -15),
            (Key::KEY_M, -13),
            (Key::KEY_COMMA, -12),
            (Key::KEY_DOT, -10),
            (Key::KEY_SLASH, -8),
        ];

        for (key, offset) in top.iter().chain(sharps.iter()) {
            notes.insert(RawKey(key.code()), (*offset, Row::Top));
        }
        for (key, offset) in &home {
            notes.insert(RawKey(key.code()), (*offset, Row::Home));
        }
        for (key, offset) in &bottom {
            notes.insert(RawKey(key.code()), (*offset, Row::Bottom));
        }

        let mut controls = HashMap::new();
        controls.insert(RawKey(Key::KEY_EQUAL.code()), ControlAction::OctaveUp);
        controls.insert(RawKey(Key::KEY_MINUS.code()), ControlAction::OctaveDown);
        controls.insert(RawKey(Key::KEY_SPACE.code()), ControlAction::Sustain);
        controls.insert(RawKey(Key::KEY_ESC.code()), ControlAction::Panic);
        controls.insert(RawKey(Key::KEY_PAGEUP.code()), ControlAction::ProgramUp);
        controls.insert(RawKey(Key::KEY_PAGEDOWN.code()), ControlAction::ProgramDown);
        controls.insert(RawKey(Key::KEY_LEFTSHIFT.code()), ControlAction::ShiftModifier);
        controls.insert(RawKey(Key::KEY_RIGHTSHIFT.code()), ControlAction::ShiftModifier);
        controls.insert(RawKey(Key::KEY_LEFTCTRL.code()), ControlAction::CtrlModifier);
        controls.insert(RawKey(Key::KEY_RIGHTCTRL.code()), ControlAction::CtrlModifier);
        let presets = [
            Key::KEY_F1,
            Key::KEY_F2,
            Key::KEY_F3,
            Key::KEY_F4,
            Key::KEY_F5,
            Key::KEY_F6,
            Key::KEY_F7,
            Key::KEY_F8,
            Key::KEY_F9,
            Key::KEY_F10,
            Key::KEY_F11,
            Key::KEY_F12,
        ];
        for (i, key) in presets.iter().enumerate() {
            controls.insert(RawKey(key.code()), ControlAction::Preset(i as u8));
        }

        // Shift turns the </> keys into transpose; unshifted they are notes
        let mut shifted_controls = HashMap::new();
        shifted_controls.insert(RawKey(Key::KEY_DOT.code()), ControlAction::TransposeUp);
        shifted_controls.insert(RawKey(Key::KEY_COMMA.code()), ControlAction::TransposeDown);

        // Ctrl chords for mode toggles so the plain letters stay playable
        let mut ctrl_controls = HashMap::new();
        ctrl_controls.insert(RawKey(Key::KEY_L.code()), ControlAction::LayerToggle);
        ctrl_controls.insert(RawKey(Key::KEY_A.code()), ControlAction::ArpToggle);

        Self {
            notes,
            controls,
            shifted_controls,
            ctrl_controls,
        }
    }

    /// Default layout with note offsets overridden from configuration.
    ///
    /// Keys not present in the default layout are added with `Row::Home`
    /// for position velocity purposes.
    pub fn with_overrides(overrides: &HashMap<u16, i8>) -> Self {
        let mut map = Self::default_layout();
        for (&code, &offset) in overrides {
            let raw = RawKey(code);
            let row = map.notes.get(&raw).map(|(_, row)| *row).unwrap_or(Row::Home);
            map.notes.insert(raw, (offset, row));
        }
        map
    }

    /// Resolve a key under the current modifier state.
    ///
    /// Modifier-gated controls win over the plain note meaning of the same
    /// key; unmapped keys return `None` and are ignored upstream.
    pub fn action(&self, raw: RawKey, shift: bool, ctrl: bool) -> Option<KeyAction> {
        if ctrl {
            if let Some(&action) = self.ctrl_controls.get(&raw) {
                return Some(KeyAction::Control(action));
            }
        }
        if shift {
            if let Some(&action) = self.shifted_controls.get(&raw) {
                return Some(KeyAction::Control(action));
            }
        }
        if let Some(&action) = self.controls.get(&raw) {
            return Some(KeyAction::Control(action));
        }
        self.notes
            .get(&raw)
            .map(|&(offset, row)| KeyAction::Note { offset, row })
    }

    /// Row of a note key, if it maps to one
    pub fn row(&self, raw: RawKey) -> Option<Row> {
        self.notes.get(&raw).map(|&(_, row)| row)
    }
}

/// Compute the MIDI note number for a pitch-class offset under the current
/// octave and transpose, clamped to [0, 127].
pub fn note_number(offset: i8, octave: u8, transpose: i8) -> u8 {
    let note = octave as i32 * 12 + offset as i32 + transpose as i32;
    note.clamp(0, 127) as u8
}

/// Note name for display and telemetry, e.g. 60 -> "C4"
pub fn note_name(pitch: u8) -> String {
    const NAMES: [&str; 12] = [
        "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
    ];
    let octave = (pitch / 12) as i32 - 1;
    format!("{}{}", NAMES[(pitch % 12) as usize], octave)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout_rows() {
        let map = KeyMap::default_layout();
        assert_eq!(
            map.action(RawKey(Key::KEY_Z.code()), false, false),
            Some(KeyAction::Note {
                offset: -24,
                row: Row::Bottom
            })
        );
        assert_eq!(map.row(RawKey(Key::KEY_A.code())), Some(Row::Home));
        assert_eq!(map.row(RawKey(Key::KEY_Q.code())), Some(Row::Top));
        assert_eq!(map.row(RawKey(Key::KEY_2.code())), Some(Row::Top));
    }

    #[test]
    fn test_note_number_default_octave() {
        // Default octave 6: bottom row starts at C3, home row at middle C
        assert_eq!(note_number(-24, 6, 0), 48);
        assert_eq!(note_number(-12, 6, 0), 60);
        assert_eq!(note_number(0, 6, 0), 72);
    }

    #[test]
    fn test_note_number_clamps() {
        assert_eq!(note_number(-24, 0, -12), 0);
        assert_eq!(note_number(19, 8, 12), 127);
    }

    #[test]
    fn test_shift_gates_transpose() {
        let map = KeyMap::default_layout();
        // Unshifted '.' is a bottom-row note
        assert!(matches!(
            map.action(RawKey(Key::KEY_DOT.code()), false, false),
            Some(KeyAction::Note { .. })
        ));
        assert_eq!(
            map.action(RawKey(Key::KEY_DOT.code()), true, false),
            Some(KeyAction::Control(ControlAction::TransposeUp))
        );
    }

    #[test]
    fn test_ctrl_gates_mode_toggles() {
        let map = KeyMap::default_layout();
        assert!(matches!(
            map.action(RawKey(Key::KEY_A.code()), false, false),
            Some(KeyAction::Note { .. })
        ));
        assert_eq!(
            map.action(RawKey(Key::KEY_A.code()), false, true),
            Some(KeyAction::Control(ControlAction::ArpToggle))
        );
    }

    #[test]
    fn test_overrides_replace_offsets() {
        let mut overrides = HashMap::new();
        overrides.insert(Key::KEY_Z.code(), 0i8);
        let map = KeyMap::with_overrides(&overrides);
        assert_eq!(
            map.action(RawKey(Key::KEY_Z.code()), false, false),
            Some(KeyAction::Note {
                offset: 0,
                row: Row::Bottom
            })
        );
    }

    #[test]
    fn test_unmapped_key_is_none() {
        let map = KeyMap::default_layout();
        assert_eq!(map.action(RawKey(Key::KEY_F13.code()), false, false), None);
    }

    #[test]
    fn test_note_name() {
        assert_eq!(note_name(60), "C4");
        assert_eq!(note_name(61), "C#4");
        assert_eq!(note_name(0), "C-1");
    }
}
