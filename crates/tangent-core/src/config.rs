//! Configuration and persisted state
//!
//! The config file is YAML in the user config directory. Loading is
//! strict: a file that parses but holds an out-of-range value refuses to
//! start, naming the field — performance settings are never silently
//! clamped. A missing file yields defaults.
//!
//! Persisted state (last program, octave, modes, favorites) is a cache,
//! not configuration: it loads leniently and is written atomically on
//! shutdown via a temp file and rename.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::arp::ArpMode;
use crate::error::ConfigError;
use crate::velocity::{VelocityConfig, VelocityMode};

/// Audio driver / host selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioDriver {
    /// Platform default host
    #[default]
    Auto,
    Alsa,
    Jack,
    /// PipeWire exposes itself through the default host's compatibility
    /// layer, so this selects the default host too
    Pipewire,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub driver: AudioDriver,
    pub sample_rate: u32,
    pub buffer_frames: u32,
    pub max_polyphony: usize,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            driver: AudioDriver::Auto,
            sample_rate: 48_000,
            buffer_frames: 256,
            max_polyphony: crate::types::DEFAULT_MAX_POLYPHONY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyboardSettings {
    /// Base octave, 0..=8
    pub octave: u8,
    /// Startup program, 0..=127
    pub program: u8,
    /// Grab devices exclusively so keypresses do not leak to the desktop
    pub grab: bool,
    /// Raw key code -> semitone offset overrides on top of the default
    /// QWERTY layout
    pub keymap: HashMap<u16, i8>,
}

impl Default for KeyboardSettings {
    fn default() -> Self {
        Self {
            octave: 6,
            program: 0,
            grab: true,
            keymap: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArpSettings {
    pub bpm: f32,
    /// Steps per beat; 4 = sixteenth notes
    pub steps_per_beat: u32,
    /// Seed for the random mode
    pub seed: u64,
}

impl Default for ArpSettings {
    fn default() -> Self {
        Self {
            bpm: 120.0,
            steps_per_beat: 4,
            seed: 0x5EED_0BAD_CAFE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerSettings {
    /// Program for the layer channel
    pub program: u8,
}

impl Default for LayerSettings {
    fn default() -> Self {
        Self { program: 48 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TouchpadSettings {
    pub enabled: bool,
    /// Route X/Y/pressure to bend, filter cutoff and expression
    pub modulation: bool,
    pub pitch_bend_semitones: u8,
}

impl Default for TouchpadSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            modulation: true,
            pitch_bend_semitones: 2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MidiSettings {
    pub enabled: bool,
    /// Port name substring; None auto-detects
    pub port: Option<String>,
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub audio: AudioSettings,
    pub keyboard: KeyboardSettings,
    pub velocity: VelocityConfig,
    pub arp: ArpSettings,
    pub layer: LayerSettings,
    pub touchpad: TouchpadSettings,
    pub midi: MidiSettings,
}

fn check_range(field: &'static str, value: i64, min: i64, max: i64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

impl Config {
    /// Validate every bounded field, naming the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("audio.sample_rate", self.audio.sample_rate as i64, 8_000, 192_000)?;
        check_range("audio.buffer_frames", self.audio.buffer_frames as i64, 32, 8_192)?;
        check_range("audio.max_polyphony", self.audio.max_polyphony as i64, 1, 256)?;
        check_range("keyboard.octave", self.keyboard.octave as i64, 0, 8)?;
        check_range("keyboard.program", self.keyboard.program as i64, 0, 127)?;
        check_range("velocity.min", self.velocity.min as i64, 1, 127)?;
        check_range("velocity.max", self.velocity.max as i64, 1, 127)?;
        if self.velocity.min > self.velocity.max {
            return Err(ConfigError::Invalid {
                field: "velocity.min",
                reason: format!(
                    "min ({}) exceeds max ({})",
                    self.velocity.min, self.velocity.max
                ),
            });
        }
        check_range("velocity.fixed", self.velocity.fixed as i64, 1, 127)?;
        check_range("velocity.row_bottom", self.velocity.row_bottom as i64, 1, 127)?;
        check_range("velocity.row_home", self.velocity.row_home as i64, 1, 127)?;
        check_range("velocity.row_top", self.velocity.row_top as i64, 1, 127)?;
        if !(self.velocity.window_secs > 0.0 && self.velocity.window_secs <= 30.0) {
            return Err(ConfigError::Invalid {
                field: "velocity.window_secs",
                reason: format!("{} is outside (0, 30]", self.velocity.window_secs),
            });
        }
        if !(0.0..=1.0).contains(&self.velocity.pressure_threshold) {
            return Err(ConfigError::Invalid {
                field: "velocity.pressure_threshold",
                reason: format!("{} is outside [0, 1]", self.velocity.pressure_threshold),
            });
        }
        if !(0.0..1.0).contains(&self.velocity.pressure_smoothing) {
            return Err(ConfigError::Invalid {
                field: "velocity.pressure_smoothing",
                reason: format!("{} is outside [0, 1)", self.velocity.pressure_smoothing),
            });
        }
        if !(30.0..=300.0).contains(&self.arp.bpm) {
            return Err(ConfigError::Invalid {
                field: "arp.bpm",
                reason: format!("{} is outside [30, 300]", self.arp.bpm),
            });
        }
        check_range("arp.steps_per_beat", self.arp.steps_per_beat as i64, 1, 16)?;
        check_range("layer.program", self.layer.program as i64, 0, 127)?;
        check_range(
            "touchpad.pitch_bend_semitones",
            self.touchpad.pitch_bend_semitones as i64,
            1,
            24,
        )?;
        for (&code, &offset) in &self.keyboard.keymap {
            if !(-24..=24).contains(&offset) {
                return Err(ConfigError::Invalid {
                    field: "keyboard.keymap",
                    reason: format!("offset {} for key code {} is outside [-24, 24]", offset, code),
                });
            }
        }
        Ok(())
    }

    /// Load and validate a config file. Missing file means defaults;
    /// everything else that is wrong is an error, never a fallback.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::info!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self =
            serde_yaml::from_str(&contents).map_err(|err| ConfigError::Parse {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;
        config.validate()?;
        log::info!("Loaded config from {:?}", path);
        Ok(config)
    }
}

/// Directory holding the config and state files
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tangent")
}

/// Default config file path: `~/.config/tangent/config.yaml`
pub fn default_config_path() -> PathBuf {
    config_dir().join("config.yaml")
}

/// Default persisted-state path: `~/.config/tangent/state.yaml`
pub fn default_state_path() -> PathBuf {
    config_dir().join("state.yaml")
}

/// State remembered across runs, written on shutdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub last_program: u8,
    pub last_octave: u8,
    pub layer_on: bool,
    pub layer_program: u8,
    pub arp_mode: ArpMode,
    pub velocity_mode: VelocityMode,
    pub soundfont_favorites: Vec<PathBuf>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            last_program: 0,
            last_octave: 6,
            layer_on: false,
            layer_program: 48,
            arp_mode: ArpMode::Off,
            velocity_mode: VelocityMode::default(),
            soundfont_favorites: Vec::new(),
        }
    }
}

impl PersistedState {
    /// Lenient load: state is a cache, so a broken file logs and defaults.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_yaml::from_str(&contents) {
                Ok(state) => state,
                Err(err) => {
                    log::warn!("Ignoring unreadable state file {:?}: {}", path, err);
                    Self::default()
                }
            },
            Err(err) => {
                log::warn!("Ignoring unreadable state file {:?}: {}", path, err);
                Self::default()
            }
        }
    }

    /// Atomic save: write a sibling temp file, then rename over the target.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let yaml = serde_yaml::to_string(self).map_err(|err| ConfigError::Write {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()),
        })?;
        let tmp = path.with_extension("yaml.tmp");
        std::fs::write(&tmp, yaml).map_err(|source| ConfigError::Write {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, path).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_out_of_range_names_the_field() {
        let mut config = Config::default();
        config.keyboard.octave = 9;
        let err = config.validate().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("keyboard.octave"), "{}", message);
        assert!(message.contains("9"), "{}", message);
    }

    #[test]
    fn test_velocity_min_above_max_rejected() {
        let mut config = Config::default();
        config.velocity.min = 100;
        config.velocity.max = 50;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_keymap_offset_bounds() {
        let mut config = Config::default();
        config.keyboard.keymap.insert(44, 30);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("keyboard.keymap"));
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let config = Config::load(Path::new("/nonexistent/tangent/config.yaml")).unwrap();
        assert_eq!(config.keyboard.octave, 6);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "keyboard:\n  octave: 12\n").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("keyboard.octave"));
    }

    #[test]
    fn test_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut config = Config::default();
        config.arp.bpm = 90.0;
        std::fs::write(&path, serde_yaml::to_string(&config).unwrap()).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.arp.bpm, 90.0);
    }

    #[test]
    fn test_persisted_state_roundtrip_is_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.yaml");
        let state = PersistedState {
            last_program: 42,
            last_octave: 3,
            layer_on: true,
            ..PersistedState::default()
        };
        state.save(&path).unwrap();
        assert!(!path.with_extension("yaml.tmp").exists());
        assert_eq!(PersistedState::load(&path), state);
    }

    #[test]
    fn test_persisted_state_lenient_on_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.yaml");
        std::fs::write(&path, ":: not yaml ::").unwrap();
        assert_eq!(PersistedState::load(&path), PersistedState::default());
    }
}
