//! Error types for the Tangent core pipeline

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the audio backend
#[derive(Error, Debug)]
pub enum AudioError {
    /// No audio devices available
    #[error("No audio output devices found")]
    NoDevices,

    /// Requested host/driver is not available on this system
    #[error("Audio driver not available: {0}")]
    DriverUnavailable(String),

    /// Failed to get default device
    #[error("Failed to get default audio device: {0}")]
    NoDefaultDevice(String),

    /// Failed to get device configuration
    #[error("Failed to get device config: {0}")]
    ConfigError(String),

    /// Failed to build audio stream
    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    /// Failed to start/play stream
    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),
}

/// Result type for audio operations
pub type AudioResult<T> = Result<T, AudioError>;

/// Errors from kernel input devices
#[derive(Error, Debug)]
pub enum InputError {
    /// Opening the device node failed
    #[error("Failed to open input device {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Exclusive grab was refused after all retries
    #[error("Failed to grab input device {name} after {attempts} attempts: {source}")]
    Grab {
        name: String,
        attempts: u32,
        source: std::io::Error,
    },

    /// Permission denied; actionable hint for the common case
    #[error(
        "Permission denied opening {path}: add yourself to the 'input' group \
         (sudo usermod -aG input $USER) and log back in"
    )]
    Permission { path: PathBuf },

    /// No usable input devices were found at startup
    #[error(
        "No keyboard input devices found; if devices exist, join the 'input' \
         group (sudo usermod -aG input $USER) and log back in"
    )]
    NoKeyboard,
}

/// Errors from the consumed renderer contract
#[derive(Error, Debug)]
pub enum RendererError {
    /// Soundfont file could not be loaded
    #[error("Failed to load soundfont {path}: {reason}")]
    SoundFont { path: PathBuf, reason: String },

    /// The renderer failed to produce samples
    #[error("Render failed: {0}")]
    Render(String),

    /// Renderer re-initialization failed
    #[error("Renderer re-init failed: {0}")]
    Reinit(String),
}

/// Errors from configuration loading and validation.
///
/// Out-of-range values name the offending field precisely; nothing is
/// silently clamped.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file exists but could not be read
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Config file exists but is not valid YAML for the expected schema
    #[error("Failed to parse config file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    /// A field holds a value outside its documented range
    #[error("Config field `{field}` is {value}, allowed range is {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    /// A field references something that does not exist
    #[error("Config field `{field}` is invalid: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// Persisted state could not be written
    #[error("Failed to write state file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}
