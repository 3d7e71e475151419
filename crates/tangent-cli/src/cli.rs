//! Command line and environment overrides
//!
//! Every environment variable mirrors a CLI flag exactly and is read once
//! at startup; precedence is CLI > environment > persisted state > config
//! file > defaults.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use tangent_core::config::{AudioDriver, Config};
use tangent_core::velocity::VelocityMode;

#[derive(Parser, Debug)]
#[command(name = "tangent")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Play your laptop keyboard and touchpad as a synthesizer", long_about = None)]
pub struct Cli {
    /// Audio driver to use
    #[arg(long, value_enum)]
    pub driver: Option<DriverArg>,

    /// SoundFont file to load
    #[arg(long, value_name = "FILE")]
    pub soundfont: Option<PathBuf>,

    /// Starting octave
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=8))]
    pub octave: Option<u8>,

    /// Starting program
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=127))]
    pub program: Option<u8>,

    /// Velocity source
    #[arg(long, value_enum)]
    pub velocity: Option<VelocityArg>,

    /// Fixed velocity value; implies --velocity fixed
    #[arg(long, value_name = "VEL", value_parser = clap::value_parser!(u8).range(1..=127))]
    pub fixed_velocity: Option<u8>,

    /// Enable external MIDI input
    #[arg(long)]
    pub midi: bool,

    /// MIDI port name substring to connect to
    #[arg(long, value_name = "NAME")]
    pub midi_port: Option<String>,

    /// Verbose logging (RUST_LOG overrides)
    #[arg(short, long)]
    pub verbose: bool,

    /// Run without an audio device (pipeline driven by a timer)
    #[arg(long)]
    pub headless: bool,

    /// Config file path
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DriverArg {
    Auto,
    Alsa,
    Jack,
    Pipewire,
}

impl From<DriverArg> for AudioDriver {
    fn from(arg: DriverArg) -> Self {
        match arg {
            DriverArg::Auto => AudioDriver::Auto,
            DriverArg::Alsa => AudioDriver::Alsa,
            DriverArg::Jack => AudioDriver::Jack,
            DriverArg::Pipewire => AudioDriver::Pipewire,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum VelocityArg {
    Timing,
    Pressure,
    Position,
    Combined,
    Fixed,
}

impl From<VelocityArg> for VelocityMode {
    fn from(arg: VelocityArg) -> Self {
        match arg {
            VelocityArg::Timing => VelocityMode::Timing,
            VelocityArg::Pressure => VelocityMode::Pressure,
            VelocityArg::Position => VelocityMode::Position,
            VelocityArg::Combined => VelocityMode::Combined,
            VelocityArg::Fixed => VelocityMode::Fixed,
        }
    }
}

/// An environment variable held a value its CLI twin would reject.
#[derive(Debug)]
pub struct EnvError {
    pub variable: &'static str,
    pub value: String,
    pub expected: &'static str,
}

impl std::fmt::Display for EnvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}={:?} is invalid, expected {}",
            self.variable, self.value, self.expected
        )
    }
}

/// Environment overrides, each equivalent to its CLI flag.
#[derive(Debug, Default)]
pub struct EnvOverrides {
    pub driver: Option<AudioDriver>,
    pub soundfont: Option<PathBuf>,
    pub octave: Option<u8>,
    pub velocity: Option<VelocityMode>,
}

impl EnvOverrides {
    pub fn read() -> Result<Self, EnvError> {
        let mut overrides = Self::default();

        if let Ok(value) = std::env::var("TANGENT_DRIVER") {
            overrides.driver = Some(match value.to_lowercase().as_str() {
                "auto" => AudioDriver::Auto,
                "alsa" => AudioDriver::Alsa,
                "jack" => AudioDriver::Jack,
                "pipewire" => AudioDriver::Pipewire,
                _ => {
                    return Err(EnvError {
                        variable: "TANGENT_DRIVER",
                        value,
                        expected: "auto, alsa, jack or pipewire",
                    })
                }
            });
        }

        if let Ok(value) = std::env::var("TANGENT_SOUNDFONT") {
            overrides.soundfont = Some(PathBuf::from(value));
        }

        if let Ok(value) = std::env::var("TANGENT_OCTAVE") {
            match value.parse::<u8>() {
                Ok(octave) if octave <= 8 => overrides.octave = Some(octave),
                _ => {
                    return Err(EnvError {
                        variable: "TANGENT_OCTAVE",
                        value,
                        expected: "an integer in 0..=8",
                    })
                }
            }
        }

        if let Ok(value) = std::env::var("TANGENT_VELOCITY") {
            overrides.velocity = Some(match value.to_lowercase().as_str() {
                "timing" => VelocityMode::Timing,
                "pressure" => VelocityMode::Pressure,
                "position" => VelocityMode::Position,
                "combined" => VelocityMode::Combined,
                "fixed" => VelocityMode::Fixed,
                _ => {
                    return Err(EnvError {
                        variable: "TANGENT_VELOCITY",
                        value,
                        expected: "timing, pressure, position, combined or fixed",
                    })
                }
            });
        }

        Ok(overrides)
    }
}

/// Fold environment and CLI overrides into the loaded config.
/// Returns the soundfont path to load, if any.
pub fn apply_overrides(config: &mut Config, env: &EnvOverrides, cli: &Cli) -> Option<PathBuf> {
    if let Some(driver) = env.driver {
        config.audio.driver = driver;
    }
    if let Some(octave) = env.octave {
        config.keyboard.octave = octave;
    }
    if let Some(mode) = env.velocity {
        config.velocity.mode = mode;
    }

    if let Some(driver) = cli.driver {
        config.audio.driver = driver.into();
    }
    if let Some(octave) = cli.octave {
        config.keyboard.octave = octave;
    }
    if let Some(program) = cli.program {
        config.keyboard.program = program;
    }
    if let Some(mode) = cli.velocity {
        config.velocity.mode = mode.into();
    }
    if let Some(fixed) = cli.fixed_velocity {
        config.velocity.fixed = fixed;
        config.velocity.mode = VelocityMode::Fixed;
    }
    if cli.midi {
        config.midi.enabled = true;
    }
    if let Some(port) = &cli.midi_port {
        config.midi.enabled = true;
        config.midi.port = Some(port.clone());
    }

    cli.soundfont.clone().or_else(|| env.soundfont.clone())
}
