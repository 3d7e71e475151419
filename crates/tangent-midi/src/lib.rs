//! External MIDI input for Tangent
//!
//! Connects to a hardware MIDI port via `midir` and forwards raw messages
//! into the fan-in channel as `InputEvent::Midi`. The pipeline gives MIDI
//! notes the same allocator path as the laptop keyboard, tagged with their
//! own origin.

mod connection;
mod input;

pub use connection::{find_input_port, list_ports};
pub use input::MidiInputHandler;

use thiserror::Error;

/// Errors from MIDI port discovery and connection
#[derive(Error, Debug)]
pub enum MidiError {
    /// The MIDI backend could not be initialized
    #[error("Failed to initialize MIDI input: {0}")]
    Init(String),

    /// No input ports are available
    #[error("No MIDI input ports available")]
    NoPorts,

    /// No port matched the requested name
    #[error("No MIDI input port matching '{0}'")]
    NoMatch(String),

    /// Opening the port failed
    #[error("Failed to connect to MIDI port '{port}': {reason}")]
    Connect { port: String, reason: String },
}
