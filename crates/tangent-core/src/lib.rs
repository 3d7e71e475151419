//! Tangent core — the realtime input→event→voice pipeline
//!
//! Turns a laptop's keyboard and touchpad into a MIDI controller driving a
//! SoundFont renderer. Three execution contexts share nothing mutable:
//! device reader threads and the fan-in task (input), the renderer adapter
//! inside the audio callback (audio), and the supervisor/health probe
//! (supervisory). Everything crosses between them as value-typed events on
//! lock-free channels.

pub mod arp;
pub mod audio;
pub mod bus;
pub mod clock;
pub mod config;
pub mod error;
pub mod gm;
pub mod health;
pub mod input;
pub mod keymap;
pub mod layer;
pub mod pipeline;
pub mod render;
pub mod state;
pub mod types;
pub mod velocity;
pub mod voice;

pub use arp::{ArpClock, ArpMode, Arpeggiator};
pub use bus::{rt_channel, BusConsumer, BusProducer, Telemetry, TelemetryEvent};
pub use config::{Config, PersistedState};
pub use error::{AudioError, ConfigError, InputError, RendererError};
pub use pipeline::{FanInMessage, Pipeline, PipelineCommand, StateSnapshot};
pub use render::{
    tick_channel, AudioShared, Renderer, RendererAdapter, SilentRenderer, SoundFontId,
};
pub use types::{DeviceId, InputEvent, NoteEvent, Origin, RawKey};
pub use velocity::{VelocityComputer, VelocityConfig, VelocityMode};
pub use voice::VoiceAllocator;
