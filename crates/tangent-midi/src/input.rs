//! MIDI input handler
//!
//! The midir callback runs on the MIDI driver's thread: it validates the
//! message, stamps it, and hands it to the fan-in channel without
//! blocking. Parsing into note semantics happens in the pipeline, which
//! already owns the allocator.

use flume::Sender;
use midir::MidiInputConnection;

use tangent_core::clock::monotonic_ns;
use tangent_core::pipeline::FanInMessage;
use tangent_core::types::{DeviceId, InputEvent};

use crate::connection::find_input_port;
use crate::MidiError;

struct CallbackData {
    tx: Sender<FanInMessage>,
    device: DeviceId,
}

/// Owns the midir connection for its lifetime; dropping disconnects.
pub struct MidiInputHandler {
    _connection: MidiInputConnection<CallbackData>,
    port_name: String,
    device: DeviceId,
}

impl MidiInputHandler {
    /// Connect to a MIDI input port and start forwarding into the fan-in
    /// channel under the given device id.
    pub fn connect(
        port_match: Option<&str>,
        device: DeviceId,
        tx: Sender<FanInMessage>,
    ) -> Result<Self, MidiError> {
        let (midi_in, port, port_name) = find_input_port(port_match)?;
        let data = CallbackData { tx, device };
        let connection = midi_in
            .connect(&port, "tangent-midi-input", Self::callback, data)
            .map_err(|err| MidiError::Connect {
                port: port_name.clone(),
                reason: err.to_string(),
            })?;
        log::info!("MIDI input connected: {}", port_name);
        Ok(Self {
            _connection: connection,
            port_name,
            device,
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Called from the MIDI driver thread; must stay fast and non-blocking.
    fn callback(_timestamp_us: u64, data: &[u8], ctx: &mut CallbackData) {
        // Channel voice messages are exactly what the pipeline understands;
        // system messages (0xF0..) are dropped here
        let (status, d1, d2) = match *data {
            [status, d1, d2, ..] if status < 0xF0 => (status, d1, d2),
            [status, d1] if status < 0xF0 => (status, d1, 0),
            _ => return,
        };
        let event = InputEvent::Midi {
            status,
            d1,
            d2,
            t: monotonic_ns(),
        };
        if ctx
            .tx
            .try_send(FanInMessage::Input {
                device: ctx.device,
                event,
            })
            .is_err()
        {
            log::warn!("MIDI: fan-in channel full, dropping message");
        }
    }
}
