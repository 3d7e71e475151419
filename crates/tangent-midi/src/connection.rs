//! MIDI port discovery

use midir::{MidiInput, MidiInputPort};

use crate::MidiError;

const CLIENT_NAME: &str = "tangent-midi";

/// List the names of all available MIDI input ports.
pub fn list_ports() -> Result<Vec<String>, MidiError> {
    let midi_in = MidiInput::new(CLIENT_NAME).map_err(|err| MidiError::Init(err.to_string()))?;
    Ok(midi_in
        .ports()
        .iter()
        .map(|port| {
            midi_in
                .port_name(port)
                .unwrap_or_else(|_| "unknown".to_string())
        })
        .collect())
}

/// Find an input port.
///
/// With a match string, the first port whose name contains it
/// (case-insensitive) wins. Without one, the first available port is used.
pub fn find_input_port(
    port_match: Option<&str>,
) -> Result<(MidiInput, MidiInputPort, String), MidiError> {
    let midi_in = MidiInput::new(CLIENT_NAME).map_err(|err| MidiError::Init(err.to_string()))?;
    let ports = midi_in.ports();
    if ports.is_empty() {
        return Err(MidiError::NoPorts);
    }

    let chosen = match port_match {
        Some(pattern) => {
            let needle = pattern.to_lowercase();
            ports
                .into_iter()
                .find(|port| {
                    midi_in
                        .port_name(port)
                        .map(|name| name.to_lowercase().contains(&needle))
                        .unwrap_or(false)
                })
                .ok_or_else(|| MidiError::NoMatch(pattern.to_string()))?
        }
        None => ports.into_iter().next().ok_or(MidiError::NoPorts)?,
    };

    let name = midi_in
        .port_name(&chosen)
        .unwrap_or_else(|_| "unknown".to_string());
    Ok((midi_in, chosen, name))
}
