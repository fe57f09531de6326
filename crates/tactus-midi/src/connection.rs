//! MIDI port discovery
//!
//! Uses midir for cross-platform MIDI I/O (ALSA on Linux, CoreMIDI on
//! macOS, WinMM on Windows). Ports are located by case-insensitive
//! substring match against the driver's port names.

use midir::{MidiInput, MidiOutput};

/// Error type for MIDI port operations
#[derive(Debug, thiserror::Error)]
pub enum MidiPortError {
    #[error("failed to initialize MIDI input: {0}")]
    InputInit(String),

    #[error("failed to initialize MIDI output: {0}")]
    OutputInit(String),

    #[error("no MIDI input ports available")]
    NoInputPorts,

    #[error("no MIDI output ports available")]
    NoOutputPorts,

    #[error("no MIDI port found matching pattern: {0}")]
    PortNotFound(String),

    #[error("failed to connect to MIDI port: {0}")]
    Connection(String),

    #[error("failed to get port info: {0}")]
    PortInfo(String),

    #[error("invalid MIDI message: {0}")]
    InvalidMessage(String),
}

/// Find an input port whose name contains `port_match`
/// (case-insensitive). Returns the client together with the port so
/// the caller can install its callback.
pub(crate) fn find_input_port(
    client_name: &str,
    port_match: &str,
) -> Result<(MidiInput, midir::MidiInputPort), MidiPortError> {
    let pattern = port_match.to_lowercase();

    let midi_in =
        MidiInput::new(client_name).map_err(|e| MidiPortError::InputInit(e.to_string()))?;

    let in_ports = midi_in.ports();
    if in_ports.is_empty() {
        return Err(MidiPortError::NoInputPorts);
    }

    let port = in_ports
        .into_iter()
        .find(|port| {
            midi_in
                .port_name(port)
                .map(|name| name.to_lowercase().contains(&pattern))
                .unwrap_or(false)
        })
        .ok_or_else(|| MidiPortError::PortNotFound(port_match.to_string()))?;

    let port_name = midi_in
        .port_name(&port)
        .map_err(|e| MidiPortError::PortInfo(e.to_string()))?;
    log::info!("midi: found input port: {}", port_name);

    Ok((midi_in, port))
}

/// Find an output port whose name contains `port_match`.
pub(crate) fn find_output_port(
    client_name: &str,
    port_match: &str,
) -> Result<(MidiOutput, midir::MidiOutputPort), MidiPortError> {
    let pattern = port_match.to_lowercase();

    let midi_out =
        MidiOutput::new(client_name).map_err(|e| MidiPortError::OutputInit(e.to_string()))?;

    let out_ports = midi_out.ports();
    if out_ports.is_empty() {
        return Err(MidiPortError::NoOutputPorts);
    }

    let port = out_ports
        .into_iter()
        .find(|port| {
            midi_out
                .port_name(port)
                .map(|name| name.to_lowercase().contains(&pattern))
                .unwrap_or(false)
        })
        .ok_or_else(|| MidiPortError::PortNotFound(port_match.to_string()))?;

    let port_name = midi_out
        .port_name(&port)
        .map_err(|e| MidiPortError::PortInfo(e.to_string()))?;
    log::info!("midi: found output port: {}", port_name);

    Ok((midi_out, port))
}

/// List all available MIDI input port names.
pub fn list_input_ports() -> Result<Vec<String>, MidiPortError> {
    let midi_in =
        MidiInput::new("tactus-midi-list").map_err(|e| MidiPortError::InputInit(e.to_string()))?;

    Ok(midi_in
        .ports()
        .iter()
        .filter_map(|port| midi_in.port_name(port).ok())
        .collect())
}

/// List all available MIDI output port names.
pub fn list_output_ports() -> Result<Vec<String>, MidiPortError> {
    let midi_out = MidiOutput::new("tactus-midi-list")
        .map_err(|e| MidiPortError::OutputInit(e.to_string()))?;

    Ok(midi_out
        .ports()
        .iter()
        .filter_map(|port| midi_out.port_name(port).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_ports() {
        // Port availability depends on the system; this just verifies
        // enumeration does not crash.
        let _input_ports = list_input_ports();
        let _output_ports = list_output_ports();
    }
}
