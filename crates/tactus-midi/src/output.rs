//! MIDI output ports
//!
//! Outgoing messages are validated against the MIDI framing rules
//! before being handed to the driver, so a malformed byte slice is an
//! error here rather than undefined device behavior.

use midir::MidiOutputConnection;

use crate::connection::{find_output_port, MidiPortError};

/// An open MIDI output port.
pub struct MidiOutputPort {
    connection: MidiOutputConnection,
}

impl MidiOutputPort {
    /// Find a port matching `port_match` and open it.
    pub fn open(port_match: &str) -> Result<Self, MidiPortError> {
        let (midi_out, port) = find_output_port("tactus-midi-out", port_match)?;
        let connection = midi_out
            .connect(&port, "tactus-midi-output")
            .map_err(|e| MidiPortError::Connection(e.to_string()))?;
        log::info!("midi: output port open");
        Ok(Self { connection })
    }

    /// Validate and send one MIDI message.
    pub fn send(&mut self, message: &[u8]) -> Result<(), MidiPortError> {
        validate_message(message)?;
        self.connection
            .send(message)
            .map_err(|e| MidiPortError::Connection(e.to_string()))
    }
}

/// Check status byte, data byte range and expected message length.
fn validate_message(message: &[u8]) -> Result<(), MidiPortError> {
    let status = *message
        .first()
        .ok_or_else(|| MidiPortError::InvalidMessage("empty message".to_string()))?;
    if status < 0x80 {
        return Err(MidiPortError::InvalidMessage(format!(
            "first byte {:#04x} is not a status byte",
            status
        )));
    }

    if status == 0xF0 {
        // Sysex: arbitrary 7-bit payload, terminated by EOX.
        if *message.last().unwrap_or(&0) != 0xF7 {
            return Err(MidiPortError::InvalidMessage(
                "sysex message missing 0xF7 terminator".to_string(),
            ));
        }
        if let Some(byte) = message[1..message.len() - 1].iter().find(|b| **b >= 0x80) {
            return Err(MidiPortError::InvalidMessage(format!(
                "status byte {:#04x} inside sysex payload",
                byte
            )));
        }
        return Ok(());
    }

    let expected_data = match status & 0xF0 {
        0x80 | 0x90 | 0xA0 | 0xB0 | 0xE0 => 2,
        0xC0 | 0xD0 => 1,
        0xF0 => match status {
            0xF1 | 0xF3 => 1,
            0xF2 => 2,
            _ => 0, // tune request, real-time
        },
        _ => unreachable!("status byte has high bit set"),
    };

    if message.len() != expected_data + 1 {
        return Err(MidiPortError::InvalidMessage(format!(
            "status {:#04x} expects {} data bytes, got {}",
            status,
            expected_data,
            message.len() - 1
        )));
    }
    if let Some(byte) = message[1..].iter().find(|b| **b >= 0x80) {
        return Err(MidiPortError::InvalidMessage(format!(
            "data byte {:#04x} has high bit set",
            byte
        )));
    }
    Ok(())
}
