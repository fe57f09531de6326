//! MIDI port I/O for tactus
//!
//! This crate provides:
//! - MIDI input ports whose driver callback timestamps incoming
//!   messages and hands them to the application through the lock-free
//!   queue from `tactus-core`
//! - MIDI output ports with outgoing message validation
//! - Port discovery by case-insensitive substring match via midir
//! - An optional flume bridge for async consumers
//! - YAML port configuration
//!
//! # Architecture
//!
//! ```text
//! MIDI device → midir callback → MessageQueue (SPSC) → app poll
//!                                      └→ flume bridge → async task
//! ```
//!
//! The midir callback never blocks and never allocates on the push
//! path; a full queue drops the message and bumps a counter the
//! application can inspect.

mod config;
mod connection;
mod input;
mod output;

pub use config::{default_port_config_path, load_port_config, save_port_config, PortConfig};
pub use connection::{list_input_ports, list_output_ports, MidiPortError};
pub use input::{IgnoreTypes, MidiInputPort};
pub use output::MidiOutputPort;

pub use tactus_core::queue::MidiMessage;
