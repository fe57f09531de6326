//! Tactus Core - real-time audio I/O layer
//!
//! This crate provides:
//! - Callback-driven audio streams over CPAL or native JACK, with a
//!   virtual loopback backend for headless use ([`stream`], [`backend`])
//! - Sample format and buffer layout conversion between user and
//!   device geometry ([`format`])
//! - A lock-free single-producer single-consumer message queue for
//!   handing timestamped MIDI messages out of driver callbacks
//!   ([`queue`])
//! - Transport clock mapping between musical pulses and audio frames
//!   ([`transport`])
//!
//! # Architecture
//!
//! ```text
//! driver callback → DriverEndpoint → CycleEngine → user callback
//!                     (lock-free status/counters)   (user format)
//! ```
//!
//! The application owns a [`stream::Stream`]; the backend owns the
//! driver connection and calls back through an endpoint that converts
//! device buffers to the user's format on the way in and back on the
//! way out.

pub mod backend;
pub mod format;
pub mod queue;
pub mod stream;
pub mod transport;

pub use format::SampleFormat;
pub use queue::{MessageQueue, MessageReceiver, MessageSender, MidiMessage};
pub use stream::{
    BackendKind, CallbackAction, CycleBuffers, Stream, StreamConfig, StreamDirection,
    StreamError, StreamOptions, StreamParams, StreamResult, StreamStatus, StreamStatusFlags,
};
pub use transport::{ClockMapper, TransportPosition};
