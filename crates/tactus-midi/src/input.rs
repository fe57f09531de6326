//! MIDI input ports
//!
//! The midir driver callback filters, timestamps and queues incoming
//! messages; the application polls the queue (or a flume bridge) at
//! its own pace. Timestamps are delta seconds since the previous
//! delivered message, with the first message at 0.0.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use midir::MidiInputConnection;
use tactus_core::queue::{MessageQueue, MessageReceiver, MessageSender, MidiMessage};

use crate::connection::{find_input_port, MidiPortError};

/// Status byte classes that can be filtered in the driver callback.
///
/// Defaults ignore sysex and active sensing but keep timing clock,
/// since clock bytes are what tempo-following consumers are after.
pub struct IgnoreTypes {
    sysex: AtomicBool,
    timing_clock: AtomicBool,
    active_sensing: AtomicBool,
}

impl Default for IgnoreTypes {
    fn default() -> Self {
        Self {
            sysex: AtomicBool::new(true),
            timing_clock: AtomicBool::new(false),
            active_sensing: AtomicBool::new(true),
        }
    }
}

impl IgnoreTypes {
    pub fn set(&self, sysex: bool, timing_clock: bool, active_sensing: bool) {
        self.sysex.store(sysex, Ordering::Relaxed);
        self.timing_clock.store(timing_clock, Ordering::Relaxed);
        self.active_sensing.store(active_sensing, Ordering::Relaxed);
    }

    fn drops(&self, status: u8) -> bool {
        match status {
            0xF0 | 0xF7 => self.sysex.load(Ordering::Relaxed),
            0xF8 => self.timing_clock.load(Ordering::Relaxed),
            0xFE => self.active_sensing.load(Ordering::Relaxed),
            _ => false,
        }
    }
}

struct CallbackState {
    sender: MessageSender,
    ignore: Arc<IgnoreTypes>,
    /// Driver clock of the previous delivered message, microseconds.
    last_timestamp: Option<u64>,
    /// Last seen channel status byte, for running status.
    last_status: Option<u8>,
}

/// An open MIDI input port.
pub struct MidiInputPort {
    _connection: MidiInputConnection<CallbackState>,
    /// Consumer half of the message queue; taken by [`bridge`].
    ///
    /// [`bridge`]: MidiInputPort::bridge
    receiver: Option<MessageReceiver>,
    ignore: Arc<IgnoreTypes>,
    bridge_worker: Option<(Arc<AtomicBool>, JoinHandle<()>)>,
}

impl MidiInputPort {
    /// Find a port matching `port_match` and open it with a message
    /// queue of `ring_capacity`.
    pub fn open(port_match: &str, ring_capacity: usize) -> Result<Self, MidiPortError> {
        let (midi_in, port) = find_input_port("tactus-midi-in", port_match)?;
        let (sender, receiver) = MessageQueue::with_capacity(ring_capacity);
        let ignore = Arc::new(IgnoreTypes::default());

        let state = CallbackState {
            sender,
            ignore: Arc::clone(&ignore),
            last_timestamp: None,
            last_status: None,
        };

        let connection = midi_in
            .connect(&port, "tactus-midi-input", midi_callback, state)
            .map_err(|e| MidiPortError::Connection(e.to_string()))?;

        log::info!("midi: input port open, queue capacity {}", ring_capacity);
        Ok(Self {
            _connection: connection,
            receiver: Some(receiver),
            ignore,
            bridge_worker: None,
        })
    }

    /// Choose which status classes the driver callback discards.
    pub fn ignore_types(&self, sysex: bool, timing_clock: bool, active_sensing: bool) {
        self.ignore.set(sysex, timing_clock, active_sensing);
    }

    /// Pop the oldest queued message; the empty sentinel when none.
    pub fn pop(&mut self) -> MidiMessage {
        match self.receiver.as_mut() {
            Some(receiver) => receiver.pop(),
            None => MidiMessage::empty(),
        }
    }

    /// Alias for [`pop`](MidiInputPort::pop), mirroring queue naming.
    pub fn pop_front(&mut self) -> MidiMessage {
        self.pop()
    }

    /// Peek at the oldest queued message without removing it.
    pub fn front(&self) -> Option<&MidiMessage> {
        self.receiver.as_ref().and_then(|r| r.front())
    }

    pub fn len(&self) -> usize {
        self.receiver.as_ref().map_or(0, |r| r.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages dropped because the queue was full.
    pub fn dropped(&self) -> usize {
        self.receiver.as_ref().map_or(0, |r| r.dropped())
    }

    /// Move the consumer half onto a worker thread that drains the
    /// queue into a flume channel, for async consumers. Can only be
    /// done once; afterwards [`pop`](MidiInputPort::pop) yields the
    /// sentinel.
    pub fn bridge(&mut self) -> Option<flume::Receiver<MidiMessage>> {
        let mut receiver = self.receiver.take()?;
        let (tx, rx) = flume::unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = std::thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                let message = receiver.pop();
                if message.is_empty() {
                    std::thread::sleep(Duration::from_millis(1));
                    continue;
                }
                if tx.send(message).is_err() {
                    break;
                }
            }
        });

        self.bridge_worker = Some((stop, handle));
        Some(rx)
    }

    /// Tear down the connection, the bridge worker (if any), then the
    /// queue.
    pub fn close(self) {}
}

impl Drop for MidiInputPort {
    fn drop(&mut self) {
        if let Some((stop, handle)) = self.bridge_worker.take() {
            stop.store(true, Ordering::Relaxed);
            if handle.join().is_err() {
                log::warn!("midi: bridge worker panicked");
            }
        }
    }
}

/// Driver callback: filter, apply running status, timestamp, queue.
/// Runs on the MIDI driver thread; must not block.
fn midi_callback(timestamp: u64, data: &[u8], state: &mut CallbackState) {
    if data.is_empty() {
        return;
    }

    let bytes = if data[0] >= 0x80 {
        // Channel statuses participate in running status; system
        // common and real-time bytes do not.
        if data[0] < 0xF0 {
            state.last_status = Some(data[0]);
        }
        if state.ignore.drops(data[0]) {
            return;
        }
        data.to_vec()
    } else {
        // Data bytes only: the device elided the status byte.
        match state.last_status {
            Some(status) => {
                let mut bytes = Vec::with_capacity(data.len() + 1);
                bytes.push(status);
                bytes.extend_from_slice(data);
                bytes
            }
            None => return,
        }
    };

    let delta = match state.last_timestamp {
        Some(last) => (timestamp.saturating_sub(last)) as f64 / 1_000_000.0,
        None => 0.0,
    };
    state.last_timestamp = Some(timestamp);

    state.sender.push(MidiMessage {
        bytes,
        timestamp: delta,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_capacity(capacity: usize) -> (CallbackState, MessageReceiver) {
        let (sender, receiver) = MessageQueue::with_capacity(capacity);
        (
            CallbackState {
                sender,
                ignore: Arc::new(IgnoreTypes::default()),
                last_timestamp: None,
                last_status: None,
            },
            receiver,
        )
    }

    #[test]
    fn test_callback_timestamps_are_deltas() {
        let (mut state, mut receiver) = state_with_capacity(8);

        midi_callback(1_000_000, &[0x90, 60, 100], &mut state);
        midi_callback(1_250_000, &[0x80, 60, 0], &mut state);

        let first = receiver.pop();
        assert_eq!(first.bytes, vec![0x90, 60, 100]);
        assert_eq!(first.timestamp, 0.0);

        let second = receiver.pop();
        assert_eq!(second.bytes, vec![0x80, 60, 0]);
        assert!((second.timestamp - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_callback_running_status() {
        let (mut state, mut receiver) = state_with_capacity(8);

        midi_callback(0, &[0x90, 60, 100], &mut state);
        // Status elided: same note-on status applies.
        midi_callback(100, &[62, 90], &mut state);

        receiver.pop();
        let second = receiver.pop();
        assert_eq!(second.bytes, vec![0x90, 62, 90]);
    }

    #[test]
    fn test_callback_data_bytes_without_status_dropped() {
        let (mut state, mut receiver) = state_with_capacity(8);
        midi_callback(0, &[62, 90], &mut state);
        assert!(receiver.pop().is_empty());
    }

    #[test]
    fn test_callback_default_filters() {
        let (mut state, mut receiver) = state_with_capacity(8);

        midi_callback(0, &[0xFE], &mut state); // active sensing: ignored
        midi_callback(10, &[0xF8], &mut state); // timing clock: kept
        midi_callback(20, &[0xF0, 0x01, 0xF7], &mut state); // sysex: ignored

        let message = receiver.pop();
        assert_eq!(message.bytes, vec![0xF8]);
        assert!(receiver.pop().is_empty());
    }

    #[test]
    fn test_callback_filters_follow_ignore_flags() {
        let (mut state, mut receiver) = state_with_capacity(8);
        state.ignore.set(false, true, false);

        midi_callback(0, &[0xF8], &mut state); // now ignored
        midi_callback(10, &[0xFE], &mut state); // now kept

        assert_eq!(receiver.pop().bytes, vec![0xFE]);
    }

    #[test]
    fn test_full_queue_counts_drops() {
        let (mut state, receiver) = state_with_capacity(1);

        midi_callback(0, &[0x90, 60, 100], &mut state);
        midi_callback(10, &[0x90, 61, 100], &mut state);
        midi_callback(20, &[0x90, 62, 100], &mut state);

        assert_eq!(receiver.len(), 1);
        assert_eq!(receiver.dropped(), 2);
    }
}
