//! Bounded SPSC queue for timestamped MIDI messages
//!
//! Decouples a real-time MIDI driver callback (producer) from the
//! application thread (consumer). The producer side never blocks,
//! never allocates, and completes in bounded time, so it is safe to
//! call from inside a driver deadline. A push on a full queue drops
//! the message and bumps a counter; nothing is ever overwritten.
//!
//! The single-producer/single-consumer discipline is enforced
//! structurally: [`MessageQueue::with_capacity`] hands out exactly one
//! non-clonable [`MessageSender`] and one non-clonable
//! [`MessageReceiver`]. There is no lock inside the queue.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Default ring capacity when the caller has no preference.
///
/// Historic implementations shipped rings between 128 and 2048 slots;
/// 1024 comfortably covers a burst of controller input between polls.
pub const DEFAULT_RING_CAPACITY: usize = 1024;

/// One MIDI message: an ordered byte payload plus a timestamp.
///
/// The timestamp is in floating-point seconds, measured as the delta
/// since the previous message on the same port (0.0 for the first).
/// Messages are immutable once queued; the slot owns the message until
/// it is popped, after which the consumer owns it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MidiMessage {
    /// Status byte followed by 0..n data bytes (or a sysex payload).
    pub bytes: Vec<u8>,
    /// Seconds since the previous message on this port.
    pub timestamp: f64,
}

impl MidiMessage {
    pub fn new(bytes: Vec<u8>, timestamp: f64) -> Self {
        Self { bytes, timestamp }
    }

    /// The sentinel returned when popping an empty queue.
    pub fn empty() -> Self {
        Self::default()
    }

    /// True for the sentinel (no payload).
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Shared ring storage.
///
/// `size` is the only cross-thread counter: the producer publishes a
/// slot with a Release increment, the consumer observes it with an
/// Acquire load. The `front`/`back` indices live in the respective
/// handles and are never shared.
struct RingShared {
    slots: Box<[UnsafeCell<MidiMessage>]>,
    size: AtomicUsize,
    dropped: AtomicUsize,
}

// Safety: a slot is written only by the producer while `size < capacity`
// guarantees the consumer has already taken it, and read only by the
// consumer while `size > 0` guarantees the producer has published it.
// The Release/Acquire pair on `size` orders the slot accesses.
unsafe impl Sync for RingShared {}

/// Handle used to build the queue pair.
pub struct MessageQueue;

impl MessageQueue {
    /// Allocate the ring and split it into producer and consumer ends.
    ///
    /// All slot storage is allocated here, before any real-time use.
    /// A capacity of 0 yields a degenerate queue on which every push
    /// is rejected; this mirrors the "allocation failed safely" state
    /// of the original design.
    pub fn with_capacity(capacity: usize) -> (MessageSender, MessageReceiver) {
        let slots: Box<[UnsafeCell<MidiMessage>]> = (0..capacity)
            .map(|_| UnsafeCell::new(MidiMessage::empty()))
            .collect();

        let shared = Arc::new(RingShared {
            slots,
            size: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        });

        (
            MessageSender {
                shared: shared.clone(),
                back: 0,
            },
            MessageReceiver { shared, front: 0 },
        )
    }
}

/// Producer end of the queue. Owned by the driver callback.
pub struct MessageSender {
    shared: Arc<RingShared>,
    /// Next slot to write. Only this handle touches it.
    back: usize,
}

impl MessageSender {
    /// Push a message, or drop it if the ring is saturated.
    ///
    /// Returns `false` (and increments the dropped counter) on a full
    /// or zero-capacity ring, leaving all state unchanged. Moving the
    /// message into the slot does not allocate; the slot's previous
    /// occupant is always the empty sentinel left behind by `pop`.
    pub fn push(&mut self, message: MidiMessage) -> bool {
        let capacity = self.shared.slots.len();
        if capacity == 0 || self.shared.size.load(Ordering::Acquire) == capacity {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        unsafe {
            *self.shared.slots[self.back].get() = message;
        }
        self.back = (self.back + 1) % capacity;
        self.shared.size.fetch_add(1, Ordering::Release);
        true
    }

    /// True when a push would currently be rejected.
    pub fn is_full(&self) -> bool {
        let capacity = self.shared.slots.len();
        capacity == 0 || self.shared.size.load(Ordering::Acquire) == capacity
    }

    /// Messages rejected so far because the ring was full.
    pub fn dropped(&self) -> usize {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer end of the queue. Owned by the application thread.
pub struct MessageReceiver {
    shared: Arc<RingShared>,
    /// Next slot to read. Only this handle touches it.
    front: usize,
}

impl MessageReceiver {
    /// Remove and return the oldest message.
    ///
    /// Popping an empty queue returns the sentinel rather than
    /// failing; check [`MidiMessage::is_empty`].
    pub fn pop_front(&mut self) -> MidiMessage {
        let capacity = self.shared.slots.len();
        if self.shared.size.load(Ordering::Acquire) == 0 {
            return MidiMessage::empty();
        }

        let message = unsafe { std::mem::take(&mut *self.shared.slots[self.front].get()) };
        self.front = (self.front + 1) % capacity;
        self.shared.size.fetch_sub(1, Ordering::Release);
        message
    }

    /// Alias for [`pop_front`](Self::pop_front).
    pub fn pop(&mut self) -> MidiMessage {
        self.pop_front()
    }

    /// Peek at the oldest message without removing it.
    pub fn front(&self) -> Option<&MidiMessage> {
        if self.shared.size.load(Ordering::Acquire) == 0 {
            return None;
        }
        Some(unsafe { &*self.shared.slots[self.front].get() })
    }

    /// Number of messages currently queued.
    pub fn len(&self) -> usize {
        self.shared.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.slots.len()
    }

    /// Messages the producer had to drop because the ring was full.
    pub fn dropped(&self) -> usize {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}
