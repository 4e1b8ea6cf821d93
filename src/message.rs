//! The opaque message contract (`spec.md` §3, Design Notes §9).
//!
//! The channel never owns a concrete message type. It only needs to stamp
//! and read three fields (`sequence`, `ack`, `when`), plus two more on the
//! reply side (`processing_time`, `cpu_time`). `Envelope`/`ReplyEnvelope`
//! are the capability traits the Design Notes call for; `Message<T>` is a
//! ready-made implementation for callers who don't want to define their
//! own envelope type.

/// Fields the channel reads and writes on every message, request or reply.
pub trait Envelope {
    fn sequence(&self) -> u64;
    fn set_sequence(&mut self, sequence: u64);

    fn ack(&self) -> u64;
    fn set_ack(&mut self, ack: u64);

    /// Monotonic nanosecond timestamp, set by the sender before the
    /// message is handed to the channel. Must be `>=` the sender
    /// endpoint's previous `last_write`.
    fn when(&self) -> u64;
}

/// Additional fields the worker stamps onto a reply before sending it.
pub trait ReplyEnvelope: Envelope {
    fn processing_time(&self) -> u64;
    fn set_processing_time(&mut self, processing_time: u64);

    fn cpu_time(&self) -> u64;
    fn set_cpu_time(&mut self, cpu_time: u64);
}

/// A ready-made envelope carrying an arbitrary payload.
///
/// Used as both the request and reply message type in tests and benches;
/// the reply-only fields are simply left at zero on a request.
pub struct Message<T> {
    sequence: u64,
    ack: u64,
    when: u64,
    processing_time: u64,
    cpu_time: u64,
    pub payload: T,
}

impl<T> Message<T> {
    /// Construct a message stamped with the current time. `sequence`/`ack`
    /// are filled in by the channel on send, so they start at zero.
    pub fn new(payload: T, when: u64) -> Self {
        Message {
            sequence: 0,
            ack: 0,
            when,
            processing_time: 0,
            cpu_time: 0,
            payload,
        }
    }
}

impl<T> Envelope for Message<T> {
    fn sequence(&self) -> u64 {
        self.sequence
    }
    fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }
    fn ack(&self) -> u64 {
        self.ack
    }
    fn set_ack(&mut self, ack: u64) {
        self.ack = ack;
    }
    fn when(&self) -> u64 {
        self.when
    }
}

impl<T> ReplyEnvelope for Message<T> {
    fn processing_time(&self) -> u64 {
        self.processing_time
    }
    fn set_processing_time(&mut self, processing_time: u64) {
        self.processing_time = processing_time;
    }
    fn cpu_time(&self) -> u64 {
        self.cpu_time
    }
    fn set_cpu_time(&mut self, cpu_time: u64) {
        self.cpu_time = cpu_time;
    }
}
