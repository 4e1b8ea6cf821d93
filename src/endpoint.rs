//! Per-side endpoint bookkeeping (`spec.md` §3, §4.2).

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};

/// Exponential moving average, fast-reacting: the new sample gets weight
/// `(alpha^-1 - 1)/alpha^-1`, the running average keeps only `1/alpha^-1`.
///
/// ```text
/// smoothed_new = (smoothed_old + (alpha^-1 - 1) * sample) / alpha^-1
/// ```
pub fn ema(old: u64, sample: u64, inverse_alpha: u64) -> u64 {
    (old + (inverse_alpha - 1) * sample) / inverse_alpha
}

/// Tunable constants, `spec.md` §6 and Design Notes §9 ("should be
/// configurable or predictive").
#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    /// Capacity of each direction's data queue.
    pub queue_capacity: usize,
    /// Capacity of each side's control queue.
    pub control_capacity: usize,
    /// Minimum inter-signal gap within which signaling is normally elided.
    pub signal_interval_nanos: u64,
    /// Threshold beyond which the peer is deemed to be falling behind.
    pub behind_window: u64,
    /// Inverse alpha for the EMA smoothing of `message_interval` /
    /// `processing_time`.
    pub ema_inverse_alpha: u64,
    /// Whether the platform's notifier is known to coalesce reliably,
    /// enabling the `sequence_at_last_signal > peer.ack` fast-path elision
    /// of `spec.md` §4.3.3. Disable on platforms where that assumption
    /// doesn't hold (the Design Notes call this out as needing to be "a
    /// compile- or run-time capability flag, not a source-level
    /// conditional").
    pub coalesced_notifier: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            queue_capacity: 1024,
            control_capacity: 1024,
            signal_interval_nanos: 1_000_000,
            behind_window: 1000,
            ema_inverse_alpha: 8,
            coalesced_notifier: true,
        }
    }
}

/// One side's private bookkeeping (`spec.md` §3's `Endpoint`).
///
/// `sequence` and `ack` are `AtomicU64` because the signal-elision policy
/// on one side reads the *other* side's `ack` (see `spec.md` §4.3.3: "the
/// peer is known to be behind ... sequence - peer_ack > window"). Every
/// other field here is written and read only by the thread that owns this
/// endpoint; the owning `Channel` method is responsible for only ever
/// handing out `&mut EndpointState` to that one thread.
pub(crate) struct EndpointState {
    pub sequence: AtomicU64,
    pub ack: AtomicU64,

    pub num_outstanding: i64,
    pub num_signals: u64,
    pub num_resignals: u64,
    /// Also `AtomicU64`: `service_wake` accounts a kevent against whichever
    /// endpoint's control queue the wake was observed on, which is not
    /// necessarily the endpoint whose thread is calling (the worker drains
    /// its *own* inbox, stored under the `to_worker` endpoint's
    /// `aq_control` slot in the original design this crate follows).
    pub num_kevents: AtomicU64,

    pub last_write: u64,
    pub last_read_other: u64,
    pub last_sent_signal: u64,
    pub sequence_at_last_signal: u64,
    pub message_interval: u64,

    /// Opaque per-endpoint slot; only ever populated on the worker side via
    /// `Channel::set_worker_ctx`/`worker_ctx`.
    pub ctx: Option<Box<dyn Any + Send>>,
}

impl EndpointState {
    pub fn new(when: u64) -> Self {
        EndpointState {
            sequence: AtomicU64::new(0),
            ack: AtomicU64::new(0),
            num_outstanding: 0,
            num_signals: 0,
            num_resignals: 0,
            num_kevents: AtomicU64::new(0),
            last_write: when,
            last_read_other: when,
            last_sent_signal: when,
            sequence_at_last_signal: 0,
            message_interval: 0,
            ctx: None,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }

    pub fn set_sequence(&self, value: u64) {
        self.sequence.store(value, Ordering::Relaxed);
    }

    pub fn ack(&self) -> u64 {
        self.ack.load(Ordering::Relaxed)
    }

    pub fn set_ack(&self, value: u64) {
        self.ack.store(value, Ordering::Relaxed);
    }

    pub fn bump_kevents(&self) -> u64 {
        self.num_kevents.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn num_kevents(&self) -> u64 {
        self.num_kevents.load(Ordering::Relaxed)
    }
}

/// Signal-elision decision (`spec.md` §4.3.3), shared by both send
/// directions. `own_sequence`/`sequence_at_last_signal`/`last_sent_signal`
/// belong to the sending endpoint; `peer_ack` is the peer's own ack,
/// observed cross-thread.
pub(crate) fn should_signal(
    own_sequence: u64,
    peer_ack: u64,
    sequence_at_last_signal: u64,
    last_read_other: u64,
    last_sent_signal: u64,
    when: u64,
    config: &ChannelConfig,
) -> bool {
    if config.coalesced_notifier && sequence_at_last_signal > peer_ack {
        return false;
    }
    if own_sequence.saturating_sub(peer_ack) > config.behind_window {
        return true;
    }
    let no_recent_inbound = when.saturating_sub(last_read_other) >= config.signal_interval_nanos;
    let no_recent_signal = when.saturating_sub(last_sent_signal) >= config.signal_interval_nanos;
    no_recent_inbound && no_recent_signal
}
