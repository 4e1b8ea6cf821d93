use std::fmt;

/// Failures the channel can report to a caller.
///
/// Protocol invariant violations (a sequence regressing, an ack exceeding
/// the peer's sequence, ...) are not part of this type: `spec.md` §7 treats
/// those as programmer errors, so they are `debug_assert!`-ed in the call
/// site instead of being threaded through `Result`.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// A control record could not be posted because the peer's control
    /// queue is full. Unlike a full data queue this is treated as fatal at
    /// the protocol level: control records are small and rare, so a full
    /// control queue means the peer isn't draining at all.
    #[error("control queue is full")]
    ControlQueueFull,

    /// The channel has already had `signal_open` called on it.
    #[error("channel was already opened")]
    AlreadyOpen,

    /// An operation that requires an active channel was attempted after
    /// `close_worker`/`ack_close` made it inactive.
    #[error("channel is not active")]
    Inactive,

    /// `worker_receive_open` was called a second time.
    #[error("worker half of the control plane was already initialized")]
    AlreadyInitialized,
}

/// The outcome of a `service_wake` call: whether the observed wake
/// corresponded to a pending control record, per the external notifier
/// contract in `spec.md` §4.1 ("returns whether an observed event
/// corresponds to a pending control record").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeOutcome {
    Serviced,
    Spurious,
}

impl fmt::Display for WakeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WakeOutcome::Serviced => write!(f, "serviced"),
            WakeOutcome::Spurious => write!(f, "spurious"),
        }
    }
}
