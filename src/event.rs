//! Channel events observable at the public boundary (`spec.md` §6).
//!
//! The numeric identity of the first five variants must match the
//! corresponding `Signal` variants in `control.rs` — the dispatcher relies
//! on this to pass most signals through unchanged.

/// An event produced by servicing a control queue or a wake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Event {
    Error = 0,
    /// Data is ready for the worker to `receive_request`.
    DataReadyWorker = 1,
    /// Data is ready for the master to `receive_reply`.
    DataReadyReceiver = 2,
    Open = 3,
    Close = 4,
    /// No action required; the dispatcher already handled everything.
    Noop = 5,
    /// Nothing was pending on the control queue.
    Empty = 6,
}
