//! The control plane (`spec.md` §4.1): a reliable, framed, ordered transport
//! for fixed-size control records, built on a bounded lock-free queue plus
//! an event notifier.

use crate::channel::ChannelCore;
use crate::error::ChannelError;
use crate::event::Event;
use crate::notify::EventFdNotifier;
use crossbeam_queue::ArrayQueue;
use std::sync::Arc;

/// Internal signal identifiers posted through the control plane.
///
/// The first five discriminants are shared with [`crate::event::Event`] by
/// value (not by derivation, to keep the two enums independent types) — see
/// `spec.md` §6: "numeric identity of the first five must match."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Signal {
    Error = 0,
    DataToWorker = 1,
    DataFromWorker = 2,
    Open = 3,
    Close = 4,
    /// Worker-only: posted when the worker's outstanding count hits zero.
    DataDoneWorker = 5,
    /// Worker-only: posted from the worker's idle loop.
    WorkerSleeping = 6,
}

/// The fixed-layout `{signal, ack, channel_ref}` control record of
/// `spec.md` §3.
pub(crate) struct ControlRecord {
    pub signal: Signal,
    pub ack: u64,
    pub channel: Arc<ChannelCore>,
}

/// A bounded queue of control records, owned by whichever thread drains it.
///
/// One `ControlQueue` is typically shared by every channel feeding a given
/// worker thread (or every channel feeding the master's event loop), which
/// is why `ControlRecord` carries its own channel reference rather than the
/// queue being generic over a single channel's message types.
pub struct ControlQueue {
    records: ArrayQueue<ControlRecord>,
}

impl ControlQueue {
    pub fn new(capacity: usize) -> Self {
        ControlQueue {
            records: ArrayQueue::new(capacity),
        }
    }

    pub(crate) fn push(&self, record: ControlRecord) -> Result<(), ChannelError> {
        self.records
            .push(record)
            .map_err(|_| ChannelError::ControlQueueFull)
    }

    pub(crate) fn pop(&self) -> Option<ControlRecord> {
        self.records.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// `spec.md` §6's `service_control_queue(ctrl_queue, when) -> (event,
    /// ch)`: pop one record and run it through the dispatcher, returning
    /// the channel it belongs to so the caller can act on the event
    /// without needing to have tracked the channel itself.
    pub fn service(&self, when: u64) -> Option<(Event, Arc<ChannelCore>)> {
        let record = self.pop()?;
        let event = ChannelCore::dispatch(&record.channel, record.signal, record.ack, when);
        Some((event, record.channel))
    }
}

/// An endpoint's handle for posting to the peer's control queue and waking
/// the peer, combined — `spec.md` §3's `Endpoint.control` + `peer_notifier`
/// pair, folded into a single type since they are always used together.
pub(crate) struct ControlSender {
    queue: Arc<ControlQueue>,
    notifier: Arc<EventFdNotifier>,
}

impl ControlSender {
    pub fn new(queue: Arc<ControlQueue>, notifier: Arc<EventFdNotifier>) -> Self {
        ControlSender { queue, notifier }
    }

    pub fn peer_notifier(&self) -> &Arc<EventFdNotifier> {
        &self.notifier
    }

    pub fn peer_queue(&self) -> &Arc<ControlQueue> {
        &self.queue
    }

    /// Post `signal` and fire the peer's notifier. The queue push and the
    /// notifier fire are not atomic together, but that's fine: a fire
    /// observed before its record is visible just causes one extra,
    /// harmless drain attempt by the peer.
    pub fn send(
        &self,
        signal: Signal,
        ack: u64,
        channel: Arc<ChannelCore>,
    ) -> Result<(), ChannelError> {
        self.queue.push(ControlRecord {
            signal,
            ack,
            channel,
        })?;
        self.notifier
            .fire()
            .map_err(|_| ChannelError::ControlQueueFull)?;
        Ok(())
    }
}
