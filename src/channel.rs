//! The channel itself: lifecycle, send/receive protocol, signal elision and
//! the control-event dispatcher (`spec.md` §3-§4).
//!
//! [`ChannelCore`] holds everything needed to multiplex control records
//! across channels without knowing a channel's message types (`active`
//! flag, both endpoints' bookkeeping, the control senders, the aggregate
//! timers). [`Channel<Req, Rep>`] pairs a `ChannelCore` with the two typed
//! data queues and is the handle both threads clone and hold.

use crate::clock::now_nanos;
use crate::control::{ControlQueue, ControlSender, Signal};
use crate::endpoint::{ema, should_signal, ChannelConfig, EndpointState};
use crate::error::ChannelError;
use crate::event::Event;
use crate::message::{Envelope, ReplyEnvelope};
use crate::notify::EventFdNotifier;
use crossbeam_queue::ArrayQueue;
use log::{debug, trace};
use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Endpoint index used as the `ack` payload of a `Close` control record,
/// carrying which side initiated (`spec.md` §4.5, Design Notes §9: the
/// original reuses the `ack` field as a discriminator rather than carrying
/// a separate one; kept here for wire simplicity, since a two-endpoint
/// channel never needs more than this one bit).
const TO_WORKER: u64 = 0;
const FROM_WORKER: u64 = 1;

/// The type-erased half of a channel: everything the control plane and the
/// dispatcher need, independent of `Req`/`Rep`.
///
/// `to_worker`/`from_worker` are `UnsafeCell` because both the master and
/// the worker hold the same `Arc<ChannelCore>` — Rust has no way to know
/// that only the master ever calls `to_worker_mut()` and only the worker
/// ever calls `from_worker_mut()`. That discipline is enforced by this
/// module's API, not by the type system, the same trade the teacher crate
/// makes with its `unsafe impl<T: Send> Send for Sender<T>`.
pub(crate) struct ChannelCore {
    active: AtomicBool,
    close_sent_master: AtomicBool,
    close_sent_worker: AtomicBool,

    to_worker: UnsafeCell<EndpointState>,
    from_worker: UnsafeCell<EndpointState>,

    /// Master's sender: posts to the worker's control queue, fires the
    /// worker's notifier. Built eagerly in `create`.
    to_worker_ctrl: ControlSender,
    /// Worker's sender: posts to the master's control queue, fires the
    /// master's notifier. Populated only once the worker processes `Open`
    /// (`Channel::worker_receive_open`) — see `spec.md` §4.5.
    from_worker_ctrl: OnceLock<ControlSender>,
    master_ctrl_queue: Arc<ControlQueue>,
    master_notifier: Arc<EventFdNotifier>,

    config: ChannelConfig,

    /// Aggregate timers reported by the worker (`spec.md` §3), read by the
    /// master without synchronization beyond the atomic itself.
    cpu_time: AtomicU64,
    processing_time: AtomicU64,
}

// SAFETY: every field is either an atomic, immutable after construction
// (`to_worker_ctrl`, `master_ctrl_queue`, `master_notifier`, `config`), or
// an `UnsafeCell<EndpointState>` mutated exclusively by the one thread that
// owns that endpoint, enforced by `Channel`'s method boundaries.
unsafe impl Sync for ChannelCore {}

impl ChannelCore {
    fn to_worker(&self) -> &EndpointState {
        unsafe { &*self.to_worker.get() }
    }

    /// # Safety
    /// Caller must be the channel's master thread.
    unsafe fn to_worker_mut(&self) -> &mut EndpointState {
        &mut *self.to_worker.get()
    }

    fn from_worker(&self) -> &EndpointState {
        unsafe { &*self.from_worker.get() }
    }

    /// # Safety
    /// Caller must be the channel's worker thread.
    unsafe fn from_worker_mut(&self) -> &mut EndpointState {
        &mut *self.from_worker.get()
    }

    /// Post a fresh `DATA_TO_WORKER` signal, updating the master's own
    /// signal bookkeeping. Shared by the ordinary send path and the
    /// dispatcher's re-signal rule.
    fn signal_data_to_worker(core: &Arc<ChannelCore>, when: u64) -> Result<(), ChannelError> {
        // SAFETY: only ever reached from the master thread (send_request's
        // own call, or dispatch() processing the master's own inbox).
        let to_worker = unsafe { core.to_worker_mut() };
        to_worker.last_sent_signal = when;
        to_worker.sequence_at_last_signal = to_worker.sequence();
        to_worker.num_signals += 1;
        let ack = to_worker.ack();
        debug!("posting DATA_TO_WORKER ack={ack}");
        core.to_worker_ctrl.send(Signal::DataToWorker, ack, core.clone())
    }

    /// Post a worker-side signal (`DATA_FROM_WORKER` or the unconditional
    /// `DATA_DONE_WORKER`), updating the worker's own signal bookkeeping.
    /// Both follow the same update shape in the original source; only the
    /// discriminant differs.
    fn signal_from_worker(
        core: &Arc<ChannelCore>,
        when: u64,
        signal: Signal,
    ) -> Result<(), ChannelError> {
        // SAFETY: only ever reached from the worker thread.
        let from_worker = unsafe { core.from_worker_mut() };
        from_worker.last_sent_signal = when;
        from_worker.sequence_at_last_signal = from_worker.sequence();
        from_worker.num_signals += 1;
        let ack = from_worker.ack();
        let ctrl = core
            .from_worker_ctrl
            .get()
            .ok_or(ChannelError::Inactive)?;
        debug!("posting {signal:?} ack={ack}");
        ctrl.send(signal, ack, core.clone())
    }

    /// `record.ack == to_worker.sequence` means the worker is caught up;
    /// otherwise it missed recent traffic and must be re-signaled.
    fn maybe_resignal(core: &Arc<ChannelCore>, record_ack: u64, when: u64) {
        let seq = core.to_worker().sequence();
        debug_assert!(
            record_ack <= seq,
            "worker acked sequence {record_ack} beyond the {seq} we've sent"
        );
        if record_ack == seq {
            return;
        }
        // SAFETY: dispatch() only reaches this branch when processing the
        // master's own inbox, i.e. running on the master thread.
        unsafe { core.to_worker_mut() }.num_resignals += 1;
        trace!("re-signaling worker, it acked {record_ack} but we're at {seq}");
        let _ = ChannelCore::signal_data_to_worker(core, when);
    }

    /// The control-event dispatcher (`spec.md` §4.4). Called once per
    /// popped record by [`ControlQueue::service`].
    pub(crate) fn dispatch(core: &Arc<ChannelCore>, signal: Signal, ack: u64, when: u64) -> Event {
        match signal {
            Signal::Error => Event::Error,
            Signal::Open => Event::Open,
            Signal::Close => Event::Close,
            Signal::DataToWorker => Event::DataReadyWorker,
            Signal::DataFromWorker => Event::DataReadyReceiver,
            Signal::DataDoneWorker => {
                ChannelCore::maybe_resignal(core, ack, when);
                Event::DataReadyReceiver
            }
            Signal::WorkerSleeping => {
                ChannelCore::maybe_resignal(core, ack, when);
                Event::Noop
            }
        }
    }
}

/// A point-in-time, read-only copy of one endpoint's bookkeeping, for tests
/// and monitoring. See [`Channel::master_stats`]/[`Channel::worker_stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointStats {
    pub sequence: u64,
    pub ack: u64,
    pub num_outstanding: i64,
    pub num_signals: u64,
    pub num_resignals: u64,
    pub num_kevents: u64,
    pub message_interval: u64,
}

impl From<&EndpointState> for EndpointStats {
    fn from(ep: &EndpointState) -> Self {
        EndpointStats {
            sequence: ep.sequence(),
            ack: ep.ack(),
            num_outstanding: ep.num_outstanding,
            num_signals: ep.num_signals,
            num_resignals: ep.num_resignals,
            num_kevents: ep.num_kevents(),
            message_interval: ep.message_interval,
        }
    }
}

/// Outcome of `send_request`/`send_reply`, `spec.md` §4.3.1/§4.3.5.
///
/// `Own` is the type of message the caller was trying to send (`Req` for
/// `send_request`, `Rep` for `send_reply`); `Peer` is the reverse direction's
/// message type, the one that can show up `piggybacked`.
pub enum SendOutcome<Own, Peer> {
    /// The message was pushed. `piggybacked` is a reply/request opportunistically
    /// drained from the reverse direction while we were here.
    Sent { piggybacked: Option<Box<Peer>> },
    /// The data queue was full; the message was *not* sent. `rejected` hands
    /// back the exact message the caller passed in — `ArrayQueue::push`
    /// returns it in its `Err`, and the caller must get it back to retry,
    /// since (unlike the original's non-owning pointer) it was moved in by
    /// value. `piggybacked` is populated on the same terms as the `Sent`
    /// case.
    QueueFull { rejected: Box<Own>, piggybacked: Option<Box<Peer>> },
}

/// A bidirectional request/reply channel between one master thread and one
/// worker thread (`spec.md` §2-§3).
///
/// Cloning a `Channel` clones the handle, not the channel: both ends of a
/// live channel share one `Channel` value each, cloned from the one
/// `Channel::create` returns, exactly as the original's single
/// `fr_channel_t*` is handed to both threads.
pub struct Channel<Req, Rep> {
    core: Arc<ChannelCore>,
    to_worker_data: Arc<ArrayQueue<Box<Req>>>,
    from_worker_data: Arc<ArrayQueue<Box<Rep>>>,
}

impl<Req, Rep> Clone for Channel<Req, Rep> {
    fn clone(&self) -> Self {
        Channel {
            core: self.core.clone(),
            to_worker_data: self.to_worker_data.clone(),
            from_worker_data: self.from_worker_data.clone(),
        }
    }
}

impl<Req, Rep> Channel<Req, Rep> {
    /// Construct a channel. Does not itself post `OPEN` — call
    /// [`Channel::signal_open`] once the worker thread is ready to receive
    /// it, matching the original's separate `fr_channel_signal_open`.
    pub fn create(
        config: ChannelConfig,
        master_ctrl_queue: Arc<ControlQueue>,
        master_notifier: Arc<EventFdNotifier>,
        worker_ctrl_queue: Arc<ControlQueue>,
        worker_notifier: Arc<EventFdNotifier>,
    ) -> Channel<Req, Rep> {
        let when = now_nanos();
        let core = Arc::new(ChannelCore {
            active: AtomicBool::new(true),
            close_sent_master: AtomicBool::new(false),
            close_sent_worker: AtomicBool::new(false),
            to_worker: UnsafeCell::new(EndpointState::new(when)),
            from_worker: UnsafeCell::new(EndpointState::new(when)),
            to_worker_ctrl: ControlSender::new(worker_ctrl_queue, worker_notifier),
            from_worker_ctrl: OnceLock::new(),
            master_ctrl_queue,
            master_notifier,
            config,
            cpu_time: AtomicU64::new(0),
            processing_time: AtomicU64::new(0),
        });
        Channel {
            core,
            to_worker_data: Arc::new(ArrayQueue::new(config.queue_capacity)),
            from_worker_data: Arc::new(ArrayQueue::new(config.queue_capacity)),
        }
    }

    /// Post `SIGNAL_OPEN` to the worker. Calling this twice is an error.
    pub fn signal_open(&self) -> Result<(), ChannelError> {
        if self.core.from_worker_ctrl.get().is_some() {
            return Err(ChannelError::AlreadyOpen);
        }
        self.core.to_worker_ctrl.send(Signal::Open, 0, self.core.clone())
    }

    /// Called by the worker once it has dispatched the `Open` event:
    /// allocates the worker's half of the control plane so it can address
    /// the master back. Matches `fr_channel_worker_receive_open`'s
    /// deferred allocation.
    pub fn worker_receive_open(&self) -> Result<(), ChannelError> {
        let sender = ControlSender::new(
            self.core.master_ctrl_queue.clone(),
            self.core.master_notifier.clone(),
        );
        self.core
            .from_worker_ctrl
            .set(sender)
            .map_err(|_| ChannelError::AlreadyInitialized)
    }

    /// Master-initiated close. Idempotent: a second call is a no-op.
    pub fn close_worker(&self) -> Result<(), ChannelError> {
        self.core.active.store(false, Ordering::Relaxed);
        if self.core.close_sent_master.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        self.core
            .to_worker_ctrl
            .send(Signal::Close, TO_WORKER, self.core.clone())
    }

    /// Worker's acknowledgement of a close (whether self- or
    /// master-initiated). Idempotent: a second call is a no-op.
    pub fn ack_close(&self) -> Result<(), ChannelError> {
        self.core.active.store(false, Ordering::Relaxed);
        if self.core.close_sent_worker.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        let ctrl = self
            .core
            .from_worker_ctrl
            .get()
            .ok_or(ChannelError::Inactive)?;
        ctrl.send(Signal::Close, FROM_WORKER, self.core.clone())
    }

    pub fn is_active(&self) -> bool {
        self.core.active.load(Ordering::Relaxed)
    }

    /// Attach opaque per-worker state. Worker-side only.
    pub fn set_worker_ctx<T: Any + Send>(&self, ctx: T) {
        // SAFETY: only the worker thread is expected to call this.
        unsafe { self.core.from_worker_mut() }.ctx = Some(Box::new(ctx));
    }

    pub fn worker_ctx<T: Any + Send>(&self) -> Option<&T> {
        self.core.from_worker().ctx.as_deref().and_then(|ctx| ctx.downcast_ref::<T>())
    }

    /// Respond to an observed wake on `ctrl_queue`/`notifier`: drains one
    /// pending fire and dispatches at most one control record. Idempotent:
    /// calling with nothing pending reports `Spurious`, never errors.
    ///
    /// `ctrl_queue` is the *caller's own* control queue (the one it just
    /// woke up from polling `notifier`). Whichever endpoint's traffic the
    /// serviced record turns out to belong to has its `num_kevents`
    /// counter bumped — per `EndpointState::num_kevents`'s doc comment,
    /// this is not necessarily the endpoint owned by the calling thread.
    pub fn service_wake(
        &self,
        ctrl_queue: &ControlQueue,
        notifier: &EventFdNotifier,
    ) -> Result<crate::error::WakeOutcome, ChannelError> {
        use crate::error::WakeOutcome;
        let fires = notifier.drain().map_err(|_| ChannelError::ControlQueueFull)?;
        if fires == 0 {
            return Ok(WakeOutcome::Spurious);
        }
        let is_master_queue = std::ptr::eq(ctrl_queue, self.core.master_ctrl_queue.as_ref());
        match ctrl_queue.service(now_nanos()) {
            Some(_) => {
                if is_master_queue {
                    self.core.from_worker().bump_kevents();
                } else {
                    self.core.to_worker().bump_kevents();
                }
                Ok(WakeOutcome::Serviced)
            }
            None => Ok(WakeOutcome::Spurious),
        }
    }

    /// Idle-path announcement (`spec.md` §4.3.6). No-op if the worker has
    /// nothing outstanding — the master already knows. Unlike the other
    /// worker-side signals, this does not update `last_sent_signal` /
    /// `sequence_at_last_signal`, only the `num_signals` counter.
    pub fn worker_sleeping(&self) -> Result<(), ChannelError> {
        // SAFETY: only the worker thread calls worker_sleeping.
        let from_worker = unsafe { self.core.from_worker_mut() };
        if from_worker.num_outstanding == 0 {
            return Ok(());
        }
        from_worker.num_signals += 1;
        let ack = from_worker.ack();
        let ctrl = self
            .core
            .from_worker_ctrl
            .get()
            .ok_or(ChannelError::Inactive)?;
        ctrl.send(Signal::WorkerSleeping, ack, self.core.clone())
    }

    pub fn debug_dump(&self, sink: &mut dyn fmt::Write) -> fmt::Result {
        let tw = self.core.to_worker();
        let fw = self.core.from_worker();
        writeln!(sink, "to worker")?;
        writeln!(sink, "\tnum_signals sent = {}", tw.num_signals)?;
        writeln!(sink, "\tnum_signals re-sent = {}", tw.num_resignals)?;
        writeln!(sink, "\tnum_kevents checked = {}", tw.num_kevents())?;
        writeln!(sink, "\tsequence = {}", tw.sequence())?;
        writeln!(sink, "\tack = {}", tw.ack())?;
        writeln!(sink, "from worker")?;
        writeln!(sink, "\tnum_signals sent = {}", fw.num_signals)?;
        writeln!(sink, "\tnum_kevents checked = {}", fw.num_kevents())?;
        writeln!(sink, "\tsequence = {}", fw.sequence())?;
        writeln!(sink, "\tack = {}", fw.ack())?;
        Ok(())
    }

    /// Snapshot of the master-side (`to_worker`) endpoint's bookkeeping.
    /// Diagnostic, like [`Channel::debug_dump`]: safe to call from either
    /// thread, but only coherent when called from the master thread, since
    /// the non-atomic counters are written without synchronization by that
    /// thread alone.
    pub fn master_stats(&self) -> EndpointStats {
        EndpointStats::from(self.core.to_worker())
    }

    /// Snapshot of the worker-side (`from_worker`) endpoint's bookkeeping.
    /// Same caveat as [`Channel::master_stats`], mirrored for the worker
    /// thread.
    pub fn worker_stats(&self) -> EndpointStats {
        EndpointStats::from(self.core.from_worker())
    }

    /// The aggregate `processing_time` EMA the master has observed across
    /// all replies (`spec.md` §3's `Channel.processing_time`).
    pub fn processing_time(&self) -> u64 {
        self.core.processing_time.load(Ordering::Relaxed)
    }

    /// The most recent `cpu_time` reading reported by the worker.
    pub fn cpu_time(&self) -> u64 {
        self.core.cpu_time.load(Ordering::Relaxed)
    }
}

impl<Req, Rep> Channel<Req, Rep>
where
    Req: Envelope,
    Rep: ReplyEnvelope,
{
    /// `spec.md` §4.3.1. Master-side only.
    ///
    /// Returns `Err(ChannelError::Inactive)` without touching any state if
    /// the channel has already been closed (`spec.md` §7: "operation on
    /// inactive channel: returns error code; no state change").
    pub fn send_request(&self, mut msg: Box<Req>) -> Result<SendOutcome<Req, Rep>, ChannelError> {
        if !self.is_active() {
            return Err(ChannelError::Inactive);
        }
        let when = msg.when();
        let seq = self.core.to_worker().sequence() + 1;
        msg.set_sequence(seq);
        msg.set_ack(self.core.to_worker().ack());

        if let Err(rejected) = self.to_worker_data.push(msg) {
            return Ok(SendOutcome::QueueFull {
                rejected,
                piggybacked: self.receive_reply(),
            });
        }

        self.core.to_worker().set_sequence(seq);
        // SAFETY: only the master thread calls send_request.
        let to_worker = unsafe { self.core.to_worker_mut() };
        let interval = when.saturating_sub(to_worker.last_write);
        to_worker.message_interval = ema(to_worker.message_interval, interval, self.core.config.ema_inverse_alpha);
        to_worker.last_write = when;
        let was_idle = to_worker.num_outstanding == 0;
        to_worker.num_outstanding += 1;

        if was_idle {
            let _ = ChannelCore::signal_data_to_worker(&self.core, when);
            return Ok(SendOutcome::Sent { piggybacked: None });
        }

        let piggybacked = self.receive_reply();
        if piggybacked.is_some() && self.core.to_worker().num_outstanding > 1 {
            return Ok(SendOutcome::Sent { piggybacked });
        }

        let to_worker = self.core.to_worker();
        let peer_ack = self.core.from_worker().ack();
        if should_signal(
            to_worker.sequence(),
            peer_ack,
            to_worker.sequence_at_last_signal,
            to_worker.last_read_other,
            to_worker.last_sent_signal,
            when,
            &self.core.config,
        ) {
            let _ = ChannelCore::signal_data_to_worker(&self.core, when);
        }
        Ok(SendOutcome::Sent { piggybacked })
    }

    /// `spec.md` §4.3.2. Master-side only.
    pub fn receive_reply(&self) -> Option<Box<Rep>> {
        let msg = self.from_worker_data.pop()?;
        // SAFETY: only the master thread calls receive_reply.
        let to_worker = unsafe { self.core.to_worker_mut() };
        debug_assert!(msg.sequence() > to_worker.ack(), "reply sequence regressed");
        debug_assert!(
            msg.sequence() <= to_worker.sequence(),
            "reply claims a sequence we never requested"
        );

        let sample = msg.processing_time();
        let agg = self.core.processing_time.load(Ordering::Relaxed);
        self.core.processing_time.store(
            ema(agg, sample, self.core.config.ema_inverse_alpha),
            Ordering::Relaxed,
        );
        self.core.cpu_time.store(msg.cpu_time(), Ordering::Relaxed);

        to_worker.num_outstanding -= 1;
        to_worker.set_ack(msg.sequence());
        to_worker.last_read_other = msg.when();
        Some(msg)
    }

    /// `spec.md` §4.3.4. Worker-side only.
    pub fn receive_request(&self) -> Option<Box<Req>> {
        let msg = self.to_worker_data.pop()?;
        // SAFETY: only the worker thread calls receive_request.
        let from_worker = unsafe { self.core.from_worker_mut() };
        debug_assert!(msg.sequence() > from_worker.ack(), "request sequence regressed");
        debug_assert!(
            msg.sequence() >= from_worker.sequence(),
            "request fell behind our own reply sequence"
        );

        from_worker.num_outstanding += 1;
        from_worker.set_ack(msg.sequence());
        from_worker.last_read_other = msg.when();
        Some(msg)
    }

    /// `spec.md` §4.3.5. Worker-side only.
    ///
    /// Returns `Err(ChannelError::Inactive)` without touching any state if
    /// the channel has already been closed, mirroring `send_request`.
    pub fn send_reply(&self, mut msg: Box<Rep>) -> Result<SendOutcome<Rep, Req>, ChannelError> {
        if !self.is_active() {
            return Err(ChannelError::Inactive);
        }
        let when = msg.when();
        let seq = self.core.from_worker().sequence() + 1;
        msg.set_sequence(seq);
        msg.set_ack(self.core.from_worker().ack());

        if let Err(rejected) = self.from_worker_data.push(msg) {
            return Ok(SendOutcome::QueueFull {
                rejected,
                piggybacked: self.receive_request(),
            });
        }

        self.core.from_worker().set_sequence(seq);
        // SAFETY: only the worker thread calls send_reply.
        let from_worker = unsafe { self.core.from_worker_mut() };
        let interval = when.saturating_sub(from_worker.last_write);
        from_worker.message_interval = ema(from_worker.message_interval, interval, self.core.config.ema_inverse_alpha);
        from_worker.last_write = when;
        from_worker.num_outstanding -= 1;
        let now_idle = from_worker.num_outstanding == 0;

        // Checked unconditionally, even when we're about to report
        // ourselves idle: the master may have sent something in the
        // meantime.
        let piggybacked = self.receive_request();

        if now_idle {
            let _ = ChannelCore::signal_from_worker(&self.core, when, Signal::DataDoneWorker);
            return Ok(SendOutcome::Sent { piggybacked });
        }

        let from_worker = self.core.from_worker();
        let peer_ack = self.core.to_worker().ack();
        if should_signal(
            from_worker.sequence(),
            peer_ack,
            from_worker.sequence_at_last_signal,
            from_worker.last_read_other,
            from_worker.last_sent_signal,
            when,
            &self.core.config,
        ) {
            let _ = ChannelCore::signal_from_worker(&self.core, when, Signal::DataFromWorker);
        }
        Ok(SendOutcome::Sent { piggybacked })
    }
}
