/*! A bidirectional, thread-safe request/reply channel connecting a producer
thread (the "master") to a consumer thread (the "worker").

The channel is built for sustained per-channel throughput on the order of
10^6 messages/second: a lock-free bounded queue carries bulk data in each
direction, while a separate control plane and a coalescing event notifier are
used only when the peer genuinely needs waking. Each side tracks a
sequence/ack pair so it can tell whether the other has fallen behind, and a
signal-elision policy decides whether a given send is worth waking the peer
for at all.

```
use duplex_chan::{Channel, ChannelConfig, ControlQueue, EventFdNotifier, Message};
use std::sync::Arc;

let master_ctrl = Arc::new(ControlQueue::new(1024));
let master_notifier = Arc::new(EventFdNotifier::new().unwrap());
let worker_ctrl = Arc::new(ControlQueue::new(1024));
let worker_notifier = Arc::new(EventFdNotifier::new().unwrap());

let channel: Channel<Message<String>, Message<String>> = Channel::create(
    ChannelConfig::default(),
    master_ctrl.clone(),
    master_notifier,
    worker_ctrl.clone(),
    worker_notifier,
);

channel.signal_open().unwrap();
// The worker side observes SIGNAL_OPEN on worker_ctrl/worker_notifier and
// calls `channel.worker_receive_open()` before doing anything else.
channel.worker_receive_open().unwrap();

channel.send_request(Box::new(Message::new("hello".to_string(), 0))).unwrap();
let request = channel.receive_request().unwrap();
assert_eq!(request.payload, "hello");
```
*/

mod channel;
mod clock;
mod control;
mod endpoint;
mod error;
mod event;
mod message;
mod notify;

pub use channel::{Channel, EndpointStats, SendOutcome};
pub use clock::now_nanos;
pub use control::ControlQueue;
pub use endpoint::ChannelConfig;
pub use error::{ChannelError, WakeOutcome};
pub use event::Event;
pub use message::{Envelope, Message, ReplyEnvelope};
pub use notify::EventFdNotifier;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn channel_pair() -> (
        Channel<Message<u64>, Message<u64>>,
        Arc<ControlQueue>,
        Arc<EventFdNotifier>,
    ) {
        let master_ctrl = Arc::new(ControlQueue::new(64));
        let master_notifier = Arc::new(EventFdNotifier::new().unwrap());
        let worker_ctrl = Arc::new(ControlQueue::new(64));
        let worker_notifier = Arc::new(EventFdNotifier::new().unwrap());
        let ch = Channel::create(
            ChannelConfig::default(),
            master_ctrl.clone(),
            master_notifier.clone(),
            worker_ctrl.clone(),
            worker_notifier.clone(),
        );
        (ch, worker_ctrl, worker_notifier)
    }

    #[test]
    fn open_then_worker_receives() {
        let (ch, worker_ctrl, worker_notifier) = channel_pair();
        ch.signal_open().unwrap();
        let (event, _) = worker_ctrl.service(now_nanos()).unwrap();
        assert_eq!(event, Event::Open);
        ch.worker_receive_open().unwrap();
        assert!(ch.is_active());
        let _ = worker_notifier;
    }

    #[test]
    fn double_open_is_an_error() {
        let (ch, worker_ctrl, _n) = channel_pair();
        ch.signal_open().unwrap();
        worker_ctrl.service(now_nanos());
        ch.worker_receive_open().unwrap();
        assert!(matches!(ch.signal_open(), Err(ChannelError::AlreadyOpen)));
    }

    /// Property 8 (`spec.md` §8): the EMA formula itself, independent of any
    /// channel machinery. `S1`'s single-sample expectation is the `k == 1`
    /// case of this.
    #[test]
    fn ema_formula() {
        use crate::endpoint::ema;
        // (0 + 7*100) / 8 = 87, integer division.
        assert_eq!(ema(0, 100, 8), 87);
        // A repeated constant sample converges monotonically toward it.
        // Integer truncation means it settles at a fixed point slightly
        // below the target rather than reaching it exactly.
        let mut smoothed = 0u64;
        let mut last_gap = u64::MAX;
        for _ in 0..64 {
            smoothed = ema(smoothed, 1000, 8);
            let gap = 1000 - smoothed;
            assert!(gap <= last_gap);
            last_gap = gap;
        }
        assert!(last_gap <= 10, "should settle within 1% of the target, gap was {last_gap}");
        assert_eq!(ema(smoothed, 1000, 8), smoothed, "should have reached its fixed point");
        // A sample equal to the running average is a fixed point.
        assert_eq!(ema(500, 500, 8), 500);
    }
}
