//! Throughput microbenchmark: one master thread firing requests at one
//! worker thread across a `Channel`, round-tripping a reply for each.
//!
//! Run with `cargo bench --bench bench_channel` (it's `harness = false`, so
//! it's really just a `main()` that prints numbers).

use duplex_chan::{Channel, ChannelConfig, ControlQueue, EventFdNotifier, Message, SendOutcome};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const ITERS: usize = 200_000;

fn main() {
    let master_ctrl = Arc::new(ControlQueue::new(1024));
    let master_notifier = Arc::new(EventFdNotifier::new().unwrap());
    let worker_ctrl = Arc::new(ControlQueue::new(1024));
    let worker_notifier = Arc::new(EventFdNotifier::new().unwrap());

    let channel: Channel<Message<Instant>, Message<Instant>> = Channel::create(
        ChannelConfig::default(),
        master_ctrl.clone(),
        master_notifier.clone(),
        worker_ctrl.clone(),
        worker_notifier.clone(),
    );

    channel.signal_open().unwrap();
    worker_ctrl.service(duplex_chan::now_nanos());
    channel.worker_receive_open().unwrap();

    let done = Arc::new(AtomicBool::new(false));

    let worker_channel = channel.clone();
    let worker_done = done.clone();
    let worker = thread::spawn(move || {
        let mut rng = rand::thread_rng();
        let mut replied = 0usize;
        let mut pending: VecDeque<Box<Message<Instant>>> = VecDeque::new();
        loop {
            pending.extend(std::iter::from_fn(|| worker_channel.receive_request()));
            while let Some(req) = pending.pop_front() {
                // A little jitter in simulated processing time gives the
                // processing_time EMA something to actually smooth.
                let simulated_work_nanos: u64 = rng.gen_range(200..2_000);
                let original_when = req.when();
                let when = duplex_chan::now_nanos();
                let mut reply = Message::new(req.payload, when);
                reply.set_processing_time(simulated_work_nanos);
                reply.set_cpu_time(simulated_work_nanos);
                match worker_channel.send_reply(Box::new(reply)) {
                    Ok(SendOutcome::Sent { .. }) => replied += 1,
                    Ok(SendOutcome::QueueFull { rejected, .. }) => {
                        // Master isn't draining fast enough; park the exact
                        // rejected reply's payload back at the front and
                        // retry once it has had a chance to catch up.
                        pending.push_front(Box::new(Message::new(rejected.payload, original_when)));
                        break;
                    }
                    Err(_) => break,
                }
            }
            if worker_done.load(Ordering::Relaxed) && pending.is_empty() {
                break;
            }
            thread::yield_now();
        }
        replied
    });

    let start = Instant::now();
    let mut received = 0usize;
    for _ in 0..ITERS {
        let mut msg = Box::new(Message::new(Instant::now(), duplex_chan::now_nanos()));
        loop {
            match channel
                .send_request(msg)
                .expect("channel is active for the whole benchmark")
            {
                SendOutcome::Sent { piggybacked } => {
                    received += piggybacked.is_some() as usize;
                    break;
                }
                SendOutcome::QueueFull { rejected, piggybacked } => {
                    received += piggybacked.is_some() as usize;
                    msg = rejected;
                    thread::yield_now();
                }
            }
        }
        while channel.receive_reply().is_some() {
            received += 1;
        }
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while received < ITERS && Instant::now() < deadline {
        if channel.receive_reply().is_some() {
            received += 1;
        } else {
            thread::yield_now();
        }
    }

    done.store(true, Ordering::Relaxed);
    let replied = worker.join().unwrap();
    let elapsed = start.elapsed();

    println!("sent {ITERS} requests, worker replied to {replied}, master observed {received} replies");
    println!(
        "{:.0} req/s ({:?} total)",
        ITERS as f64 / elapsed.as_secs_f64(),
        elapsed
    );
    println!("processing_time EMA: {} ns", channel.processing_time());
    println!("master stats: {:?}", channel.master_stats());
    println!("worker stats: {:?}", channel.worker_stats());
}
