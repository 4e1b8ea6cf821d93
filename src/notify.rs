//! The event-notifier external collaborator (`spec.md` §6): a cross-thread
//! wake primitive whose repeated fires between two observations coalesce
//! into one wake.
//!
//! Implemented with a Linux `eventfd(2)` armed with `EFD_SEMAPHORE`, the
//! same primitive the teacher crate used for its own SPMC wakeups. Each
//! `fire()` increments the kernel-side counter by one; a thread blocked in
//! `poll()` wakes as soon as the counter becomes non-zero, and `drain()`
//! decrements it by the number of pending fires it observes.

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use std::io;
use std::os::fd::{AsFd, AsRawFd, RawFd};

/// A coalescing cross-thread wakeup, backed by an `eventfd`.
pub struct EventFdNotifier {
    fd: EventFd,
}

impl EventFdNotifier {
    /// Create a notifier armed with `EFD_SEMAPHORE`, so that `drain`
    /// consumes pending fires one at a time rather than all at once.
    pub fn new() -> io::Result<Self> {
        let fd = EventFd::from_flags(EfdFlags::EFD_SEMAPHORE | EfdFlags::EFD_NONBLOCK)
            .map_err(io::Error::from)?;
        Ok(EventFdNotifier { fd })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_fd().as_raw_fd()
    }

    /// Wake the peer. Idempotent in the sense `spec.md` means: firing
    /// repeatedly between two drains coalesces into however many drains
    /// the peer performs, never more wakes than fires.
    pub fn fire(&self) -> io::Result<()> {
        let mut buf = [0u8; 8];
        (&mut buf[..]).write_u64::<NativeEndian>(1)?;
        nix::unistd::write(&self.fd, &buf).map_err(io::Error::from)?;
        Ok(())
    }

    /// Block (optionally with a timeout) until at least one fire is
    /// pending. Returns `true` if a fire was observed, `false` on timeout.
    /// This is the "blocking wait between batches of work" `spec.md` §5
    /// places outside the core — the channel operations above never call
    /// this themselves.
    pub fn poll(&self, timeout_ms: i32) -> io::Result<bool> {
        let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
        let timeout = PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::NONE);
        let n = poll(&mut fds, timeout).map_err(io::Error::from)?;
        Ok(n > 0)
    }

    /// Consume one pending fire. Returns `Ok(0)` (not an error) if nothing
    /// was pending, matching the non-blocking "empty" contract the control
    /// plane relies on.
    pub fn drain(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        match nix::unistd::read(self.fd.as_raw_fd(), &mut buf) {
            Ok(_) => Ok((&buf[..]).read_u64::<NativeEndian>()?),
            Err(nix::errno::Errno::EAGAIN) => Ok(0),
            Err(e) => Err(io::Error::from(e)),
        }
    }
}
