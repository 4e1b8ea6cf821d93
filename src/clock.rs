//! The monotonic clock external collaborator (`spec.md` §6): "returns u64
//! nanoseconds since process start; strictly non-decreasing."

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds elapsed since the first call to any function in this module
/// within the process. Strictly non-decreasing, per the external clock
/// contract; never wall-clock, never subject to NTP adjustment.
pub fn now_nanos() -> u64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}
