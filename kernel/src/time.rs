//! System time
//!
//! Wall-clock milliseconds derived from the scheduler tick. The timer
//! interrupt advances the tick on bare metal; hosted builds advance it
//! synthetically through `sched::yield_now`.

use core::sync::atomic::{AtomicU64, Ordering};

/// Milliseconds per scheduler tick.
pub const TICK_MS: u64 = 10;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Advance the clock by one tick.
pub fn tick() {
    TICKS.fetch_add(1, Ordering::AcqRel);
}

/// Milliseconds since boot.
pub fn system_time_ms() -> u64 {
    TICKS.load(Ordering::Acquire) * TICK_MS
}

/// Ticks since boot.
pub fn uptime_ticks() -> u64 {
    TICKS.load(Ordering::Acquire)
}
