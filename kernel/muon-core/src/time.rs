//! Boot-relative time, counted in timer ticks.
//!
//! The timer interrupt calls [`tick`] once per interrupt; everything else
//! reads [`ticks`]. At [`TICK_HZ`] = 1000 one tick is one millisecond, which
//! keeps the conversion helpers trivial. Before the timer is wired up the
//! counter simply stays at zero, so callers always get a valid (if stale)
//! timestamp.

use core::sync::atomic::{AtomicU64, Ordering};

/// Timer interrupt frequency in Hz (one tick per millisecond).
pub const TICK_HZ: u64 = 1000;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Advances the tick counter by one. Called from the timer interrupt only.
#[inline]
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Advances the tick counter by `n` ticks.
///
/// Used by simulated time sources (host tests, polled devices).
#[inline]
pub fn advance(n: u64) {
    TICKS.fetch_add(n, Ordering::Relaxed);
}

/// Returns the number of ticks since boot.
#[inline]
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Returns milliseconds since boot.
#[inline]
pub fn uptime_ms() -> u64 {
    ticks() * 1000 / TICK_HZ
}

/// Converts a millisecond duration to ticks, rounding up to at least one.
pub fn ms_to_ticks(ms: u64) -> u64 {
    let t = ms * TICK_HZ / 1000;
    if t == 0 { 1 } else { t }
}
