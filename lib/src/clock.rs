//! Monotonic millisecond clock.
//!
//! The engine never reads a hardware counter itself. Ageing decisions
//! (reassembly eviction, timestamp node expiry) take a clock from the
//! embedding kernel through [`MonotonicClock`], which keeps the logic
//! deterministic under test.

use core::sync::atomic::{AtomicU64, Ordering};

/// Source of monotonically increasing time since an arbitrary epoch.
pub trait MonotonicClock: Send + Sync {
    /// Milliseconds since the epoch. Must never go backwards.
    fn now_ms(&self) -> u64;
}

/// Milliseconds elapsed from `earlier` to `now`, zero if the clock was
/// sampled out of order.
#[inline]
pub fn elapsed_ms(now: u64, earlier: u64) -> u64 {
    now.saturating_sub(earlier)
}

/// Clock advanced explicitly by its owner.
///
/// Used by hosts that drive the engine from their own tick and by tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub const fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::AcqRel);
    }

    /// Move the clock to `ms`. Earlier values are ignored.
    pub fn set(&self, ms: u64) {
        self.now.fetch_max(ms, Ordering::AcqRel);
    }
}

impl MonotonicClock for ManualClock {
    #[inline]
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_never_goes_backwards() {
        let clock = ManualClock::new(100);
        clock.advance(50);
        assert_eq!(clock.now_ms(), 150);
        clock.set(20);
        assert_eq!(clock.now_ms(), 150);
        clock.set(400);
        assert_eq!(clock.now_ms(), 400);
    }

    #[test]
    fn elapsed_saturates() {
        assert_eq!(elapsed_ms(10, 30), 0);
        assert_eq!(elapsed_ms(30, 10), 20);
    }
}
