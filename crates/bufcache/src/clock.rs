//! Monotonic tick counter used as the recency proxy

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonically non-decreasing tick counter
///
/// The cache only ever reads the counter; whoever embeds the cache drives it,
/// typically from a periodic timer thread. Recency stamps are tick values, so
/// a clock that is never advanced degrades eviction to scan order.
#[derive(Debug, Default)]
pub struct TickClock {
    ticks: AtomicU64,
}

impl TickClock {
    /// Create a clock starting at tick 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Current tick value
    pub fn now(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Advance the clock by one tick, returning the new value
    pub fn advance(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::Relaxed) + 1
    }
}
