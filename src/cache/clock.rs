//! Recency Clocks
//!
//! Timestamps stamped on buffer descriptors when they are acquired and
//! released. The eviction scan only compares them, so any monotonically
//! non-decreasing counter works.

use parking_lot::Mutex;

/// Source of recency timestamps
pub trait Clock: Send + Sync {
    /// Current timestamp; never smaller than a previously returned one
    fn now(&self) -> u64;
}

/// Clock that advances by one on every stamp
///
/// Every descriptor gets a distinct timestamp, so eviction order is exactly
/// the order of the last acquire/release.
#[derive(Debug, Default)]
pub struct LogicalClock {
    counter: Mutex<u64>,
}

impl LogicalClock {
    /// Create a clock starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Last stamp handed out
    pub fn peek(&self) -> u64 {
        *self.counter.lock()
    }
}

impl Clock for LogicalClock {
    fn now(&self) -> u64 {
        let mut counter = self.counter.lock();
        *counter += 1;
        *counter
    }
}

/// Clock advanced only by an external tick source
///
/// Descriptors stamped between two ticks share a timestamp; the eviction
/// scan then keeps the first candidate it meets in shard order.
#[derive(Debug, Default)]
pub struct TickClock {
    ticks: Mutex<u64>,
}

impl TickClock {
    /// Create a clock at tick zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance by one tick
    pub fn tick(&self) {
        *self.ticks.lock() += 1;
    }
}

impl Clock for TickClock {
    fn now(&self) -> u64 {
        *self.ticks.lock()
    }
}
