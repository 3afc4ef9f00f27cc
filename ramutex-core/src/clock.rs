//! Lamport logical clock. Lock-free; safe to share between reader tasks and the sender.

use std::sync::atomic::{AtomicU64, Ordering};

/// Logical clock value.
pub type Timestamp = u64;

/// Monotonic Lamport clock.
///
/// `increment` stamps locally originated messages, `observe` applies the
/// happened-before rule for every inbound message before it is processed.
#[derive(Debug, Default)]
pub struct LamportClock {
    time: AtomicU64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a known value (tests, restarts).
    pub fn starting_at(time: Timestamp) -> Self {
        Self {
            time: AtomicU64::new(time),
        }
    }

    /// Advance by one and return the new value. Never returns the same value twice.
    pub fn increment(&self) -> Timestamp {
        self.time.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Set the clock to max(current, received) + 1 and return the new value.
    pub fn observe(&self, received: Timestamp) -> Timestamp {
        let prev = self
            .time
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(cur.max(received).saturating_add(1))
            })
            .unwrap_or_else(|cur| cur);
        prev.max(received).saturating_add(1)
    }

    /// Current value without advancing.
    pub fn now(&self) -> Timestamp {
        self.time.load(Ordering::Acquire)
    }
}
