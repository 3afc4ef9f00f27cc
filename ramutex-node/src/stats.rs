//! Per-kind message counters.

use std::sync::atomic::{AtomicU64, Ordering};

use ramutex_core::MessageKind;

#[derive(Debug, Default)]
pub struct MessageStats {
    sent: [AtomicU64; 5],
    received: [AtomicU64; 5],
}

impl MessageStats {
    pub(crate) fn record_sent(&self, kind: MessageKind, n: u64) {
        self.sent[kind.index()].fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, kind: MessageKind) {
        self.received[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Frames of `kind` handed to peer links (one per link for broadcasts).
    pub fn sent(&self, kind: MessageKind) -> u64 {
        self.sent[kind.index()].load(Ordering::Relaxed)
    }

    pub fn received(&self, kind: MessageKind) -> u64 {
        self.received[kind.index()].load(Ordering::Relaxed)
    }
}
