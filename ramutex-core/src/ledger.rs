//! Request ledger: every open critical-section request known to this node, in total order.
//!
//! The internal lock only protects the ledger's own maps. It is unrelated to the
//! distributed critical section the ledger helps arbitrate.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::clock::Timestamp;
use crate::protocol::NodeId;

/// Identity and priority of a request.
///
/// Field order matters: the derived `Ord` compares by timestamp, then requester,
/// which is the total order every node agrees on.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RequestId {
    pub timestamp: Timestamp,
    pub requester: NodeId,
}

impl RequestId {
    pub fn new(requester: NodeId, timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            requester,
        }
    }
}

/// An open request and the peers that replied to it so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: RequestId,
    pub replies: BTreeSet<NodeId>,
}

#[derive(Debug, Default)]
struct Inner {
    open: HashMap<NodeId, Request>,
    order: BTreeSet<RequestId>,
}

/// Thread-safe collection of open requests, at most one per requester.
#[derive(Debug, Default)]
pub struct RequestLedger {
    inner: Mutex<Inner>,
}

impl RequestLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Both maps are updated together under one guard; a poisoned lock is still consistent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert the requester's open request, replacing any previous one (last write wins).
    pub fn add_request(&self, requester: NodeId, timestamp: Timestamp) -> RequestId {
        let id = RequestId::new(requester, timestamp);
        let mut inner = self.lock();
        if let Some(old) = inner.open.insert(
            requester,
            Request {
                id,
                replies: BTreeSet::new(),
            },
        ) {
            inner.order.remove(&old.id);
        }
        inner.order.insert(id);
        id
    }

    /// Withdraw the requester's open request. No-op when there is none.
    pub fn remove_request(&self, requester: NodeId) -> Option<Request> {
        let mut inner = self.lock();
        let removed = inner.open.remove(&requester)?;
        inner.order.remove(&removed.id);
        Some(removed)
    }

    /// Record `peer` as having replied to every open request.
    pub fn add_reply(&self, peer: NodeId) {
        let mut inner = self.lock();
        for req in inner.open.values_mut() {
            req.replies.insert(peer);
        }
    }

    /// Record `peer` as having replied to exactly the request `id`.
    /// Returns false when `id` is no longer open (stale reply).
    pub fn add_reply_to(&self, id: RequestId, peer: NodeId) -> bool {
        let mut inner = self.lock();
        match inner.open.get_mut(&id.requester) {
            Some(req) if req.id == id => {
                req.replies.insert(peer);
                true
            }
            _ => false,
        }
    }

    /// True iff `id` is the minimum open request. An empty ledger has no earliest request.
    pub fn is_earliest(&self, id: &RequestId) -> bool {
        self.lock().order.first() == Some(id)
    }

    pub fn earliest(&self) -> Option<RequestId> {
        self.lock().order.first().copied()
    }

    /// Snapshot of the requester's open request.
    pub fn get(&self, requester: NodeId) -> Option<Request> {
        self.lock().open.get(&requester).cloned()
    }

    /// Peers that replied to `id`, or `None` when `id` is not open.
    pub fn replies_to(&self, id: &RequestId) -> Option<BTreeSet<NodeId>> {
        let inner = self.lock();
        inner
            .open
            .get(&id.requester)
            .filter(|req| req.id == *id)
            .map(|req| req.replies.clone())
    }

    /// Open requests in total order.
    pub fn ordered(&self) -> Vec<RequestId> {
        self.lock().order.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().open.is_empty()
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.open.clear();
        inner.order.clear();
    }
}
