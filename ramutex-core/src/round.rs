//! Per-node request lifecycle: Idle -> Waiting(round) -> Held -> Idle.
//!
//! A node has at most one open request. The set of peers that must reply is
//! fixed when the REQUEST is broadcast; peers that join later are not waited on.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use crate::ledger::RequestId;
use crate::protocol::NodeId;

/// One admission round for a local request.
#[derive(Debug, Clone)]
pub struct Round {
    id: RequestId,
    expected: BTreeSet<NodeId>,
    started: Instant,
}

impl Round {
    /// Snapshot the peers that must reply. The requester itself is never expected.
    pub fn new(id: RequestId, peers: impl IntoIterator<Item = NodeId>, started: Instant) -> Self {
        let expected = peers
            .into_iter()
            .filter(|p| *p != id.requester)
            .collect();
        Self {
            id,
            expected,
            started,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn expected(&self) -> &BTreeSet<NodeId> {
        &self.expected
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// Expected peers that have not replied yet.
    pub fn missing(&self, replies: &BTreeSet<NodeId>) -> Vec<NodeId> {
        self.expected.difference(replies).copied().collect()
    }

    /// Admission predicate: every expected peer replied and the request is earliest.
    /// `replies` is `None` when the request is no longer in the ledger.
    pub fn can_enter(&self, replies: Option<&BTreeSet<NodeId>>, is_earliest: bool) -> bool {
        match replies {
            Some(replies) => is_earliest && self.expected.is_subset(replies),
            None => false,
        }
    }

    /// Stop waiting on `peer` (link closed). Returns whether it was expected.
    pub fn forget(&mut self, peer: NodeId) -> bool {
        self.expected.remove(&peer)
    }

    /// Once `lease` has elapsed, stop waiting on peers that stayed silent and return them.
    pub fn expire_silent(
        &mut self,
        replies: &BTreeSet<NodeId>,
        now: Instant,
        lease: Duration,
    ) -> Vec<NodeId> {
        if now.saturating_duration_since(self.started) < lease {
            return Vec::new();
        }
        let silent = self.missing(replies);
        for peer in &silent {
            self.expected.remove(peer);
        }
        silent
    }
}

/// Local request state. Only `Idle` accepts a new request.
#[derive(Debug, Clone, Default)]
pub enum Phase {
    #[default]
    Idle,
    Waiting(Round),
    Held(RequestId),
}

impl Phase {
    /// Idle -> Waiting.
    pub fn begin(&mut self, round: Round) -> Result<(), PhaseError> {
        match self {
            Phase::Idle => {
                *self = Phase::Waiting(round);
                Ok(())
            }
            _ => Err(PhaseError::RequestInFlight),
        }
    }

    /// Waiting -> Held.
    pub fn admit(&mut self) -> Result<RequestId, PhaseError> {
        match self {
            Phase::Waiting(round) => {
                let id = round.id();
                *self = Phase::Held(id);
                Ok(id)
            }
            _ => Err(PhaseError::NotWaiting),
        }
    }

    /// Held -> Idle.
    pub fn release(&mut self) -> Result<RequestId, PhaseError> {
        match self {
            Phase::Held(id) => {
                let id = *id;
                *self = Phase::Idle;
                Ok(id)
            }
            _ => Err(PhaseError::NotHeld),
        }
    }

    /// Drop whatever is open and return to Idle (shutdown).
    pub fn abandon(&mut self) -> Option<RequestId> {
        match std::mem::take(self) {
            Phase::Idle => None,
            Phase::Waiting(round) => Some(round.id()),
            Phase::Held(id) => Some(id),
        }
    }

    pub fn round(&self) -> Option<&Round> {
        match self {
            Phase::Waiting(round) => Some(round),
            _ => None,
        }
    }

    pub fn round_mut(&mut self) -> Option<&mut Round> {
        match self {
            Phase::Waiting(round) => Some(round),
            _ => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Phase::Idle)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PhaseError {
    #[error("a critical-section request is already open on this node")]
    RequestInFlight,
    #[error("no request is waiting for admission")]
    NotWaiting,
    #[error("critical section is not held")]
    NotHeld,
}
