//! Wire protocol: node identity and message types.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;

/// Node identity. Assigned externally at startup and never renegotiated.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// The five message kinds, without their data.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum MessageKind {
    Connect,
    Request,
    Reply,
    Release,
    State,
}

impl MessageKind {
    pub const ALL: [MessageKind; 5] = [
        MessageKind::Connect,
        MessageKind::Request,
        MessageKind::Reply,
        MessageKind::Release,
        MessageKind::State,
    ];

    /// Dense index, for per-kind counters.
    pub fn index(self) -> usize {
        match self {
            MessageKind::Connect => 0,
            MessageKind::Request => 1,
            MessageKind::Reply => 2,
            MessageKind::Release => 3,
            MessageKind::State => 4,
        }
    }
}

/// Kind-specific message data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Body {
    /// Sent once right after dialing; binds the sender id to the accepted link.
    Connect,
    /// Ask every peer for permission to enter the critical section.
    Request,
    /// Permission for the request stamped `round`. `None` acknowledges every open request.
    Reply { round: Option<Timestamp> },
    /// Sender left the critical section.
    Release,
    /// Opaque application state, forwarded verbatim.
    State(String),
}

/// Envelope exchanged between peers. Stamped once, at construction, with the sender's clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sender: NodeId,
    pub timestamp: Timestamp,
    pub body: Body,
}

impl Message {
    pub fn new(sender: NodeId, timestamp: Timestamp, body: Body) -> Self {
        Self {
            sender,
            timestamp,
            body,
        }
    }

    pub fn connect(sender: NodeId, timestamp: Timestamp) -> Self {
        Self::new(sender, timestamp, Body::Connect)
    }

    pub fn request(sender: NodeId, timestamp: Timestamp) -> Self {
        Self::new(sender, timestamp, Body::Request)
    }

    /// Reply to the request stamped `round`.
    pub fn reply(sender: NodeId, timestamp: Timestamp, round: Timestamp) -> Self {
        Self::new(sender, timestamp, Body::Reply { round: Some(round) })
    }

    pub fn release(sender: NodeId, timestamp: Timestamp) -> Self {
        Self::new(sender, timestamp, Body::Release)
    }

    pub fn state(sender: NodeId, timestamp: Timestamp, payload: impl Into<String>) -> Self {
        Self::new(sender, timestamp, Body::State(payload.into()))
    }

    pub fn kind(&self) -> MessageKind {
        match self.body {
            Body::Connect => MessageKind::Connect,
            Body::Request => MessageKind::Request,
            Body::Reply { .. } => MessageKind::Reply,
            Body::Release => MessageKind::Release,
            Body::State(_) => MessageKind::State,
        }
    }

    /// Application payload; only STATE carries one.
    pub fn payload(&self) -> Option<&str> {
        match &self.body {
            Body::State(s) => Some(s),
            _ => None,
        }
    }
}
