//! Remote presence: the application STATE payload and the liveness table built from it.
//!
//! Payload format: `PLAYER:<id>,<x>,<y>,<facing>,<frame>`, optionally followed by
//! further `|`-separated sections, which are ignored here.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::protocol::NodeId;

/// Remote entities not refreshed within this window are dropped.
pub const LIVENESS_WINDOW: Duration = Duration::from_millis(1000);

const PLAYER_TAG: &str = "PLAYER:";

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
pub enum Facing {
    Up,
    #[default]
    Down,
    Left,
    Right,
}

impl fmt::Display for Facing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Facing::Up => "up",
            Facing::Down => "down",
            Facing::Left => "left",
            Facing::Right => "right",
        })
    }
}

impl FromStr for Facing {
    type Err = PresenceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Facing::Up),
            "down" => Ok(Facing::Down),
            "left" => Ok(Facing::Left),
            "right" => Ok(Facing::Right),
            other => Err(PresenceParseError::Facing(other.to_string())),
        }
    }
}

/// Position, facing and animation frame of one node's entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceSnapshot {
    pub node: NodeId,
    pub x: i32,
    pub y: i32,
    pub facing: Facing,
    pub frame: u8,
}

impl PresenceSnapshot {
    pub fn encode(&self) -> String {
        format!(
            "{}{},{},{},{},{}",
            PLAYER_TAG, self.node.0, self.x, self.y, self.facing, self.frame
        )
    }

    /// Parse the first `PLAYER:` section of a STATE payload.
    pub fn parse(payload: &str) -> Result<Self, PresenceParseError> {
        let section = payload
            .split('|')
            .find_map(|part| part.strip_prefix(PLAYER_TAG))
            .ok_or(PresenceParseError::MissingPlayer)?;
        let fields: Vec<&str> = section.split(',').collect();
        if fields.len() != 5 {
            return Err(PresenceParseError::FieldCount(fields.len()));
        }
        let num = |name: &'static str, v: &str| {
            v.trim()
                .parse::<i64>()
                .map_err(|_| PresenceParseError::Number(name, v.to_string()))
        };
        let node = u32::try_from(num("id", fields[0])?)
            .map_err(|_| PresenceParseError::Number("id", fields[0].to_string()))?;
        let x = i32::try_from(num("x", fields[1])?)
            .map_err(|_| PresenceParseError::Number("x", fields[1].to_string()))?;
        let y = i32::try_from(num("y", fields[2])?)
            .map_err(|_| PresenceParseError::Number("y", fields[2].to_string()))?;
        let facing = fields[3].trim().parse()?;
        let frame = u8::try_from(num("frame", fields[4])?)
            .map_err(|_| PresenceParseError::Number("frame", fields[4].to_string()))?;
        Ok(Self {
            node: NodeId(node),
            x,
            y,
            facing,
            frame,
        })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PresenceParseError {
    #[error("payload has no PLAYER section")]
    MissingPlayer,
    #[error("expected 5 player fields, got {0}")]
    FieldCount(usize),
    #[error("invalid {0}: {1:?}")]
    Number(&'static str, String),
    #[error("invalid facing: {0:?}")]
    Facing(String),
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    snapshot: PresenceSnapshot,
    last_seen: Instant,
}

/// Last known presence of every remote node, expiring after a liveness window.
#[derive(Debug)]
pub struct PresenceTable {
    local: NodeId,
    window: Duration,
    entries: HashMap<NodeId, Entry>,
}

impl PresenceTable {
    pub fn new(local: NodeId) -> Self {
        Self::with_window(local, LIVENESS_WINDOW)
    }

    pub fn with_window(local: NodeId, window: Duration) -> Self {
        Self {
            local,
            window,
            entries: HashMap::new(),
        }
    }

    /// Record a snapshot seen at `now`. Snapshots of the local node are ignored.
    /// Returns true when the node was not tracked before.
    pub fn update(&mut self, snapshot: PresenceSnapshot, now: Instant) -> bool {
        if snapshot.node == self.local {
            return false;
        }
        self.entries
            .insert(
                snapshot.node,
                Entry {
                    snapshot,
                    last_seen: now,
                },
            )
            .is_none()
    }

    /// Parse a STATE payload and record it. Malformed payloads are rejected without touching the table.
    pub fn apply_payload(&mut self, payload: &str, now: Instant) -> Result<bool, PresenceParseError> {
        let snapshot = PresenceSnapshot::parse(payload)?;
        Ok(self.update(snapshot, now))
    }

    /// Remove entries not refreshed within the window and return their ids.
    pub fn expire(&mut self, now: Instant) -> Vec<NodeId> {
        let window = self.window;
        let mut stale: Vec<NodeId> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_seen) >= window)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.entries.remove(id);
        }
        stale.sort();
        stale
    }

    pub fn get(&self, node: NodeId) -> Option<PresenceSnapshot> {
        self.entries.get(&node).map(|e| e.snapshot)
    }

    /// Live snapshots, ordered by node id.
    pub fn active(&self) -> Vec<PresenceSnapshot> {
        let mut out: Vec<PresenceSnapshot> = self.entries.values().map(|e| e.snapshot).collect();
        out.sort_by_key(|s| s.node);
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(node: u32) -> PresenceSnapshot {
        PresenceSnapshot {
            node: NodeId(node),
            x: 1104,
            y: 1008,
            facing: Facing::Left,
            frame: 2,
        }
    }

    #[test]
    fn encode_then_parse() {
        let s = snap(3);
        assert_eq!(s.encode(), "PLAYER:3,1104,1008,left,2");
        assert_eq!(PresenceSnapshot::parse(&s.encode()).unwrap(), s);
    }

    #[test]
    fn parse_ignores_other_sections() {
        let payload = "PLAYER:2,10,-4,up,1|OBJECTS:0:key;1:null;";
        let s = PresenceSnapshot::parse(payload).unwrap();
        assert_eq!(s.node, NodeId(2));
        assert_eq!(s.y, -4);
        assert_eq!(s.facing, Facing::Up);
    }

    #[test]
    fn parse_errors() {
        assert_eq!(
            PresenceSnapshot::parse("OBJECTS:0:key;"),
            Err(PresenceParseError::MissingPlayer)
        );
        assert_eq!(
            PresenceSnapshot::parse("PLAYER:1,2,3"),
            Err(PresenceParseError::FieldCount(3))
        );
        assert!(matches!(
            PresenceSnapshot::parse("PLAYER:1,a,3,up,1"),
            Err(PresenceParseError::Number("x", _))
        ));
        assert_eq!(
            PresenceSnapshot::parse("PLAYER:1,2,3,north,1"),
            Err(PresenceParseError::Facing("north".into()))
        );
    }

    #[test]
    fn local_node_not_tracked() {
        let mut table = PresenceTable::new(NodeId(3));
        assert!(!table.update(snap(3), Instant::now()));
        assert!(table.is_empty());
    }

    #[test]
    fn stale_entity_expires() {
        let start = Instant::now();
        let mut table = PresenceTable::new(NodeId(1));
        assert!(table.update(snap(2), start));
        assert!(table.update(snap(3), start));
        // Node 3 keeps sending, node 2 goes quiet.
        assert!(!table.update(snap(3), start + Duration::from_millis(600)));
        assert!(table.expire(start + Duration::from_millis(900)).is_empty());
        assert_eq!(
            table.expire(start + Duration::from_millis(1000)),
            vec![NodeId(2)]
        );
        let active: Vec<NodeId> = table.active().iter().map(|s| s.node).collect();
        assert_eq!(active, vec![NodeId(3)]);
    }

    #[test]
    fn malformed_payload_leaves_table_untouched() {
        let mut table = PresenceTable::new(NodeId(1));
        assert!(table.apply_payload("garbage", Instant::now()).is_err());
        assert!(table.is_empty());
        assert!(table.apply_payload("PLAYER:4,0,0,down,1", Instant::now()).unwrap());
        assert_eq!(table.get(NodeId(4)).unwrap().facing, Facing::Down);
    }
}
