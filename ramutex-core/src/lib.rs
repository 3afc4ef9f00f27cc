//! Distributed mutual exclusion reference implementation.
//! Host-driven: no I/O; the runtime owns sockets and tasks and calls in here.

pub mod clock;
pub mod ledger;
pub mod presence;
pub mod protocol;
pub mod round;
pub mod wire;

pub use clock::{LamportClock, Timestamp};
pub use ledger::{Request, RequestId, RequestLedger};
pub use presence::{Facing, PresenceParseError, PresenceSnapshot, PresenceTable, LIVENESS_WINDOW};
pub use protocol::{Body, Message, MessageKind, NodeId};
pub use round::{Phase, PhaseError, Round};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError, LEN_SIZE, MAX_FRAME_LEN};
