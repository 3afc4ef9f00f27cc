//! Runtime side of the mutual-exclusion node: configuration, peer links and the coordinator.

pub mod config;
pub mod coordinator;
pub mod link;
pub mod stats;

pub use coordinator::{Coordinator, CoordinatorError, Settings, StateCallback};
pub use link::{LinkError, LinkHandler, PeerLink};
pub use stats::MessageStats;
