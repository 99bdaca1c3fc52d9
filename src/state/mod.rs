//! State Management Module
//!
//! Per-node membership state: identities, the system context, the leader's
//! liveness table and the ring planner.

mod context;
mod identity;
mod liveness;
pub mod ring;

pub use context::{AliveEntry, ContextSnapshot, ElectionRound, RingLink, SharedContext, SystemContext};
pub use identity::{Leader, NodeAddress, NodeId, RemoteNode};
pub use liveness::LeaderState;
pub use ring::Assignment;
