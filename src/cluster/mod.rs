//! Cluster Protocols
//!
//! Joining, the ring election, the health monitor and the node runtime
//! that drives them.

pub mod election;
pub mod health;
mod join;
mod node;

pub use join::{join, JoinOutcome};
pub use node::Node;
