//! WolfRing - Self-Organizing Cluster Membership
//!
//! Peer processes discover each other over an unreliable datagram
//! transport, elect a single leader, arrange themselves in a ring of
//! neighbour links and detect failed members through heartbeats.
//!
//! # Architecture
//!
//! Every node owns one [`state::SystemContext`] behind a mutex. Incoming
//! datagrams are decoded by tag and routed by a [`protocol::Dispatcher`]
//! to pure state transitions that return the messages to send. Timers in
//! [`cluster::health`] drive heartbeats, leader failure detection and the
//! leader's liveness sweep.
//!
//! # Features
//!
//! - Broadcast discovery with bounded retries and self-promotion
//! - Leader-assigned ring neighbours with repair after evictions
//! - Chang-Roberts ring election when the leader goes quiet
//! - UDP and in-memory transports
//! - Reliable TCP file transfer with LZ4 compression
//! - HTTP status API

pub mod api;
pub mod cluster;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod state;

pub use config::WolfRingConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cluster::{JoinOutcome, Node};
    pub use crate::config::WolfRingConfig;
    pub use crate::error::{Error, Result};
    pub use crate::network::{MemoryNetwork, Transport, UdpTransport};
    pub use crate::protocol::{Command, Packet};
    pub use crate::state::{NodeAddress, NodeId, SharedContext, SystemContext};
}
