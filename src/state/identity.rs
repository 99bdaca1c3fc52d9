//! Node Identity
//!
//! Addresses and election identifiers. A node is identified by the
//! (IP, port) pair it listens on; its [`NodeId`] is derived from that pair
//! so every node computes the same id for a peer without coordination.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::Error;

/// Network endpoint of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress {
    ip: IpAddr,
    port: u16,
}

/// A peer other than this node
pub type RemoteNode = NodeAddress;

/// A node believed to be the leader
pub type Leader = NodeAddress;

impl NodeAddress {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Election identifier for this address
    pub fn node_id(&self) -> NodeId {
        NodeId::derive(self.ip, self.port)
    }
}

impl From<SocketAddr> for NodeAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

impl FromStr for NodeAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>()
            .map(NodeAddress::from)
            .map_err(|e| Error::Config(format!("invalid node address '{}': {}", s, e)))
    }
}

/// Totally ordered election identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

/// Marks ids derived from IPv6 addresses, keeping them above every IPv4 id
const IPV6_MARKER: u64 = 1 << 63;

impl NodeId {
    /// Derive the id for (ip, port).
    ///
    /// IPv4 pairs are packed as `ip << 16 | port`, which is injective. IPv6
    /// pairs are hashed with SHA-1 and tagged with the top bit.
    pub fn derive(ip: IpAddr, port: u16) -> Self {
        match ip {
            IpAddr::V4(v4) => NodeId(((u32::from(v4) as u64) << 16) | port as u64),
            IpAddr::V6(v6) => {
                let mut hasher = Sha1::new();
                hasher.update(v6.octets());
                hasher.update(port.to_be_bytes());
                let digest = hasher.finalize();
                let mut prefix = [0u8; 8];
                prefix.copy_from_slice(&digest[..8]);
                NodeId(u64::from_be_bytes(prefix) | IPV6_MARKER)
            }
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
