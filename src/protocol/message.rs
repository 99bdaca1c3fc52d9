//! Protocol Messages
//!
//! Payload types for every command, the [`Packet`] sum type used when a
//! caller does not know the command in advance, and [`Outbound`] sends
//! produced by state transitions.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::codec::{BincodeCodec, PayloadCodec};
use super::command::Command;
use crate::error::{Error, Result};
use crate::state::{Leader, NodeAddress, NodeId, RemoteNode};

/// START: a node asks to join, announcing the port it listens on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartMessage {
    pub listen_port: u16,
}

/// START_ACK: the leader admits a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartAckMessage {
    pub leader: Leader,
    /// Neighbour assigned to the joining node
    pub neighbour: Option<RemoteNode>,
    /// Ring members in join order
    pub members: Vec<RemoteNode>,
}

/// HEALTH: heartbeat to the leader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthMessage {
    pub node: NodeAddress,
}

/// HEALTH_ACK: the leader's view, pushed back to a heartbeating node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthAckMessage {
    pub leader: Leader,
    /// The leader's record of the receiver's neighbour
    pub neighbour: Option<RemoteNode>,
    pub members: Vec<RemoteNode>,
}

/// ELECTION: ring token (`full_circle == false`) or winner announcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionMessage {
    pub candidate: NodeId,
    pub candidate_address: NodeAddress,
    pub full_circle: bool,
}

/// LEADER_INFO: a node declares itself leader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderInfoMessage {
    pub leader: Leader,
    pub leader_id: NodeId,
}

/// NEIGHBOUR: the leader sets or clears the receiver's neighbour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighbourMessage {
    pub leader: Leader,
    pub neighbour: Option<RemoteNode>,
}

/// FILE_UPLOAD: a file pushed over the reliable channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUploadMessage {
    pub transfer_id: Uuid,
    pub file_name: String,
    /// `data` is LZ4 compressed with a size prefix
    pub compressed: bool,
    pub data: Vec<u8>,
}

/// FILE_UPLOAD_ACK: the receiver stored (or already had) the file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUploadAckMessage {
    pub transfer_id: Uuid,
    pub stored_bytes: u64,
    pub duplicate: bool,
}

/// Any protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Start(StartMessage),
    StartAck(StartAckMessage),
    Health(HealthMessage),
    HealthAck(HealthAckMessage),
    Election(ElectionMessage),
    LeaderInfo(LeaderInfoMessage),
    Neighbour(NeighbourMessage),
    FileUpload(FileUploadMessage),
    FileUploadAck(FileUploadAckMessage),
}

fn encode_with<M>(command: Command, message: &M) -> Result<Vec<u8>>
where
    M: Serialize + serde::de::DeserializeOwned,
{
    BincodeCodec::<M>::new(command).encode(message)
}

fn decode_with<M>(command: Command, bytes: &[u8]) -> Result<M>
where
    M: Serialize + serde::de::DeserializeOwned,
{
    BincodeCodec::<M>::new(command).decode(bytes)
}

impl Packet {
    pub fn command(&self) -> Command {
        match self {
            Packet::Start(_) => Command::Start,
            Packet::StartAck(_) => Command::StartAck,
            Packet::Health(_) => Command::Health,
            Packet::HealthAck(_) => Command::HealthAck,
            Packet::Election(_) => Command::Election,
            Packet::LeaderInfo(_) => Command::LeaderInfo,
            Packet::Neighbour(_) => Command::Neighbour,
            Packet::FileUpload(_) => Command::FileUpload,
            Packet::FileUploadAck(_) => Command::FileUploadAck,
        }
    }

    /// Encode with the command's codec
    pub fn encode(&self) -> Result<Vec<u8>> {
        let command = self.command();
        match self {
            Packet::Start(m) => encode_with(command, m),
            Packet::StartAck(m) => encode_with(command, m),
            Packet::Health(m) => encode_with(command, m),
            Packet::HealthAck(m) => encode_with(command, m),
            Packet::Election(m) => encode_with(command, m),
            Packet::LeaderInfo(m) => encode_with(command, m),
            Packet::Neighbour(m) => encode_with(command, m),
            Packet::FileUpload(m) => encode_with(command, m),
            Packet::FileUploadAck(m) => encode_with(command, m),
        }
    }

    /// Decode any datagram by its tag
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let tag = *bytes.first().ok_or(Error::EmptyPacket)?;
        let command = Command::from_tag(tag)?;
        let packet = match command {
            Command::Start => Packet::Start(decode_with(command, bytes)?),
            Command::StartAck => Packet::StartAck(decode_with(command, bytes)?),
            Command::Health => Packet::Health(decode_with(command, bytes)?),
            Command::HealthAck => Packet::HealthAck(decode_with(command, bytes)?),
            Command::Election => Packet::Election(decode_with(command, bytes)?),
            Command::LeaderInfo => Packet::LeaderInfo(decode_with(command, bytes)?),
            Command::Neighbour => Packet::Neighbour(decode_with(command, bytes)?),
            Command::FileUpload => Packet::FileUpload(decode_with(command, bytes)?),
            Command::FileUploadAck => Packet::FileUploadAck(decode_with(command, bytes)?),
        };
        Ok(packet)
    }
}

/// A send requested by a state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Unicast { to: NodeAddress, packet: Packet },
    Broadcast { packet: Packet },
}

impl Outbound {
    pub fn unicast(to: NodeAddress, packet: Packet) -> Self {
        Outbound::Unicast { to, packet }
    }

    pub fn broadcast(packet: Packet) -> Self {
        Outbound::Broadcast { packet }
    }

    pub fn packet(&self) -> &Packet {
        match self {
            Outbound::Unicast { packet, .. } | Outbound::Broadcast { packet } => packet,
        }
    }

    /// Unicast destination, `None` for broadcasts
    pub fn destination(&self) -> Option<NodeAddress> {
        match self {
            Outbound::Unicast { to, .. } => Some(*to),
            Outbound::Broadcast { .. } => None,
        }
    }
}
