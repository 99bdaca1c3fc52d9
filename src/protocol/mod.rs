//! Membership Protocol
//!
//! Command tags, payloads, the per-command codec, the dispatch table and
//! the state transitions it routes to.

mod codec;
mod command;
mod dispatch;
pub mod handlers;
mod message;

pub use codec::{BincodeCodec, FrameHeader, PayloadCodec};
pub use command::Command;
pub use dispatch::{CommandHandler, Dispatcher, Transition, TransitionHandler};
pub use message::{
    ElectionMessage, FileUploadAckMessage, FileUploadMessage, HealthAckMessage, HealthMessage,
    LeaderInfoMessage, NeighbourMessage, Outbound, Packet, StartAckMessage, StartMessage,
};
