//! Wire Codec
//!
//! A datagram is one tag byte followed by the bincode encoding of the
//! command's payload. Each command has its own codec so a handler only
//! ever decodes the payload type it expects.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

use super::command::Command;
use crate::error::{Error, Result};

/// Encodes and decodes one command's payload
pub trait PayloadCodec: Send + Sync {
    type Message;

    /// Command this codec is bound to
    fn command(&self) -> Command;

    /// Tag byte followed by the encoded payload
    fn encode(&self, message: &Self::Message) -> Result<Vec<u8>>;

    /// Decode a full datagram, tag included
    fn decode(&self, bytes: &[u8]) -> Result<Self::Message>;
}

/// Bincode payload codec for message type `M`
#[derive(Debug)]
pub struct BincodeCodec<M> {
    command: Command,
    _message: PhantomData<fn() -> M>,
}

impl<M> BincodeCodec<M> {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            _message: PhantomData,
        }
    }
}

impl<M> Clone for BincodeCodec<M> {
    fn clone(&self) -> Self {
        Self::new(self.command)
    }
}

impl<M> PayloadCodec for BincodeCodec<M>
where
    M: Serialize + DeserializeOwned,
{
    type Message = M;

    fn command(&self) -> Command {
        self.command
    }

    fn encode(&self, message: &M) -> Result<Vec<u8>> {
        let payload = bincode::serialize(message)?;
        let mut bytes = Vec::with_capacity(payload.len() + 1);
        bytes.push(self.command.tag());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    fn decode(&self, bytes: &[u8]) -> Result<M> {
        let (tag, payload) = bytes.split_first().ok_or(Error::EmptyPacket)?;
        if *tag != self.command.tag() {
            return Err(Error::CommandMismatch {
                expected: self.command.to_string(),
                found: *tag,
            });
        }
        Ok(bincode::deserialize(payload)?)
    }
}

/// Frame header for length-prefixed messages on the reliable channel
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Body length
    pub length: u32,
    /// CRC32 of the body
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }

    /// Check a received body against this header
    pub fn verify(&self, body: &[u8]) -> Result<()> {
        if crc32fast::hash(body) != self.checksum {
            return Err(Error::ChecksumMismatch);
        }
        Ok(())
    }
}
