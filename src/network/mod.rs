//! Network Module
//!
//! The unreliable datagram channel used by the membership protocol (UDP or
//! in-memory), the receive loop that feeds it into the dispatcher, and the
//! framed reliable channel used for file transfer.

mod memory;
pub mod transfer;
mod udp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use transfer::{TransferClient, TransferServer};
pub use udp::UdpTransport;

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::protocol::{Dispatcher, FrameHeader, Outbound, Packet};
use crate::state::{NodeAddress, SharedContext};

/// Largest frame accepted on the reliable channel
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Unreliable, unordered datagram channel
#[async_trait]
pub trait Transport: Send + Sync {
    /// Address peers reach this endpoint on
    fn local_address(&self) -> NodeAddress;

    /// Send to every node on the discovery targets
    async fn broadcast(&self, bytes: &[u8]) -> Result<()>;

    /// Send to one node
    async fn unicast(&self, bytes: &[u8], to: NodeAddress) -> Result<()>;

    /// Wait for the next datagram
    async fn recv(&self) -> Result<(Bytes, SocketAddr)>;

    /// Stop sending and receiving
    async fn close(&self);
}

/// Encode and send the outbound messages of one transition
pub async fn send_all(transport: &dyn Transport, outbound: Vec<Outbound>) {
    for message in outbound {
        let command = message.packet().command();
        let bytes = match message.packet().encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("Failed to encode {}: {}", command, e);
                continue;
            }
        };

        let result = match message {
            Outbound::Unicast { to, .. } => {
                tracing::trace!("Sending {} to {}", command, to);
                transport.unicast(&bytes, to).await
            }
            Outbound::Broadcast { .. } => {
                tracing::trace!("Broadcasting {}", command);
                transport.broadcast(&bytes).await
            }
        };

        if let Err(e) = result {
            tracing::warn!("Failed to send {}: {}", command, e);
        }
    }
}

/// Receive loop: decode, dispatch under the context lock, send the result.
///
/// Runs until `cancel` fires or the transport is closed.
pub async fn listen(
    context: SharedContext,
    dispatcher: Arc<Dispatcher>,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
) {
    tracing::debug!("Listening on {}", transport.local_address());

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = transport.recv() => received,
        };

        match received {
            Ok((bytes, sender)) => {
                let outbound = {
                    let mut context = context.lock().await;
                    dispatcher.dispatch(&mut context, sender, &bytes, Instant::now())
                };
                send_all(transport.as_ref(), outbound).await;
            }
            Err(Error::ShuttingDown) => break,
            Err(e) => {
                tracing::warn!("Receive error: {}", e);
            }
        }
    }

    tracing::debug!("Listener on {} stopped", transport.local_address());
}

/// Read one frame body, verifying its checksum
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length as usize > MAX_FRAME_SIZE {
        return Err(Error::Transfer(format!(
            "frame of {} bytes exceeds limit of {}",
            header.length, MAX_FRAME_SIZE
        )));
    }

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;
    header.verify(&body)?;
    Ok(body)
}

/// Read a framed message
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Packet> {
    let body = read_frame(reader).await?;
    Packet::decode(&body)
}

/// Write a framed message
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> Result<()> {
    let body = packet.encode()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}
