//! UDP Transport
//!
//! One socket bound to the membership port, broadcast enabled. START is
//! broadcast to every configured discovery port. Closing the transport
//! releases the port.

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;

use super::Transport;
use crate::config::WolfRingConfig;
use crate::error::{Error, Result};
use crate::state::NodeAddress;

/// Largest datagram we accept
const MAX_DATAGRAM: usize = 64 * 1024;

/// Membership transport over UDP
#[derive(Debug)]
pub struct UdpTransport {
    socket: RwLock<Option<Arc<UdpSocket>>>,
    local_address: NodeAddress,
    broadcast_targets: Vec<SocketAddr>,
}

impl UdpTransport {
    /// Bind the membership socket described by `config`
    pub async fn bind(config: &WolfRingConfig) -> Result<Self> {
        let bind_address = config.bind_address();
        let socket = UdpSocket::bind(bind_address).await.map_err(|e| Error::Bind {
            address: bind_address.to_string(),
            reason: e.to_string(),
        })?;

        socket
            .set_broadcast(true)
            .map_err(|e| Error::Network(format!("Failed to enable broadcast: {}", e)))?;

        let port = socket.local_addr()?.port();
        let local_address = NodeAddress::new(config.advertise_ip()?, port);
        tracing::info!("Membership socket bound on {} as {}", bind_address, local_address);

        Ok(Self {
            socket: RwLock::new(Some(Arc::new(socket))),
            local_address,
            broadcast_targets: config.cluster.discovery_targets(),
        })
    }

    /// The bound socket, or `ShuttingDown` once closed
    async fn socket(&self) -> Result<Arc<UdpSocket>> {
        self.socket.read().await.clone().ok_or(Error::ShuttingDown)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_address(&self) -> NodeAddress {
        self.local_address
    }

    async fn broadcast(&self, bytes: &[u8]) -> Result<()> {
        let socket = self.socket().await?;
        let mut last_error = None;
        let mut delivered = 0;

        for target in &self.broadcast_targets {
            match socket.send_to(bytes, target).await {
                Ok(_) => delivered += 1,
                Err(e) => {
                    tracing::trace!("Broadcast to {} failed: {}", target, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if delivered == 0 => Err(Error::Network(format!("Broadcast failed: {}", e))),
            _ => Ok(()),
        }
    }

    async fn unicast(&self, bytes: &[u8], to: NodeAddress) -> Result<()> {
        self.socket()
            .await?
            .send_to(bytes, to.socket_addr())
            .await
            .map_err(|e| Error::Network(format!("Send to {} failed: {}", to, e)))?;
        Ok(())
    }

    async fn recv(&self) -> Result<(Bytes, SocketAddr)> {
        let socket = self.socket().await?;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, from) = socket.recv_from(&mut buf).await?;
        buf.truncate(len);
        Ok((Bytes::from(buf), from))
    }

    async fn close(&self) {
        if self.socket.write().await.take().is_some() {
            tracing::debug!("Closed membership socket {}", self.local_address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config() -> WolfRingConfig {
        let mut config = WolfRingConfig::default();
        config.node.bind_ip = "127.0.0.1".parse().unwrap();
        config.node.advertise_ip = Some("127.0.0.1".parse().unwrap());
        config.node.listen_port = 0;
        config
    }

    #[tokio::test]
    async fn test_unicast_between_sockets() {
        let a = UdpTransport::bind(&loopback_config()).await.unwrap();
        let b = UdpTransport::bind(&loopback_config()).await.unwrap();
        assert_ne!(a.local_address().port(), 0);

        a.unicast(b"ping", b.local_address()).await.unwrap();
        let (bytes, from) = b.recv().await.unwrap();
        assert_eq!(&bytes[..], b"ping");
        assert_eq!(from.port(), a.local_address().port());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let a = UdpTransport::bind(&loopback_config()).await.unwrap();
        let mut config = loopback_config();
        config.node.listen_port = a.local_address().port();

        let err = UdpTransport::bind(&config).await.unwrap_err();
        assert!(matches!(err, Error::Bind { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_close_releases_port() {
        let a = UdpTransport::bind(&loopback_config()).await.unwrap();
        let mut config = loopback_config();
        config.node.listen_port = a.local_address().port();

        a.close().await;
        a.close().await;
        assert!(matches!(a.recv().await, Err(Error::ShuttingDown)));
        assert!(matches!(a.broadcast(b"x").await, Err(Error::ShuttingDown)));

        let rebound = UdpTransport::bind(&config).await.unwrap();
        assert_eq!(rebound.local_address().port(), config.node.listen_port);
    }
}
