//! In-Memory Transport
//!
//! A process-local datagram network for tests and development. Every
//! endpoint registers an inbox on a shared [`MemoryNetwork`]; broadcasts
//! reach every registered endpoint (the sender included, as UDP broadcast
//! does), unicasts to an unknown address vanish like a lost datagram.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};

use super::Transport;
use crate::error::{Error, Result};
use crate::state::NodeAddress;

type Datagram = (Bytes, SocketAddr);

/// Shared hub connecting [`MemoryTransport`] endpoints
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    endpoints: Arc<RwLock<HashMap<NodeAddress, mpsc::UnboundedSender<Datagram>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint at `address`
    pub async fn endpoint(&self, address: NodeAddress) -> Result<MemoryTransport> {
        let mut endpoints = self.endpoints.write().await;
        if endpoints.contains_key(&address) {
            return Err(Error::Bind {
                address: address.to_string(),
                reason: "address already in use".into(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        endpoints.insert(address, tx);

        Ok(MemoryTransport {
            address,
            network: self.clone(),
            inbox: Mutex::new(rx),
            broadcasts: AtomicU64::new(0),
        })
    }

    /// Drop an endpoint as if its process crashed.
    ///
    /// Its pending and future datagrams are lost and it can no longer send.
    pub async fn disconnect(&self, address: &NodeAddress) -> bool {
        self.endpoints.write().await.remove(address).is_some()
    }

    /// Currently registered endpoints
    pub async fn addresses(&self) -> Vec<NodeAddress> {
        let mut addresses: Vec<NodeAddress> = self.endpoints.read().await.keys().copied().collect();
        addresses.sort();
        addresses
    }

    async fn is_connected(&self, address: &NodeAddress) -> bool {
        self.endpoints.read().await.contains_key(address)
    }
}

/// One endpoint on a [`MemoryNetwork`]
#[derive(Debug)]
pub struct MemoryTransport {
    address: NodeAddress,
    network: MemoryNetwork,
    inbox: Mutex<mpsc::UnboundedReceiver<Datagram>>,
    broadcasts: AtomicU64,
}

impl MemoryTransport {
    /// Broadcasts sent so far
    pub fn broadcast_count(&self) -> u64 {
        self.broadcasts.load(Ordering::Relaxed)
    }

    async fn ensure_connected(&self) -> Result<()> {
        if self.network.is_connected(&self.address).await {
            Ok(())
        } else {
            Err(Error::ShuttingDown)
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_address(&self) -> NodeAddress {
        self.address
    }

    async fn broadcast(&self, bytes: &[u8]) -> Result<()> {
        self.ensure_connected().await?;
        self.broadcasts.fetch_add(1, Ordering::Relaxed);

        let payload = Bytes::copy_from_slice(bytes);
        let endpoints = self.network.endpoints.read().await;
        for inbox in endpoints.values() {
            let _ = inbox.send((payload.clone(), self.address.socket_addr()));
        }
        Ok(())
    }

    async fn unicast(&self, bytes: &[u8], to: NodeAddress) -> Result<()> {
        self.ensure_connected().await?;

        let endpoints = self.network.endpoints.read().await;
        match endpoints.get(&to) {
            Some(inbox) => {
                let _ = inbox.send((Bytes::copy_from_slice(bytes), self.address.socket_addr()));
            }
            None => tracing::trace!("Datagram to {} lost: no such endpoint", to),
        }
        Ok(())
    }

    async fn recv(&self) -> Result<(Bytes, SocketAddr)> {
        self.inbox.lock().await.recv().await.ok_or(Error::ShuttingDown)
    }

    async fn close(&self) {
        self.network.disconnect(&self.address).await;
    }
}
