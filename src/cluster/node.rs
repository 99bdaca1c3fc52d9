//! Node Runtime
//!
//! Owns one node's context, transport and dispatch table, and runs the
//! receive loop and the health timers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::health;
use super::join::{self, JoinOutcome};
use crate::config::{ClusterConfig, WolfRingConfig};
use crate::error::{Error, Result};
use crate::network::{self, send_all, Transport, UdpTransport};
use crate::protocol::Dispatcher;
use crate::state::{NodeAddress, SharedContext, SystemContext};

/// A cluster member
pub struct Node {
    config: WolfRingConfig,
    context: SharedContext,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    joined: AtomicBool,
    stopped: AtomicBool,
}

impl Node {
    /// Bind the UDP membership socket described by `config`
    pub async fn bind(config: WolfRingConfig) -> Result<Self> {
        let transport = UdpTransport::bind(&config).await?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Run over an existing transport
    pub fn with_transport(config: WolfRingConfig, transport: Arc<dyn Transport>) -> Self {
        let context = SharedContext::new(SystemContext::new(transport.local_address()));

        Self {
            config,
            context,
            transport,
            dispatcher: Arc::new(Dispatcher::membership()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            joined: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &SharedContext {
        &self.context
    }

    pub fn local_address(&self) -> NodeAddress {
        self.transport.local_address()
    }

    /// Token cancelled by [`Node::shutdown`]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Join the cluster and start the health timers.
    ///
    /// Can only be called once per node.
    pub async fn join_system(&self) -> Result<JoinOutcome> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        if self.joined.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyJoined);
        }

        tracing::info!(
            "Node {} ({}) joining",
            self.local_address(),
            self.local_address().node_id()
        );

        self.spawn(network::listen(
            self.context.clone(),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.transport),
            self.cancel.clone(),
        ))
        .await;

        let outcome = join::join(
            &self.context,
            self.transport.as_ref(),
            &self.config.cluster,
            &self.cancel,
        )
        .await?;

        self.spawn(heartbeat_loop(
            self.context.clone(),
            Arc::clone(&self.transport),
            self.config.cluster.clone(),
            self.cancel.clone(),
        ))
        .await;
        self.spawn(sweep_loop(
            self.context.clone(),
            Arc::clone(&self.transport),
            self.config.cluster.clone(),
            self.cancel.clone(),
        ))
        .await;

        Ok(outcome)
    }

    /// Stop every task and close the transport. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                tracing::warn!("Node task ended abnormally: {}", e);
            }
        }

        self.transport.close().await;
        tracing::info!("Node {} stopped", self.local_address());
    }

    async fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().await.push(tokio::spawn(future));
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Send heartbeats and watch the leader
async fn heartbeat_loop(
    context: SharedContext,
    transport: Arc<dyn Transport>,
    config: ClusterConfig,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.heartbeat_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let jitter = health::random_jitter(config.election_jitter());
        let outbound = {
            let mut context = context.lock().await;
            health::heartbeat_tick(&mut context, &config, Instant::now(), jitter)
        };
        send_all(transport.as_ref(), outbound).await;
    }
}

/// Evict silent members while leading
async fn sweep_loop(
    context: SharedContext,
    transport: Arc<dyn Transport>,
    config: ClusterConfig,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.sweep_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let outbound = {
            let mut context = context.lock().await;
            health::sweep_tick(&mut context, &config, Instant::now())
        };
        send_all(transport.as_ref(), outbound).await;
    }
}
