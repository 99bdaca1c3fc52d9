//! Join Protocol
//!
//! Broadcast START a bounded number of times and wait for a leader to
//! answer. Nobody answering means there is no cluster yet, and the node
//! leads a cluster of its own.

use tokio_util::sync::CancellationToken;

use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::network::{send_all, Transport};
use crate::protocol::{Outbound, Packet, StartMessage};
use crate::state::{Leader, SharedContext};

/// How a join ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// A leader answered
    Discovered(Leader),
    /// No leader answered; this node leads
    SelfPromoted,
}

/// Run the join protocol.
///
/// Sends at most `join_attempts` START broadcasts, `join_interval` apart,
/// and only promotes itself after the last wait. Marks the context joined.
pub async fn join(
    context: &SharedContext,
    transport: &dyn Transport,
    config: &ClusterConfig,
    cancel: &CancellationToken,
) -> Result<JoinOutcome> {
    let start = Packet::Start(StartMessage {
        listen_port: context.lock().await.listen_port(),
    });

    for attempt in 1..=config.join_attempts {
        if let Some(leader) = context.leader().await {
            return finish(context, JoinOutcome::Discovered(leader)).await;
        }

        tracing::debug!("Broadcasting START ({}/{})", attempt, config.join_attempts);
        send_all(transport, vec![Outbound::broadcast(start.clone())]).await;

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(config.join_interval()) => {}
        }
    }

    let outcome = {
        let mut context = context.lock().await;
        match context.leader() {
            Some(leader) => JoinOutcome::Discovered(leader),
            None => {
                tracing::info!(
                    "No leader answered {} START broadcasts, promoting self",
                    config.join_attempts
                );
                context.act_as_leader();
                JoinOutcome::SelfPromoted
            }
        }
    };
    finish(context, outcome).await
}

async fn finish(context: &SharedContext, outcome: JoinOutcome) -> Result<JoinOutcome> {
    context.lock().await.mark_joined();
    if let JoinOutcome::Discovered(leader) = outcome {
        tracing::info!("Joined cluster led by {}", leader);
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MemoryNetwork;
    use crate::state::{NodeAddress, SystemContext};
    use std::time::{Duration, Instant};

    fn addr(port: u16) -> NodeAddress {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn config() -> ClusterConfig {
        ClusterConfig {
            join_attempts: 5,
            join_interval_ms: 20,
            ..ClusterConfig::default()
        }
    }

    #[tokio::test]
    async fn test_self_promotion_after_all_attempts() {
        let network = MemoryNetwork::new();
        let transport = network.endpoint(addr(4711)).await.unwrap();
        let context = SharedContext::new(SystemContext::new(addr(4711)));

        let outcome = join(&context, &transport, &config(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, JoinOutcome::SelfPromoted);
        assert_eq!(transport.broadcast_count(), 5);
        assert!(context.is_leader().await);
        assert!(context.lock().await.joined());
    }

    #[tokio::test]
    async fn test_known_leader_ends_join_early() {
        let network = MemoryNetwork::new();
        let transport = network.endpoint(addr(5000)).await.unwrap();
        let context = SharedContext::new(SystemContext::new(addr(5000)));
        context.lock().await.adopt_leader(addr(4711), Instant::now());

        let outcome = join(&context, &transport, &config(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, JoinOutcome::Discovered(addr(4711)));
        assert_eq!(transport.broadcast_count(), 0);
    }

    #[tokio::test]
    async fn test_join_is_cancellable() {
        let network = MemoryNetwork::new();
        let transport = network.endpoint(addr(5000)).await.unwrap();
        let context = SharedContext::new(SystemContext::new(addr(5000)));
        let cancel = CancellationToken::new();

        let slow = ClusterConfig {
            join_interval_ms: 10_000,
            ..config()
        };
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = join(&context, &transport, &slow, &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(!context.is_leader().await);
    }
}
