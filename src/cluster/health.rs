//! Health Monitor
//!
//! Timer-driven transitions. Followers send HEALTH to the leader and start
//! an election when it goes quiet; the leader sweeps its liveness table and
//! evicts members that stopped sending heartbeats.

use rand::Rng;
use std::time::{Duration, Instant};

use super::election;
use crate::config::ClusterConfig;
use crate::protocol::{HealthMessage, NeighbourMessage, Outbound, Packet};
use crate::state::{ring, Assignment, NodeAddress, SystemContext};

/// Random election jitter in `0..=max`
pub fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Heartbeat timer tick for a non-leader.
///
/// `jitter` is only used if this tick starts an election round.
pub fn heartbeat_tick(
    context: &mut SystemContext,
    config: &ClusterConfig,
    now: Instant,
    jitter: Duration,
) -> Vec<Outbound> {
    if !context.joined() || context.is_leader() {
        return Vec::new();
    }

    if let Some(round) = context.election() {
        if round.timed_out(now, config.election_timeout()) {
            // The token was lost at or after this hop; route around it
            if let Some(hop) = round.hop {
                tracing::warn!(
                    "Election round {} via {} timed out, retrying without it",
                    round.attempts,
                    hop
                );
                context.remove_node(&hop);
            } else {
                tracing::warn!("Election round {} timed out, retrying", round.attempts);
            }
            return election::start(context, now, jitter);
        }
        return Vec::new();
    }

    let Some(leader) = context.leader() else {
        return election::start(context, now, jitter);
    };

    match context.leader_silence(now) {
        Some(silence) if silence > config.leader_timeout() => {
            tracing::warn!(
                "Leader {} silent for {}ms, starting election",
                leader,
                silence.as_millis()
            );
            election::start(context, now, jitter)
        }
        Some(_) => vec![Outbound::unicast(
            leader,
            Packet::Health(HealthMessage {
                node: context.local_address(),
            }),
        )],
        None => {
            context.touch_leader(now);
            Vec::new()
        }
    }
}

/// Liveness sweep tick for the leader.
///
/// Closes gaps left by the previous sweep's evictions first, then evicts
/// every member whose last sign of life is older than the liveness timeout.
pub fn sweep_tick(context: &mut SystemContext, config: &ClusterConfig, now: Instant) -> Vec<Outbound> {
    let leader = context.local_address();
    let Some((members, state)) = context.ring_parts_mut() else {
        return Vec::new();
    };

    let mut changes: Vec<Assignment> = Vec::new();
    if state.repair_pending {
        changes.extend(ring::repair(members, &mut state.links));
        state.repair_pending = false;
    }

    for node in state.expired(members, now, config.liveness_timeout()) {
        let age = state
            .heartbeat_age(&node, now)
            .map(|age| format!("{}ms", age.as_millis()))
            .unwrap_or_else(|| "never".to_string());
        tracing::info!("Evicting {} (last heartbeat: {})", node, age);

        state.forget(&node);
        changes.extend(ring::remove(members, &mut state.links, &node));
        state.repair_pending = true;
    }

    changes
        .into_iter()
        .filter(|a| members.contains(&a.node))
        .map(|a| neighbour_update(leader, a))
        .collect()
}

fn neighbour_update(leader: NodeAddress, assignment: Assignment) -> Outbound {
    Outbound::unicast(
        assignment.node,
        Packet::Neighbour(NeighbourMessage {
            leader,
            neighbour: assignment.neighbour,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::handlers::on_start;
    use crate::protocol::StartMessage;

    fn addr(port: u16) -> NodeAddress {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn config() -> ClusterConfig {
        ClusterConfig {
            heartbeat_interval_ms: 100,
            leader_timeout_ms: 300,
            liveness_timeout_ms: 500,
            election_timeout_ms: 400,
            ..ClusterConfig::default()
        }
    }

    fn leader_with(ports: &[u16], now: Instant) -> SystemContext {
        let mut context = SystemContext::new(addr(4711));
        context.act_as_leader();
        for port in ports {
            on_start(
                &mut context,
                addr(*port).socket_addr(),
                StartMessage { listen_port: *port },
                now,
            );
        }
        context
    }

    fn follower(now: Instant) -> SystemContext {
        let mut context = SystemContext::new(addr(5000));
        context.adopt_leader(addr(4711), now);
        context.set_neighbour(Some(addr(6000)));
        context.mark_joined();
        context
    }

    #[test]
    fn test_follower_sends_health_to_leader() {
        let now = Instant::now();
        let mut context = follower(now);

        let outbound = heartbeat_tick(&mut context, &config(), now + Duration::from_millis(100), Duration::ZERO);
        assert_eq!(
            outbound,
            vec![Outbound::unicast(
                addr(4711),
                Packet::Health(HealthMessage { node: addr(5000) })
            )]
        );
    }

    #[test]
    fn test_no_heartbeat_before_join_or_as_leader() {
        let now = Instant::now();
        let mut context = SystemContext::new(addr(5000));
        context.adopt_leader(addr(4711), now);
        assert!(heartbeat_tick(&mut context, &config(), now, Duration::ZERO).is_empty());

        let mut context = leader_with(&[], now);
        context.mark_joined();
        assert!(heartbeat_tick(&mut context, &config(), now, Duration::ZERO).is_empty());
    }

    #[test]
    fn test_silent_leader_triggers_election() {
        let now = Instant::now();
        let mut context = follower(now);
        context.add_node(addr(7000));

        let later = now + Duration::from_millis(301);
        let outbound = heartbeat_tick(&mut context, &config(), later, Duration::ZERO);
        assert!(matches!(outbound[0].packet(), Packet::Election(_)));
        assert_eq!(outbound[0].destination(), Some(addr(6000)));
        assert!(context.election().is_some());

        // Round in flight: nothing until it times out
        let soon = later + Duration::from_millis(100);
        assert!(heartbeat_tick(&mut context, &config(), soon, Duration::ZERO).is_empty());

        // The retry routes around the neighbour that swallowed the token
        let retry = later + Duration::from_millis(401);
        let outbound = heartbeat_tick(&mut context, &config(), retry, Duration::ZERO);
        assert!(matches!(outbound[0].packet(), Packet::Election(_)));
        assert_eq!(outbound[0].destination(), Some(addr(7000)));
        assert_eq!(context.election().unwrap().attempts, 2);
        assert!(!context.nodes().contains(&addr(6000)));
        assert!(context.neighbour().is_none());
    }

    #[test]
    fn test_retries_exhaust_dead_hops_then_self_promote() {
        let now = Instant::now();
        let mut context = follower(now);

        let later = now + Duration::from_millis(301);
        heartbeat_tick(&mut context, &config(), later, Duration::ZERO);
        assert_eq!(context.election().unwrap().hop, Some(addr(6000)));

        // Nobody else is left to carry the token
        let retry = later + Duration::from_millis(401);
        heartbeat_tick(&mut context, &config(), retry, Duration::ZERO);
        assert!(context.is_leader());
        assert!(context.nodes().is_empty());
    }

    #[test]
    fn test_sweep_never_evicts_early() {
        let now = Instant::now();
        let mut context = leader_with(&[5000, 6000], now);

        let outbound = sweep_tick(&mut context, &config(), now + Duration::from_millis(500));
        assert!(outbound.is_empty());
        assert_eq!(context.nodes().len(), 2);
    }

    #[test]
    fn test_sweep_evicts_then_repairs() {
        let now = Instant::now();
        let mut context = leader_with(&[5000, 6000, 7000], now);
        let state = context.leader_context_mut().unwrap();
        let later = now + Duration::from_millis(400);
        state.record_heartbeat(addr(5000), later);
        state.record_heartbeat(addr(7000), later);

        // 6000 never sent a heartbeat; its admission time expires
        let evicted_at = now + Duration::from_millis(501);
        let outbound = sweep_tick(&mut context, &config(), evicted_at);
        assert_eq!(context.nodes(), &[addr(5000), addr(7000)]);
        assert_eq!(
            outbound,
            vec![Outbound::unicast(
                addr(5000),
                Packet::Neighbour(NeighbourMessage { leader: addr(4711), neighbour: None })
            )]
        );
        assert!(context.leader_context().unwrap().repair_pending);

        let outbound = sweep_tick(&mut context, &config(), evicted_at + Duration::from_millis(100));
        assert_eq!(
            outbound,
            vec![Outbound::unicast(
                addr(5000),
                Packet::Neighbour(NeighbourMessage { leader: addr(4711), neighbour: Some(addr(7000)) })
            )]
        );
        assert!(!context.leader_context().unwrap().repair_pending);
    }

    #[test]
    fn test_jitter_bounds() {
        assert_eq!(random_jitter(Duration::ZERO), Duration::ZERO);
        for _ in 0..20 {
            assert!(random_jitter(Duration::from_millis(50)) <= Duration::from_millis(50));
        }
    }
}
