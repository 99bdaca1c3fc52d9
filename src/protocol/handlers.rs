//! Protocol Handlers
//!
//! One state transition per membership command. Each transition runs with
//! the context lock held and returns the sends it wants performed after the
//! lock is released. Transitions never block and never fail: anything that
//! does not apply to the node's current role is ignored.

use std::net::SocketAddr;
use std::time::Instant;

use super::message::{
    ElectionMessage, HealthAckMessage, HealthMessage, LeaderInfoMessage, NeighbourMessage,
    Outbound, Packet, StartAckMessage, StartMessage,
};
use crate::cluster::election;
use crate::state::{ring, NodeAddress, RemoteNode, SystemContext};

/// Admit `node` into the leader's ring.
///
/// Returns NEIGHBOUR updates for every member whose link changed, except
/// `node` itself, which learns its neighbour from the reply it is about to
/// get. Does nothing unless this node leads.
fn admit_member(context: &mut SystemContext, node: RemoteNode, now: Instant) -> Vec<Outbound> {
    let leader = context.local_address();
    let Some((members, state)) = context.ring_parts_mut() else {
        return Vec::new();
    };

    state.admit(node, now);
    let assignments = ring::insert(members, &mut state.links, node);
    tracing::info!("Node {} joined the ring ({} members)", node, members.len());

    assignments
        .into_iter()
        .filter(|a| a.node != node)
        .map(|a| {
            Outbound::unicast(
                a.node,
                Packet::Neighbour(NeighbourMessage {
                    leader,
                    neighbour: a.neighbour,
                }),
            )
        })
        .collect()
}

/// The leader's record of `node`'s neighbour and the current members
fn ring_view(context: &SystemContext, node: &RemoteNode) -> (Option<RemoteNode>, Vec<RemoteNode>) {
    let neighbour = context
        .leader_context()
        .and_then(|state| state.links.get(node).copied());
    (neighbour, context.nodes().to_vec())
}

/// START: admit the sender (leader only)
pub fn on_start(
    context: &mut SystemContext,
    sender: SocketAddr,
    message: StartMessage,
    now: Instant,
) -> Vec<Outbound> {
    if !context.is_leader() {
        return Vec::new();
    }

    let joining = NodeAddress::new(sender.ip(), message.listen_port);
    if context.is_self(&joining) {
        return Vec::new();
    }

    let known = context.nodes().contains(&joining);
    let mut outbound = if known {
        tracing::debug!("Repeated START from {}", joining);
        Vec::new()
    } else {
        admit_member(context, joining, now)
    };

    let (neighbour, members) = ring_view(context, &joining);
    outbound.insert(
        0,
        Outbound::unicast(
            joining,
            Packet::StartAck(StartAckMessage {
                leader: context.local_address(),
                neighbour,
                members,
            }),
        ),
    );
    outbound
}

/// START_ACK: follow the leader that admitted us
pub fn on_start_ack(
    context: &mut SystemContext,
    sender: SocketAddr,
    message: StartAckMessage,
    now: Instant,
) -> Vec<Outbound> {
    if context.is_leader() {
        tracing::warn!(
            "Leader {} received START_ACK from {}: another leader is active",
            context.local_address(),
            sender
        );
        return Vec::new();
    }

    context.adopt_leader(message.leader, now);
    context.replace_members(&message.members);
    context.set_neighbour(message.neighbour);
    tracing::debug!(
        "Admitted by {} with neighbour {:?}",
        message.leader,
        context.neighbour()
    );
    Vec::new()
}

/// HEALTH: record a heartbeat and answer with the ring view (leader only)
pub fn on_health(
    context: &mut SystemContext,
    _sender: SocketAddr,
    message: HealthMessage,
    now: Instant,
) -> Vec<Outbound> {
    let node = message.node;
    if context.is_self(&node) {
        return Vec::new();
    }

    let Some(state) = context.leader_context_mut() else {
        return Vec::new();
    };
    if state.record_heartbeat(node, now) {
        tracing::debug!("First heartbeat from {}", node);
    }

    let mut outbound = if context.nodes().contains(&node) {
        Vec::new()
    } else {
        admit_member(context, node, now)
    };

    let (neighbour, members) = ring_view(context, &node);
    outbound.insert(
        0,
        Outbound::unicast(
            node,
            Packet::HealthAck(HealthAckMessage {
                leader: context.local_address(),
                neighbour,
                members,
            }),
        ),
    );
    outbound
}

/// HEALTH_ACK: refresh the leader's view (from the current leader only)
pub fn on_health_ack(
    context: &mut SystemContext,
    _sender: SocketAddr,
    message: HealthAckMessage,
    now: Instant,
) -> Vec<Outbound> {
    if context.is_leader() || context.leader() != Some(message.leader) {
        tracing::debug!("Ignoring HEALTH_ACK from non-leader {}", message.leader);
        return Vec::new();
    }

    context.touch_leader(now);
    context.replace_members(&message.members);
    context.set_neighbour(message.neighbour);
    Vec::new()
}

/// ELECTION: relay, win or adopt
pub fn on_election(
    context: &mut SystemContext,
    _sender: SocketAddr,
    message: ElectionMessage,
    now: Instant,
) -> Vec<Outbound> {
    election::on_message(context, message, now)
}

/// LEADER_INFO: adopt the announced leader, last announcement wins
pub fn on_leader_info(
    context: &mut SystemContext,
    _sender: SocketAddr,
    message: LeaderInfoMessage,
    now: Instant,
) -> Vec<Outbound> {
    if message.leader.node_id() != message.leader_id {
        tracing::warn!("LEADER_INFO id mismatch for {}", message.leader);
    }
    if context.adopt_leader(message.leader, now) {
        tracing::info!("Leader announced: {}", message.leader);
    }
    Vec::new()
}

/// NEIGHBOUR: apply the leader's assignment (from the current leader only)
pub fn on_neighbour(
    context: &mut SystemContext,
    _sender: SocketAddr,
    message: NeighbourMessage,
    now: Instant,
) -> Vec<Outbound> {
    if context.is_leader() || context.leader() != Some(message.leader) {
        tracing::debug!("Ignoring NEIGHBOUR from non-leader {}", message.leader);
        return Vec::new();
    }

    context.touch_leader(now);
    if context.neighbour() != message.neighbour {
        tracing::debug!("Neighbour changed to {:?}", message.neighbour);
    }
    context.set_neighbour(message.neighbour);
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::NodeAddress;

    fn addr(port: u16) -> NodeAddress {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn leader() -> SystemContext {
        let mut context = SystemContext::new(addr(4711));
        context.act_as_leader();
        context
    }

    fn start(context: &mut SystemContext, port: u16, now: Instant) -> Vec<Outbound> {
        on_start(
            context,
            addr(port).socket_addr(),
            StartMessage { listen_port: port },
            now,
        )
    }

    fn start_ack(outbound: &[Outbound]) -> StartAckMessage {
        match outbound[0].packet() {
            Packet::StartAck(ack) => ack.clone(),
            other => panic!("expected START_ACK, got {:?}", other),
        }
    }

    #[test]
    fn test_first_member_gets_no_neighbour() {
        let mut context = leader();
        let outbound = start(&mut context, 5000, Instant::now());

        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].destination(), Some(addr(5000)));
        let ack = start_ack(&outbound);
        assert_eq!(ack.leader, addr(4711));
        assert_eq!(ack.neighbour, None);
        assert_eq!(ack.members, vec![addr(5000)]);
    }

    #[test]
    fn test_second_member_pairs_with_first() {
        let mut context = leader();
        let now = Instant::now();
        start(&mut context, 5000, now);
        let outbound = start(&mut context, 6000, now);

        assert_eq!(start_ack(&outbound).neighbour, Some(addr(5000)));
        assert!(outbound.contains(&Outbound::unicast(
            addr(5000),
            Packet::Neighbour(NeighbourMessage {
                leader: addr(4711),
                neighbour: Some(addr(6000)),
            })
        )));
    }

    #[test]
    fn test_repeated_start_resends_assignment() {
        let mut context = leader();
        let now = Instant::now();
        start(&mut context, 5000, now);
        start(&mut context, 6000, now);

        let outbound = start(&mut context, 6000, now);
        assert_eq!(outbound.len(), 1);
        assert_eq!(start_ack(&outbound).neighbour, Some(addr(5000)));
        assert_eq!(context.nodes(), &[addr(5000), addr(6000)]);
    }

    #[test]
    fn test_start_ignored_by_non_leader_and_own_echo() {
        let mut follower = SystemContext::new(addr(5000));
        assert!(start(&mut follower, 6000, Instant::now()).is_empty());

        let mut context = leader();
        assert!(start(&mut context, 4711, Instant::now()).is_empty());
        assert!(context.nodes().is_empty());
    }

    #[test]
    fn test_start_ack_sets_leader_and_neighbour() {
        let mut context = SystemContext::new(addr(6000));
        let ack = StartAckMessage {
            leader: addr(4711),
            neighbour: Some(addr(5000)),
            members: vec![addr(5000), addr(6000)],
        };
        on_start_ack(&mut context, addr(4711).socket_addr(), ack, Instant::now());

        assert_eq!(context.leader(), Some(addr(4711)));
        assert_eq!(context.neighbour(), Some(addr(5000)));
        assert_eq!(context.nodes(), &[addr(4711), addr(5000)]);
        assert!(context.is_consistent());
    }

    #[test]
    fn test_start_ack_ignored_by_leader() {
        let mut context = leader();
        let ack = StartAckMessage {
            leader: addr(9000),
            neighbour: None,
            members: vec![],
        };
        on_start_ack(&mut context, addr(9000).socket_addr(), ack, Instant::now());
        assert!(context.is_leader());
    }

    #[test]
    fn test_health_refreshes_liveness_and_admits_unknown() {
        let mut context = leader();
        let now = Instant::now();
        start(&mut context, 5000, now);

        let outbound = on_health(
            &mut context,
            addr(6000).socket_addr(),
            HealthMessage { node: addr(6000) },
            now,
        );
        assert!(context.leader_context().unwrap().alive_nodes.contains_key(&addr(6000)));
        assert_eq!(context.nodes(), &[addr(5000), addr(6000)]);

        match outbound[0].packet() {
            Packet::HealthAck(ack) => assert_eq!(ack.neighbour, Some(addr(5000))),
            other => panic!("expected HEALTH_ACK, got {:?}", other),
        }
        assert_eq!(outbound.len(), 2);
    }

    #[test]
    fn test_health_ack_only_from_current_leader() {
        let mut context = SystemContext::new(addr(5000));
        let now = Instant::now();
        context.adopt_leader(addr(4711), now);

        let stale = HealthAckMessage {
            leader: addr(9999),
            neighbour: Some(addr(6000)),
            members: vec![addr(5000), addr(6000)],
        };
        on_health_ack(&mut context, addr(9999).socket_addr(), stale, now);
        assert_eq!(context.neighbour(), None);

        let current = HealthAckMessage {
            leader: addr(4711),
            neighbour: Some(addr(6000)),
            members: vec![addr(5000), addr(6000)],
        };
        on_health_ack(&mut context, addr(4711).socket_addr(), current, now);
        assert_eq!(context.neighbour(), Some(addr(6000)));
        assert_eq!(context.nodes(), &[addr(4711), addr(6000)]);
    }

    #[test]
    fn test_leader_info_is_idempotent() {
        let mut context = SystemContext::new(addr(5000));
        let now = Instant::now();
        let info = LeaderInfoMessage {
            leader: addr(6000),
            leader_id: addr(6000).node_id(),
        };

        on_leader_info(&mut context, addr(6000).socket_addr(), info.clone(), now);
        let nodes = context.nodes().to_vec();
        on_leader_info(&mut context, addr(6000).socket_addr(), info, now);

        assert_eq!(context.leader(), Some(addr(6000)));
        assert_eq!(context.nodes(), nodes.as_slice());
        assert!(!context.is_leader());
    }

    #[test]
    fn test_leader_info_demotes_leader() {
        let mut context = leader();
        let info = LeaderInfoMessage {
            leader: addr(6000),
            leader_id: addr(6000).node_id(),
        };
        on_leader_info(&mut context, addr(6000).socket_addr(), info, Instant::now());

        assert!(!context.is_leader());
        assert!(context.leader_context().is_none());
        assert!(context.is_consistent());
    }

    #[test]
    fn test_neighbour_clear() {
        let mut context = SystemContext::new(addr(5000));
        let now = Instant::now();
        context.adopt_leader(addr(4711), now);
        context.set_neighbour(Some(addr(6000)));

        let clear = NeighbourMessage {
            leader: addr(4711),
            neighbour: None,
        };
        on_neighbour(&mut context, addr(4711).socket_addr(), clear, now);
        assert_eq!(context.neighbour(), None);
    }
}
