//! Ring Election
//!
//! Chang-Roberts over the neighbour ring. A token carries the largest
//! [`NodeId`](crate::state::NodeId) seen so far; the node whose own id
//! comes back to it has the largest id on the ring and becomes leader.
//! The winner then sends an announcement (`full_circle`) around the ring
//! and LEADER_INFO to everyone it knows.

use std::time::{Duration, Instant};

use crate::protocol::{ElectionMessage, LeaderInfoMessage, NeighbourMessage, Outbound, Packet};
use crate::state::{ring, RemoteNode, SystemContext};

/// Next hop for an election message.
///
/// The ring neighbour when one is assigned. Otherwise the known node with
/// the next larger address, wrapping around, never the current (suspected)
/// leader.
pub fn next_hop(context: &SystemContext) -> Option<RemoteNode> {
    if let Some(neighbour) = context.neighbour() {
        return Some(neighbour);
    }

    let local = context.local_address();
    let mut candidates: Vec<RemoteNode> = context
        .nodes()
        .iter()
        .copied()
        .filter(|node| Some(*node) != context.leader() && *node != local)
        .collect();
    candidates.sort();

    candidates
        .iter()
        .find(|node| **node > local)
        .or_else(|| candidates.first())
        .copied()
}

/// Start a new election round.
///
/// Forgets the leader and sends this node's token to the next hop. A node
/// with nobody to send to wins immediately.
pub fn start(context: &mut SystemContext, now: Instant, jitter: Duration) -> Vec<Outbound> {
    let attempt = context.begin_election(now, jitter);
    let own = token(context, false);

    match next_hop(context) {
        Some(hop) => {
            context.set_election_hop(hop);
            tracing::info!(
                "Starting election (attempt {}) as {}, token to {}",
                attempt,
                own.candidate,
                hop
            );
            vec![Outbound::unicast(hop, Packet::Election(own))]
        }
        None => {
            tracing::info!("No peers reachable for election, promoting self");
            win(context, now)
        }
    }
}

/// Apply a received ELECTION message
pub fn on_message(context: &mut SystemContext, message: ElectionMessage, now: Instant) -> Vec<Outbound> {
    if message.full_circle {
        return on_announcement(context, message, now);
    }

    let own = context.node_id();
    if message.candidate == own {
        if context.is_leader() {
            tracing::debug!("Dropping duplicate election token");
            return Vec::new();
        }
        return win(context, now);
    }

    // The named candidate already leads; the token is a late copy
    if context.leader() == Some(message.candidate_address) {
        tracing::debug!("Dropping stale token for current leader {}", message.candidate_address);
        return Vec::new();
    }

    // A candidate still electing while this node leads gets told who won
    if context.is_leader() {
        tracing::debug!("Answering election token from {} with leader info", message.candidate_address);
        return vec![Outbound::unicast(
            message.candidate_address,
            Packet::LeaderInfo(LeaderInfoMessage {
                leader: context.local_address(),
                leader_id: own,
            }),
        )];
    }

    let forward = if message.candidate > own {
        message
    } else {
        tracing::debug!("Replacing candidate {} with own id {}", message.candidate, own);
        token(context, false)
    };

    match next_hop(context) {
        Some(hop) => vec![Outbound::unicast(hop, Packet::Election(forward))],
        None => {
            tracing::warn!("No neighbour to relay election token to");
            Vec::new()
        }
    }
}

/// Adopt an announced winner and pass the announcement on
fn on_announcement(context: &mut SystemContext, message: ElectionMessage, now: Instant) -> Vec<Outbound> {
    let winner = message.candidate_address;
    if context.leader() == Some(winner) {
        return Vec::new();
    }

    context.adopt_leader(winner, now);
    tracing::info!("Election won by {}", winner);

    match context.neighbour() {
        Some(hop) if hop != winner => vec![Outbound::unicast(hop, Packet::Election(message))],
        _ => Vec::new(),
    }
}

/// Take over as leader after winning.
///
/// Rebuilds the ring over the known members (the old leader excluded),
/// announces the new leader and closes the ring links.
fn win(context: &mut SystemContext, now: Instant) -> Vec<Outbound> {
    let former_neighbour = context.neighbour();
    if let Some(old) = context.leader().filter(|l| !context.is_self(l)) {
        context.remove_node(&old);
    }
    context.act_as_leader();

    let local = context.local_address();
    let leader_id = context.node_id();
    let announcement = token(context, true);
    let Some((members, state)) = context.ring_parts_mut() else {
        return Vec::new();
    };

    for member in members.iter() {
        state.admit(*member, now);
    }
    let assignments = ring::repair(members, &mut state.links);
    state.repair_pending = false;

    tracing::info!("Won election, leading {} members", members.len());

    let info = Packet::LeaderInfo(LeaderInfoMessage {
        leader: local,
        leader_id,
    });
    let mut outbound: Vec<Outbound> = members
        .iter()
        .map(|member| Outbound::unicast(*member, info.clone()))
        .collect();
    outbound.push(Outbound::broadcast(info));

    outbound.extend(assignments.into_iter().map(|a| {
        Outbound::unicast(
            a.node,
            Packet::Neighbour(NeighbourMessage {
                leader: local,
                neighbour: a.neighbour,
            }),
        )
    }));

    if let Some(hop) = former_neighbour {
        outbound.push(Outbound::unicast(hop, Packet::Election(announcement)));
    }
    outbound
}

fn token(context: &SystemContext, full_circle: bool) -> ElectionMessage {
    ElectionMessage {
        candidate: context.node_id(),
        candidate_address: context.local_address(),
        full_circle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::NodeAddress;

    fn addr(port: u16) -> NodeAddress {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    /// A follower of 4711 with the given ring neighbour
    fn follower(port: u16, neighbour: Option<u16>, others: &[u16]) -> SystemContext {
        let mut context = SystemContext::new(addr(port));
        context.adopt_leader(addr(4711), Instant::now());
        for other in others {
            context.add_node(addr(*other));
        }
        context.set_neighbour(neighbour.map(addr));
        context
    }

    fn election_out(outbound: &[Outbound]) -> Vec<(NodeAddress, ElectionMessage)> {
        outbound
            .iter()
            .filter_map(|o| match (o.destination(), o.packet()) {
                (Some(to), Packet::Election(m)) => Some((to, m.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_start_sends_own_token_to_neighbour() {
        let mut context = follower(5000, Some(6000), &[]);
        let outbound = start(&mut context, Instant::now(), Duration::ZERO);

        let tokens = election_out(&outbound);
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].0, addr(6000));
        assert_eq!(tokens[0].1.candidate, addr(5000).node_id());
        assert!(context.leader().is_none());
        assert!(!context.nodes().contains(&addr(4711)));
    }

    #[test]
    fn test_start_without_peers_self_promotes() {
        let mut context = follower(5000, None, &[]);
        start(&mut context, Instant::now(), Duration::ZERO);

        assert!(context.is_leader());
        assert!(context.election().is_none());
    }

    #[test]
    fn test_fallback_hop_wraps_and_skips_leader() {
        let context = follower(7000, None, &[5000, 6000]);
        assert_eq!(next_hop(&context), Some(addr(5000)));

        let context = follower(5500, None, &[5000, 6000]);
        assert_eq!(next_hop(&context), Some(addr(6000)));
    }

    #[test]
    fn test_relay_forwards_larger_and_replaces_smaller() {
        let now = Instant::now();
        let mut context = follower(6000, Some(7000), &[]);

        let larger = ElectionMessage {
            candidate: addr(8000).node_id(),
            candidate_address: addr(8000),
            full_circle: false,
        };
        let forwarded = election_out(&on_message(&mut context, larger.clone(), now));
        assert_eq!(forwarded, vec![(addr(7000), larger)]);

        let smaller = ElectionMessage {
            candidate: addr(5000).node_id(),
            candidate_address: addr(5000),
            full_circle: false,
        };
        let replaced = election_out(&on_message(&mut context, smaller, now));
        assert_eq!(replaced[0].1.candidate, addr(6000).node_id());
        assert_eq!(replaced[0].1.candidate_address, addr(6000));
    }

    #[test]
    fn test_own_token_wins_and_announces() {
        let now = Instant::now();
        let mut context = follower(6000, Some(5000), &[7000]);
        start(&mut context, now, Duration::ZERO);

        let own = token(&context, false);
        let outbound = on_message(&mut context, own.clone(), now);
        assert!(context.is_leader());
        assert!(context.is_consistent());

        assert!(outbound
            .iter()
            .any(|o| matches!(o, Outbound::Broadcast { packet: Packet::LeaderInfo(_) })));
        let infos = outbound
            .iter()
            .filter(|o| o.destination().is_some() && matches!(o.packet(), Packet::LeaderInfo(_)))
            .count();
        assert_eq!(infos, 2);

        let announcements = election_out(&outbound);
        assert_eq!(announcements.len(), 1);
        assert_eq!(announcements[0].0, addr(5000));
        assert!(announcements[0].1.full_circle);

        // 5000 and 7000 are linked to each other
        let links = &context.leader_context().unwrap().links;
        assert_eq!(links.get(&addr(5000)), Some(&addr(7000)));
        assert_eq!(links.get(&addr(7000)), Some(&addr(5000)));

        // Second copy of the same token is dropped
        assert!(on_message(&mut context, own, now).is_empty());
    }

    #[test]
    fn test_announcement_adopts_and_stops_at_known_leader() {
        let now = Instant::now();
        let mut context = follower(5000, Some(7000), &[]);
        let announcement = ElectionMessage {
            candidate: addr(6000).node_id(),
            candidate_address: addr(6000),
            full_circle: true,
        };

        let outbound = election_out(&on_message(&mut context, announcement.clone(), now));
        assert_eq!(context.leader(), Some(addr(6000)));
        assert_eq!(outbound, vec![(addr(7000), announcement.clone())]);

        assert!(on_message(&mut context, announcement, now).is_empty());
    }

    #[test]
    fn test_stale_token_for_current_leader_dies_on_first_hop() {
        let now = Instant::now();
        // Ring 5000 -> 6000 -> 7000 -> 5000 following 8000
        let mut ring: Vec<SystemContext> = [(5000, 6000), (6000, 7000), (7000, 5000)]
            .iter()
            .map(|(port, next)| {
                let mut context = SystemContext::new(addr(*port));
                context.adopt_leader(addr(8000), now);
                context.set_neighbour(Some(addr(*next)));
                context
            })
            .collect();

        let stale = ElectionMessage {
            candidate: addr(8000).node_id(),
            candidate_address: addr(8000),
            full_circle: false,
        };

        // Deliver every copy around the ring; none may survive a hop
        let mut in_flight = vec![(addr(5000), stale.clone()), (addr(6000), stale)];
        let mut hops = 0;
        while let Some((to, message)) = in_flight.pop() {
            hops += 1;
            assert!(hops < 10, "election token kept circulating");
            let context = ring.iter_mut().find(|c| c.local_address() == to).unwrap();
            in_flight.extend(election_out(&on_message(context, message, now)));
        }

        assert_eq!(hops, 2);
        for context in &ring {
            assert_eq!(context.leader(), Some(addr(8000)));
            assert!(context.election().is_none());
        }
    }

    #[test]
    fn test_leader_answers_late_token_with_leader_info() {
        let now = Instant::now();
        let mut context = SystemContext::new(addr(6000));
        context.act_as_leader();
        context.add_node(addr(5000));

        let late = ElectionMessage {
            candidate: addr(5000).node_id(),
            candidate_address: addr(5000),
            full_circle: false,
        };
        let outbound = on_message(&mut context, late, now);
        assert_eq!(
            outbound,
            vec![Outbound::unicast(
                addr(5000),
                Packet::LeaderInfo(LeaderInfoMessage {
                    leader: addr(6000),
                    leader_id: addr(6000).node_id(),
                })
            )]
        );
        assert!(context.is_leader());
    }

    #[test]
    fn test_start_records_hop() {
        let mut context = follower(7000, None, &[5000, 6000]);
        start(&mut context, Instant::now(), Duration::ZERO);
        assert_eq!(context.election().unwrap().hop, Some(addr(5000)));
    }

    #[test]
    fn test_two_node_ring_elects_larger_id() {
        let now = Instant::now();
        let mut low = follower(5000, Some(6000), &[]);
        let mut high = follower(6000, Some(5000), &[]);

        // Both detect the failure at once
        let from_low = election_out(&start(&mut low, now, Duration::ZERO));
        let from_high = election_out(&start(&mut high, now, Duration::ZERO));

        // high replaces low's token with its own; low forwards high's
        let relayed_by_high = election_out(&on_message(&mut high, from_low[0].1.clone(), now));
        let relayed_by_low = election_out(&on_message(&mut low, from_high[0].1.clone(), now));
        assert_eq!(relayed_by_low[0].1.candidate, addr(6000).node_id());

        on_message(&mut high, relayed_by_low[0].1.clone(), now);
        assert!(high.is_leader());

        // The replaced token arrives at low, circles back to high and dies there
        let again = election_out(&on_message(&mut low, relayed_by_high[0].1.clone(), now));
        assert!(on_message(&mut high, again[0].1.clone(), now).is_empty());

        let info = LeaderInfoMessage {
            leader: addr(6000),
            leader_id: addr(6000).node_id(),
        };
        low.adopt_leader(info.leader, now);
        assert_eq!(low.leader(), Some(addr(6000)));
        assert!(!low.is_leader());
    }
}
