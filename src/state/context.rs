//! System Context
//!
//! The single piece of mutable per-node membership state. Every protocol
//! handler, timer tick and join step mutates it through [`SharedContext`],
//! holding the lock for the whole transition.

use std::sync::Arc;
use std::time::{Duration, Instant};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};

use super::identity::{Leader, NodeAddress, NodeId, RemoteNode};
use super::liveness::LeaderState;

/// An election started by this node
#[derive(Debug, Clone, Copy)]
pub struct ElectionRound {
    /// When the current round's token was sent
    pub started_at: Instant,
    /// Rounds started since the leader was lost
    pub attempts: u32,
    /// Random delay added to this round's timeout
    pub jitter: Duration,
    /// Where this round's token was sent
    pub hop: Option<RemoteNode>,
}

impl ElectionRound {
    /// True once the round has waited `timeout` plus its jitter
    pub fn timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.started_at) > timeout + self.jitter
    }
}

/// Per-node membership state
#[derive(Debug)]
pub struct SystemContext {
    node_id: NodeId,
    local_address: NodeAddress,
    listen_port: u16,
    leader: Option<Leader>,
    is_leader: bool,
    neighbour: Option<RemoteNode>,
    nodes: Vec<RemoteNode>,
    leader_context: Option<LeaderState>,
    joined: bool,
    last_leader_contact: Option<Instant>,
    election: Option<ElectionRound>,
}

impl SystemContext {
    /// Create the context for a node reachable at `local_address`
    pub fn new(local_address: NodeAddress) -> Self {
        Self {
            node_id: local_address.node_id(),
            local_address,
            listen_port: local_address.port(),
            leader: None,
            is_leader: false,
            neighbour: None,
            nodes: Vec::new(),
            leader_context: None,
            joined: false,
            last_leader_contact: None,
            election: None,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn local_address(&self) -> NodeAddress {
        self.local_address
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn leader(&self) -> Option<Leader> {
        self.leader
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    pub fn neighbour(&self) -> Option<RemoteNode> {
        self.neighbour
    }

    pub fn nodes(&self) -> &[RemoteNode] {
        &self.nodes
    }

    pub fn leader_context(&self) -> Option<&LeaderState> {
        self.leader_context.as_ref()
    }

    pub fn leader_context_mut(&mut self) -> Option<&mut LeaderState> {
        self.leader_context.as_mut()
    }

    pub fn joined(&self) -> bool {
        self.joined
    }

    pub fn mark_joined(&mut self) {
        self.joined = true;
    }

    pub fn election(&self) -> Option<ElectionRound> {
        self.election
    }

    /// True when `address` is this node
    pub fn is_self(&self, address: &NodeAddress) -> bool {
        *address == self.local_address
    }

    /// Become the leader with a fresh liveness table
    pub fn act_as_leader(&mut self) {
        if !self.is_leader {
            tracing::info!("Node {} is now LEADER", self.local_address);
        }
        self.leader = Some(self.local_address);
        self.is_leader = true;
        self.neighbour = None;
        self.election = None;
        self.last_leader_contact = None;
        if self.leader_context.is_none() {
            self.leader_context = Some(LeaderState::new());
        }
    }

    /// Follow `leader`, stepping down if this node was leading.
    ///
    /// A replaced leader is dropped from `nodes`. Returns true when the
    /// known leader changed.
    pub fn adopt_leader(&mut self, leader: Leader, now: Instant) -> bool {
        if self.is_self(&leader) {
            let changed = !self.is_leader;
            self.act_as_leader();
            return changed;
        }

        let previous = self.leader.replace(leader);
        let changed = previous != Some(leader);

        if let Some(old) = previous {
            if changed && !self.is_self(&old) {
                self.remove_node(&old);
            }
        }

        if self.is_leader {
            tracing::info!("Stepping down: {} is the leader now", leader);
        }
        self.is_leader = false;
        self.leader_context = None;
        self.election = None;
        self.add_node(leader);
        if self.neighbour == Some(leader) {
            self.neighbour = None;
        }
        self.last_leader_contact = Some(now);

        if changed {
            tracing::info!("Following leader {}", leader);
        }
        changed
    }

    /// Forget the leader while an election decides a new one.
    ///
    /// The suspected leader is dropped from `nodes` so it is never chosen
    /// as an election hop. Returns the attempt number of the new round.
    pub fn begin_election(&mut self, now: Instant, jitter: Duration) -> u32 {
        if let Some(old) = self.leader.take() {
            if !self.is_self(&old) {
                self.remove_node(&old);
            }
        }
        self.is_leader = false;
        self.leader_context = None;
        self.last_leader_contact = None;
        let attempts = self.election.map(|round| round.attempts).unwrap_or(0) + 1;
        self.election = Some(ElectionRound {
            started_at: now,
            attempts,
            jitter,
            hop: None,
        });
        attempts
    }

    /// Remember the hop the current round's token went to
    pub fn set_election_hop(&mut self, hop: RemoteNode) {
        if let Some(round) = self.election.as_mut() {
            round.hop = Some(hop);
        }
    }

    /// Record a sign of life from the leader
    pub fn touch_leader(&mut self, now: Instant) {
        self.last_leader_contact = Some(now);
    }

    /// Time since the leader was last heard from
    pub fn leader_silence(&self, now: Instant) -> Option<Duration> {
        self.last_leader_contact
            .map(|seen| now.saturating_duration_since(seen))
    }

    /// Remember a peer, preserving join order
    pub fn add_node(&mut self, node: RemoteNode) {
        if !self.is_self(&node) && !self.nodes.contains(&node) {
            self.nodes.push(node);
        }
    }

    /// Forget a peer and any neighbour link to it
    pub fn remove_node(&mut self, node: &RemoteNode) {
        self.nodes.retain(|n| n != node);
        if self.neighbour.as_ref() == Some(node) {
            self.neighbour = None;
        }
    }

    /// Set or clear the ring successor; a neighbour is always a known node
    pub fn set_neighbour(&mut self, neighbour: Option<RemoteNode>) {
        match neighbour {
            Some(node) if !self.is_self(&node) => {
                self.add_node(node);
                self.neighbour = Some(node);
            }
            _ => self.neighbour = None,
        }
    }

    /// Replace the membership view with the leader's ring members
    pub fn replace_members(&mut self, members: &[RemoteNode]) {
        let mut nodes = Vec::with_capacity(members.len() + 1);
        if let Some(leader) = self.leader.filter(|l| !self.is_self(l)) {
            nodes.push(leader);
        }
        for member in members {
            if !self.is_self(member) && !nodes.contains(member) {
                nodes.push(*member);
            }
        }
        self.nodes = nodes;

        if let Some(neighbour) = self.neighbour {
            if !self.nodes.contains(&neighbour) {
                self.neighbour = None;
            }
        }
    }

    /// Ring members as the leader sees them, in join order
    pub(crate) fn ring_parts_mut(&mut self) -> Option<(&mut Vec<RemoteNode>, &mut LeaderState)> {
        match self.leader_context.as_mut() {
            Some(state) if self.is_leader => Some((&mut self.nodes, state)),
            _ => None,
        }
    }

    /// Check the structural invariants of the context
    pub fn is_consistent(&self) -> bool {
        let leader_flag = self.is_leader == (self.leader == Some(self.local_address));
        let leader_state = self.is_leader || self.leader_context.is_none();
        let neighbour_known = self
            .neighbour
            .map(|n| self.nodes.contains(&n))
            .unwrap_or(true);
        let no_self = !self.nodes.contains(&self.local_address);
        leader_flag && leader_state && neighbour_known && no_self
    }

    /// Serializable view of the context
    pub fn snapshot(&self, now: Instant) -> ContextSnapshot {
        let alive = self.leader_context.as_ref().map(|state| {
            let mut entries: Vec<AliveEntry> = state
                .alive_nodes
                .iter()
                .map(|(node, seen)| AliveEntry {
                    node: *node,
                    last_heartbeat_ms: now.saturating_duration_since(*seen).as_millis() as u64,
                })
                .collect();
            entries.sort_by_key(|e| e.node);
            entries
        });

        let ring = self.leader_context.as_ref().map(|state| {
            self.nodes
                .iter()
                .map(|node| RingLink {
                    node: *node,
                    neighbour: state.links.get(node).copied(),
                })
                .collect()
        });

        ContextSnapshot {
            node_id: self.node_id,
            address: self.local_address,
            leader: self.leader,
            is_leader: self.is_leader,
            neighbour: self.neighbour,
            nodes: self.nodes.clone(),
            joined: self.joined,
            election_in_progress: self.election.is_some(),
            alive,
            ring,
        }
    }
}

/// Point-in-time view of a node's membership state
#[derive(Debug, Clone, Serialize)]
pub struct ContextSnapshot {
    pub node_id: NodeId,
    pub address: NodeAddress,
    pub leader: Option<Leader>,
    pub is_leader: bool,
    pub neighbour: Option<RemoteNode>,
    pub nodes: Vec<RemoteNode>,
    pub joined: bool,
    pub election_in_progress: bool,
    pub alive: Option<Vec<AliveEntry>>,
    pub ring: Option<Vec<RingLink>>,
}

/// Liveness table row
#[derive(Debug, Clone, Serialize)]
pub struct AliveEntry {
    pub node: RemoteNode,
    pub last_heartbeat_ms: u64,
}

/// Leader's record of one ring link
#[derive(Debug, Clone, Serialize)]
pub struct RingLink {
    pub node: RemoteNode,
    pub neighbour: Option<RemoteNode>,
}

/// Synchronized handle to the node's [`SystemContext`]
#[derive(Debug, Clone)]
pub struct SharedContext {
    inner: Arc<Mutex<SystemContext>>,
}

impl SharedContext {
    pub fn new(context: SystemContext) -> Self {
        Self {
            inner: Arc::new(Mutex::new(context)),
        }
    }

    /// Lock the context for a complete transition
    pub async fn lock(&self) -> MutexGuard<'_, SystemContext> {
        self.inner.lock().await
    }

    pub async fn leader(&self) -> Option<Leader> {
        self.inner.lock().await.leader()
    }

    pub async fn is_leader(&self) -> bool {
        self.inner.lock().await.is_leader()
    }

    pub async fn neighbour(&self) -> Option<RemoteNode> {
        self.inner.lock().await.neighbour()
    }

    pub async fn nodes(&self) -> Vec<RemoteNode> {
        self.inner.lock().await.nodes().to_vec()
    }

    /// Nodes in the liveness table (empty unless leader)
    pub async fn alive_nodes(&self) -> Vec<RemoteNode> {
        let context = self.inner.lock().await;
        context
            .leader_context()
            .map(|state| state.alive_nodes.keys().copied().collect())
            .unwrap_or_default()
    }

    pub async fn snapshot(&self) -> ContextSnapshot {
        self.inner.lock().await.snapshot(Instant::now())
    }
}
