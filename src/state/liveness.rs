//! Leader Liveness Tracking
//!
//! Held only by the leader: the heartbeat table, admission times and the
//! leader's record of ring links.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::identity::RemoteNode;

/// Leader-only membership state
#[derive(Debug, Default)]
pub struct LeaderState {
    /// Last HEALTH received per node
    pub alive_nodes: HashMap<RemoteNode, Instant>,
    /// When each ring member was admitted
    pub joined_at: HashMap<RemoteNode, Instant>,
    /// Assigned neighbour per ring member
    pub links: HashMap<RemoteNode, RemoteNode>,
    /// An eviction left gaps that the next sweep closes
    pub repair_pending: bool,
}

impl LeaderState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a heartbeat; returns true for a node's first heartbeat
    pub fn record_heartbeat(&mut self, node: RemoteNode, now: Instant) -> bool {
        self.alive_nodes.insert(node, now).is_none()
    }

    /// Start the liveness clock for a newly admitted member
    pub fn admit(&mut self, node: RemoteNode, now: Instant) {
        self.joined_at.entry(node).or_insert(now);
    }

    /// Forget every trace of a node
    pub fn forget(&mut self, node: &RemoteNode) {
        self.alive_nodes.remove(node);
        self.joined_at.remove(node);
    }

    /// Most recent sign of life: last heartbeat, else admission time
    pub fn last_seen(&self, node: &RemoteNode) -> Option<Instant> {
        self.alive_nodes
            .get(node)
            .or_else(|| self.joined_at.get(node))
            .copied()
    }

    /// Members whose last sign of life is strictly older than `timeout`
    pub fn expired(&self, members: &[RemoteNode], now: Instant, timeout: Duration) -> Vec<RemoteNode> {
        members
            .iter()
            .filter(|node| match self.last_seen(node) {
                Some(seen) => now.saturating_duration_since(seen) > timeout,
                None => false,
            })
            .copied()
            .collect()
    }

    /// Age of a node's last heartbeat
    pub fn heartbeat_age(&self, node: &RemoteNode, now: Instant) -> Option<Duration> {
        self.alive_nodes
            .get(node)
            .map(|seen| now.saturating_duration_since(*seen))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> RemoteNode {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn test_heartbeat_refreshes_timestamp() {
        let mut state = LeaderState::new();
        let start = Instant::now();

        assert!(state.record_heartbeat(addr(5000), start));
        assert!(!state.record_heartbeat(addr(5000), start + Duration::from_secs(1)));
        assert_eq!(
            state.heartbeat_age(&addr(5000), start + Duration::from_secs(3)),
            Some(Duration::from_secs(2))
        );
    }

    #[test]
    fn test_expiry_is_strict() {
        let mut state = LeaderState::new();
        let start = Instant::now();
        let timeout = Duration::from_secs(5);
        state.record_heartbeat(addr(5000), start);

        let members = [addr(5000)];
        assert!(state.expired(&members, start + timeout, timeout).is_empty());
        assert_eq!(
            state.expired(&members, start + timeout + Duration::from_millis(1), timeout),
            vec![addr(5000)]
        );
    }

    #[test]
    fn test_silent_member_expires_from_admission() {
        let mut state = LeaderState::new();
        let start = Instant::now();
        state.admit(addr(6000), start);

        assert!(!state.alive_nodes.contains_key(&addr(6000)));
        let expired = state.expired(&[addr(6000)], start + Duration::from_secs(6), Duration::from_secs(5));
        assert_eq!(expired, vec![addr(6000)]);

        state.forget(&addr(6000));
        assert!(state.last_seen(&addr(6000)).is_none());
    }
}
