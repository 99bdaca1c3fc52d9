//! Ring Neighbour Planning
//!
//! The leader keeps its members in join order and links each member to the
//! next one, the tail closing back to the head. These functions mutate the
//! leader's member list and link table and return the neighbour changes
//! that have to be pushed to the affected nodes.

use std::collections::HashMap;

use super::identity::RemoteNode;

/// A neighbour change for one node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub node: RemoteNode,
    pub neighbour: Option<RemoteNode>,
}

impl Assignment {
    fn set(node: RemoteNode, neighbour: RemoteNode) -> Self {
        Self { node, neighbour: Some(neighbour) }
    }

    fn clear(node: RemoteNode) -> Self {
        Self { node, neighbour: None }
    }
}

/// Append `node` at the tail of the ring.
///
/// With members `[H .. T]` this links `T -> node` and `node -> H`. When
/// `H == T` the two nodes end up referencing each other; with more members
/// links are one-way. A node that is already a member yields no change.
pub fn insert(
    members: &mut Vec<RemoteNode>,
    links: &mut HashMap<RemoteNode, RemoteNode>,
    node: RemoteNode,
) -> Vec<Assignment> {
    if members.contains(&node) {
        return Vec::new();
    }

    let (head, tail) = match (members.first().copied(), members.last().copied()) {
        (Some(head), Some(tail)) => (head, tail),
        _ => {
            members.push(node);
            return Vec::new();
        }
    };

    members.push(node);
    links.insert(tail, node);
    links.insert(node, head);

    vec![Assignment::set(node, head), Assignment::set(tail, node)]
}

/// Remove `node` from the ring.
///
/// Every member linked to the removed node loses its neighbour; the gap is
/// closed later by [`repair`].
pub fn remove(
    members: &mut Vec<RemoteNode>,
    links: &mut HashMap<RemoteNode, RemoteNode>,
    node: &RemoteNode,
) -> Vec<Assignment> {
    members.retain(|m| m != node);
    links.remove(node);

    let dangling: Vec<RemoteNode> = links
        .iter()
        .filter(|(_, target)| *target == node)
        .map(|(from, _)| *from)
        .collect();

    dangling
        .into_iter()
        .map(|from| {
            links.remove(&from);
            Assignment::clear(from)
        })
        .collect()
}

/// Rebuild the canonical cycle over `members` and report every link that
/// changed. A lone member has no neighbour.
pub fn repair(
    members: &[RemoteNode],
    links: &mut HashMap<RemoteNode, RemoteNode>,
) -> Vec<Assignment> {
    links.retain(|from, _| members.contains(from));

    let mut changes = Vec::new();
    for (index, member) in members.iter().enumerate() {
        let expected = if members.len() >= 2 {
            Some(members[(index + 1) % members.len()])
        } else {
            None
        };

        if links.get(member).copied() == expected {
            continue;
        }

        match expected {
            Some(next) => {
                links.insert(*member, next);
                changes.push(Assignment::set(*member, next));
            }
            None => {
                links.remove(member);
                changes.push(Assignment::clear(*member));
            }
        }
    }
    changes
}
