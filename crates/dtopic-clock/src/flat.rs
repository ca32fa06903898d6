//! Flat vector clock for a single node.
//!
//! A flat clock records, for every node it knows about, how many messages
//! originated by that node have been observed. It also remembers which node
//! it represents (its owner), so `next` knows which entry to advance.
//!
//! All operations are pure: they return a new clock and leave `self` alone.

use crate::node_id::NodeId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// A flat vector clock owned by one node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlatClock {
    /// The node this clock represents.
    owner: NodeId,
    /// Map from node id to observed sequence count.
    entries: BTreeMap<NodeId, u64>,
}

impl FlatClock {
    /// Create a clock for `owner` tracking every id in `node_ids`, all at zero.
    ///
    /// The owner is always tracked, whether or not it appears in `node_ids`.
    pub fn new(owner: NodeId, node_ids: impl IntoIterator<Item = NodeId>) -> Self {
        let mut entries: BTreeMap<NodeId, u64> =
            node_ids.into_iter().map(|id| (id, 0)).collect();
        entries.entry(owner).or_insert(0);
        FlatClock { owner, entries }
    }

    /// A clock that only knows about `node`, at sequence zero.
    ///
    /// Used when a node first learns of a previously unknown peer.
    pub fn singleton(node: NodeId) -> Self {
        FlatClock::new(node, std::iter::empty())
    }

    /// Create a clock from explicit entries.
    pub fn from_entries(owner: NodeId, entries: impl IntoIterator<Item = (NodeId, u64)>) -> Self {
        FlatClock {
            owner,
            entries: entries.into_iter().collect(),
        }
    }

    /// The node this clock represents.
    pub fn owner(&self) -> NodeId {
        self.owner
    }

    /// The tracked count for `node`, or `None` if this clock has never heard of it.
    pub fn sequence_for(&self, node: NodeId) -> Option<u64> {
        self.entries.get(&node).copied()
    }

    /// The tracked count for `node`, treating unknown nodes as zero.
    pub fn get(&self, node: NodeId) -> u64 {
        self.sequence_for(node).unwrap_or(0)
    }

    /// The count for the owner's own entry.
    pub fn sequence_for_owner(&self) -> u64 {
        self.get(self.owner)
    }

    /// All tracked node ids, in ascending order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.entries.keys().copied()
    }

    /// Iterate over all entries.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, u64)> + '_ {
        self.entries.iter().map(|(&id, &seq)| (id, seq))
    }

    /// A new clock with the owner's entry advanced by one.
    pub fn next(&self) -> FlatClock {
        let mut result = self.clone();
        *result.entries.entry(self.owner).or_insert(0) += 1;
        result
    }

    /// A new clock where `node` is at least `sequence`.
    ///
    /// Counts never go down: `result[node] = max(self[node], sequence)`.
    pub fn update(&self, node: NodeId, sequence: u64) -> FlatClock {
        let mut result = self.clone();
        let current = result.entries.entry(node).or_insert(0);
        *current = (*current).max(sequence);
        result
    }

    /// Returns the same counts under a different owner.
    pub fn with_owner(&self, owner: NodeId) -> FlatClock {
        FlatClock {
            owner,
            entries: self.entries.clone(),
        }
    }

    /// Check if this clock has observed everything `other` has.
    /// Returns true if for all nodes, self[n] >= other[n].
    pub fn dominates(&self, other: &FlatClock) -> bool {
        other
            .entries
            .iter()
            .all(|(&node, &seq)| self.get(node) >= seq)
    }

    /// Check if two clocks are concurrent (neither dominates the other).
    pub fn is_concurrent_with(&self, other: &FlatClock) -> bool {
        self.causal_cmp(other).is_none()
    }

    /// Causal comparison of the counts, ignoring ownership.
    ///
    /// `None` means the clocks are concurrent.
    pub fn causal_cmp(&self, other: &FlatClock) -> Option<Ordering> {
        match (self.dominates(other), other.dominates(self)) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Greater),
            (false, true) => Some(Ordering::Less),
            (false, false) => None,
        }
    }

    /// Pointwise maximum, keeping this clock's owner.
    pub fn merged_with(&self, other: &FlatClock) -> FlatClock {
        other
            .iter()
            .fold(self.clone(), |acc, (node, seq)| acc.update(node, seq))
    }

    /// Pointwise minimum over the union of both clocks' ids, missing entries
    /// counting as zero. Keeps this clock's owner.
    pub fn min_with(&self, other: &FlatClock) -> FlatClock {
        let all_nodes: BTreeSet<NodeId> = self.node_ids().chain(other.node_ids()).collect();

        FlatClock {
            owner: self.owner,
            entries: all_nodes
                .into_iter()
                .map(|node| (node, self.get(node).min(other.get(node))))
                .collect(),
        }
    }

    /// Sum of all counts (total messages observed).
    pub fn total_progress(&self) -> u64 {
        self.entries.values().sum()
    }

    /// Number of tracked nodes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lexicographic comparison of the raw entries.
    ///
    /// Not causal; used to break ties when a total order is required.
    pub fn cmp_entries(&self, other: &FlatClock) -> Ordering {
        self.entries.iter().cmp(other.entries.iter())
    }
}
