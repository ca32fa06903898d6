//! Composite clock and the stability watermark.
//!
//! A composite clock is one node's full knowledge state: its own flat clock,
//! plus for every peer either that peer's flat clock or the whole composite
//! clock the peer last gossiped. Reducing the tree with a pointwise minimum
//! gives the lowest common clock: a lower bound on what every node has seen.
//! Messages whose timestamp sits at or below it are stable.
//!
//! Absorbed peer composites are stored as gossip snapshots (see
//! [`CompositeClock::snapshot`]) so the tree stays at most two levels deep
//! while knowledge about third parties still travels transitively.

use crate::error::{ClockError, Result};
use crate::flat::FlatClock;
use crate::node_id::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// What a composite clock knows about one node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockView {
    /// The node's flat clock as last reported.
    Flat(FlatClock),
    /// The node's entire composite clock as last gossiped.
    Composite(Arc<CompositeClock>),
}

impl ClockView {
    /// The node this view describes.
    pub fn owner(&self) -> NodeId {
        match self {
            ClockView::Flat(clock) => clock.owner(),
            ClockView::Composite(clock) => clock.owner(),
        }
    }

    /// The node's own flat clock as seen through this view.
    pub fn defining_clock(&self) -> &FlatClock {
        match self {
            ClockView::Flat(clock) => clock,
            ClockView::Composite(clock) => clock.local_entry(),
        }
    }

    /// How many messages the described node reported originating.
    pub fn sequence_for_owner(&self) -> u64 {
        self.defining_clock().sequence_for_owner()
    }

    /// Reduce to a single flat clock: a flat view is itself, a composite
    /// view is its lowest common clock.
    pub fn reduce(&self) -> FlatClock {
        match self {
            ClockView::Flat(clock) => clock.clone(),
            ClockView::Composite(clock) => clock.lowest_common_clock(),
        }
    }

    fn depth(&self) -> usize {
        match self {
            ClockView::Flat(_) => 0,
            ClockView::Composite(clock) => clock.depth(),
        }
    }
}

impl From<FlatClock> for ClockView {
    fn from(clock: FlatClock) -> Self {
        ClockView::Flat(clock)
    }
}

impl From<CompositeClock> for ClockView {
    fn from(clock: CompositeClock) -> Self {
        ClockView::Composite(Arc::new(clock))
    }
}

/// A node's full knowledge of the cluster's clocks.
///
/// The owner's own entry is always flat; that is enforced by keeping it in
/// its own field rather than in the peer map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeClock {
    owner: NodeId,
    local: FlatClock,
    peers: BTreeMap<NodeId, ClockView>,
}

impl CompositeClock {
    /// Create the initial clock for `owner` in a cluster of `peers`.
    ///
    /// Every node, the owner included, starts with an all-zero flat clock
    /// over the whole node set.
    pub fn new(owner: NodeId, peers: impl IntoIterator<Item = NodeId>) -> Self {
        let mut all_nodes: BTreeSet<NodeId> = peers.into_iter().collect();
        all_nodes.insert(owner);

        let peers = all_nodes
            .iter()
            .filter(|&&node| node != owner)
            .map(|&node| {
                (
                    node,
                    ClockView::Flat(FlatClock::new(node, all_nodes.iter().copied())),
                )
            })
            .collect();

        CompositeClock {
            owner,
            local: FlatClock::new(owner, all_nodes.iter().copied()),
            peers,
        }
    }

    /// Build a composite from a full node → view map.
    ///
    /// The map must hold a flat entry for `owner`.
    pub fn from_state(owner: NodeId, mut state: BTreeMap<NodeId, ClockView>) -> Result<Self> {
        match state.remove(&owner) {
            Some(ClockView::Flat(local)) => Ok(CompositeClock {
                owner,
                local,
                peers: state,
            }),
            Some(ClockView::Composite(_)) => Err(ClockError::NestedLocalEntry(owner)),
            None => Err(ClockError::MissingLocalEntry(owner)),
        }
    }

    pub fn owner(&self) -> NodeId {
        self.owner
    }

    /// The owner's own flat clock.
    pub fn local_entry(&self) -> &FlatClock {
        &self.local
    }

    /// The owner's own message count.
    pub fn sequence_for_owner(&self) -> u64 {
        self.local.sequence_for_owner()
    }

    /// What this clock holds for a peer. `None` for the owner and for
    /// unknown nodes.
    pub fn peer_entry(&self, node: NodeId) -> Option<&ClockView> {
        self.peers.get(&node)
    }

    /// Owner and peers, ascending.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        let all: BTreeSet<NodeId> = std::iter::once(self.owner)
            .chain(self.peers.keys().copied())
            .collect();
        all.into_iter()
    }

    /// Number of entries, the owner included.
    pub fn len(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Nesting depth: 0 for a lone flat clock, 1 for a composite of flat
    /// clocks, and so on.
    pub fn depth(&self) -> usize {
        1 + self.peers.values().map(ClockView::depth).max().unwrap_or(0)
    }

    /// The cluster-wide causal lower bound.
    ///
    /// Every entry is reduced to a flat clock; the result holds, for every
    /// node id seen in any of them, the minimum count across all reduced
    /// clocks (missing entries count as zero).
    pub fn lowest_common_clock(&self) -> FlatClock {
        self.peers
            .values()
            .map(ClockView::reduce)
            .fold(self.local.clone(), |stable, reduced| stable.min_with(&reduced))
    }

    /// The freshest knowledge this clock holds about `node`'s own flat clock.
    ///
    /// Combines the direct entry for `node` with every report of it nested
    /// inside other peers' views. Each report is a lower bound of the node's
    /// real clock, so their pointwise maximum is as well.
    pub fn best_known_clock_of(&self, node: NodeId) -> FlatClock {
        if node == self.owner {
            return self.local.clone();
        }

        let direct = self
            .peers
            .get(&node)
            .map(|view| view.defining_clock().clone())
            .unwrap_or_else(|| FlatClock::singleton(node));

        self.peers
            .values()
            .filter_map(|view| match view {
                ClockView::Composite(clock) if clock.owner() != node => clock.peer_entry(node),
                _ => None,
            })
            .fold(direct, |best, report| best.merged_with(report.defining_clock()))
            .with_owner(node)
    }

    /// The depth-one copy of this clock that peers store when they absorb it.
    ///
    /// Keeps the local entry and replaces every peer entry with the flat
    /// [`best_known_clock_of`](Self::best_known_clock_of) that peer.
    pub fn snapshot(&self) -> CompositeClock {
        let known: BTreeSet<NodeId> = self
            .peers
            .iter()
            .flat_map(|(&node, view)| {
                let nested: Vec<NodeId> = match view {
                    ClockView::Composite(clock) => clock.peers.keys().copied().collect(),
                    ClockView::Flat(_) => Vec::new(),
                };
                std::iter::once(node).chain(nested)
            })
            .filter(|&node| node != self.owner)
            .collect();

        CompositeClock {
            owner: self.owner,
            local: self.local.clone(),
            peers: known
                .into_iter()
                .map(|node| (node, ClockView::Flat(self.best_known_clock_of(node))))
                .collect(),
        }
    }

    /// Absorb a peer's composite clock.
    ///
    /// The peer's entry is replaced by a snapshot of `remote`, and the
    /// owner's direct count for the peer is raised to what the peer reports
    /// about itself. A remote view older than the one already held (lower
    /// self count) leaves the entry alone. Merging a clock with itself is a
    /// no-op.
    pub fn update(&self, remote: &CompositeClock) -> CompositeClock {
        if remote.owner == self.owner {
            return self.clone();
        }
        self.absorb(ClockView::Composite(Arc::new(remote.snapshot())))
    }

    /// Advance the owner's own entry, ahead of originating a message.
    pub fn next(&self) -> CompositeClock {
        CompositeClock {
            owner: self.owner,
            local: self.local.next(),
            peers: self.peers.clone(),
        }
    }

    /// Register `node` without asserting any knowledge about it.
    ///
    /// Already known nodes are left as they are.
    pub fn add(&self, node: NodeId) -> CompositeClock {
        if node == self.owner || self.peers.contains_key(&node) {
            return self.clone();
        }
        self.absorb(ClockView::Flat(FlatClock::singleton(node)))
    }

    fn absorb(&self, view: ClockView) -> CompositeClock {
        let node = view.owner();
        let sequence = view.sequence_for_owner();

        let mut peers = self.peers.clone();
        let stale = peers
            .get(&node)
            .map_or(false, |held| held.sequence_for_owner() > sequence);
        if !stale {
            peers.insert(node, view);
        }

        CompositeClock {
            owner: self.owner,
            local: self.local.update(node, sequence),
            peers,
        }
    }
}
