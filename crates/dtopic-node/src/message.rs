//! Log entries and the envelopes that carry them between nodes.
//!
//! Every message is stamped with the originating node's flat clock at the
//! moment it was stored. Messages are totally ordered so that every replica
//! holds its log in the same sequence:
//!
//! 1. total progress of the timestamp (sum of all counts)
//! 2. originating node
//! 3. the originator's own sequence number
//! 4. the remaining clock entries, lexicographically
//! 5. the payload, heartbeats first

use dtopic_clock::{CompositeClock, FlatClock, NodeId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::Debug;
use std::sync::Arc;

/// Bounds every payload type must satisfy to travel through a topic.
pub trait TopicValue: Clone + Ord + Debug + Send + Sync + 'static {}

impl<T> TopicValue for T where T: Clone + Ord + Debug + Send + Sync + 'static {}

/// What a log entry carries.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Payload<T> {
    /// Clock-only message, never returned by reads.
    Heartbeat,
    Value(T),
}

/// A timestamped log entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Message<T> {
    payload: Payload<T>,
    timestamp: FlatClock,
}

impl<T> Message<T> {
    pub fn new(payload: Payload<T>, timestamp: FlatClock) -> Self {
        Self { payload, timestamp }
    }

    /// A value message stamped with `timestamp`.
    pub fn stamped(value: T, timestamp: FlatClock) -> Self {
        Self::new(Payload::Value(value), timestamp)
    }

    pub fn heartbeat(timestamp: FlatClock) -> Self {
        Self::new(Payload::Heartbeat, timestamp)
    }

    pub fn payload(&self) -> &Payload<T> {
        &self.payload
    }

    /// The carried value, or `None` for a heartbeat.
    pub fn value(&self) -> Option<&T> {
        match &self.payload {
            Payload::Value(value) => Some(value),
            Payload::Heartbeat => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self.payload {
            Payload::Value(value) => Some(value),
            Payload::Heartbeat => None,
        }
    }

    pub fn timestamp(&self) -> &FlatClock {
        &self.timestamp
    }

    /// The node that stored this message.
    pub fn origin(&self) -> NodeId {
        self.timestamp.owner()
    }

    /// The origin's sequence number for this message.
    pub fn sequence(&self) -> u64 {
        self.timestamp.sequence_for_owner()
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self.payload, Payload::Heartbeat)
    }

    /// True if `clock` has observed everything this message's timestamp has.
    pub fn is_before(&self, clock: &FlatClock) -> bool {
        clock.dominates(&self.timestamp)
    }

    /// True if `clock` has NOT observed this message.
    pub fn is_after(&self, clock: &FlatClock) -> bool {
        !self.is_before(clock)
    }
}

impl<T: Ord> Ord for Message<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .total_progress()
            .cmp(&other.timestamp.total_progress())
            .then_with(|| self.origin().cmp(&other.origin()))
            .then_with(|| self.sequence().cmp(&other.sequence()))
            .then_with(|| self.timestamp.cmp_entries(&other.timestamp))
            .then_with(|| self.payload.cmp(&other.payload))
    }
}

impl<T: Ord> PartialOrd for Message<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A message in flight, together with the sender's composite clock at the
/// time it was stored.
#[derive(Clone, Debug)]
pub struct Envelope<T> {
    pub message: Message<T>,
    pub clock: Arc<CompositeClock>,
}

impl<T> Envelope<T> {
    pub fn new(message: Message<T>, clock: Arc<CompositeClock>) -> Self {
        Self { message, clock }
    }

    pub fn sender(&self) -> NodeId {
        self.clock.owner()
    }
}
