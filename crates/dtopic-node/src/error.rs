//! Error types for topic nodes.

use dtopic_clock::{ClockError, NodeId};
use thiserror::Error;

/// Errors raised by nodes and their synchronisers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("no tokio runtime is running on this thread")]
    NoRuntime,

    #[error("heartbeat task for {0} is already running")]
    AlreadyStarted(NodeId),

    #[error("{0} cannot synchronise with itself")]
    SelfSync(NodeId),

    #[error("peer {0} has been dropped")]
    PeerGone(NodeId),

    #[error("delivery to {peer} failed: {reason}")]
    Delivery { peer: NodeId, reason: String },

    #[error("{node} got message {got} from {from} but expected at most {expected}")]
    SequenceGap {
        node: NodeId,
        from: NodeId,
        expected: u64,
        got: u64,
    },

    #[error("{0} was not tracked when this node started and it already holds messages")]
    UnknownPeer(NodeId),

    #[error("clock error: {0}")]
    Clock(#[from] ClockError),
}

impl TopicError {
    /// Whether re-sending the same envelope can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TopicError::Delivery { .. })
    }
}

pub type Result<T> = std::result::Result<T, TopicError>;
