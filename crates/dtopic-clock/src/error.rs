//! Error types for clock construction.

use crate::node_id::NodeId;
use thiserror::Error;

/// Errors raised when a composite clock would break its invariants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClockError {
    #[error("composite clock for {0} has no entry for its own node")]
    MissingLocalEntry(NodeId),

    #[error("composite clock for {0} tracks itself through a nested clock")]
    NestedLocalEntry(NodeId),
}

pub type Result<T> = std::result::Result<T, ClockError>;
