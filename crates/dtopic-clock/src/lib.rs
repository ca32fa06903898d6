//! # dtopic-clock
//!
//! Vector clocks for the gossip-replicated topic log.
//!
//! This crate provides:
//! - Node identities
//! - Flat vector clocks with the pointwise merge/compare algebra
//! - Composite clocks that aggregate per-peer knowledge into a stability
//!   watermark (the lowest common clock)
//!
//! ## Example
//!
//! ```rust
//! use dtopic_clock::{CompositeClock, NodeId};
//!
//! let a = CompositeClock::new(NodeId(1), [NodeId(2)]);
//! let b = CompositeClock::new(NodeId(2), [NodeId(1)]);
//!
//! // node 1 originates a message
//! let a = a.next();
//! let timestamp = a.local_entry().clone();
//!
//! // node 2 absorbs node 1's clock, then answers
//! let b = b.update(&a).next();
//! let a = a.update(&b);
//!
//! // node 1 now knows every node has seen its message
//! assert!(a.lowest_common_clock().dominates(&timestamp));
//! ```

mod composite;
mod error;
mod flat;
mod node_id;

pub use composite::{ClockView, CompositeClock};
pub use error::{ClockError, Result};
pub use flat::FlatClock;
pub use node_id::NodeId;
