//! # dtopic-node
//!
//! Replicas of a gossip-replicated append-only log.
//!
//! Each [`TopicNode`] stores messages stamped with its vector clock, pushes
//! them to every peer it synchronises with, and periodically sends heartbeats
//! so that peers learn how far it has read. A message is *stable* once every
//! node is known to have seen it; [`TopicNode::consistent_messages`] returns
//! exactly those, in the same total order on every replica.
//!
//! ## Example
//!
//! ```rust
//! use dtopic_node::{full_mesh, start_all, NodeConfig};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> dtopic_node::Result<()> {
//! let nodes = full_mesh::<u64>(3, NodeConfig::default())?;
//! start_all(&nodes)?;
//!
//! nodes[0].store(42);
//! // once heartbeats have gone round, every node returns the same stable prefix
//! let stable = nodes[1].consistent_messages();
//! assert!(stable.len() <= 1);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod mesh;
pub mod message;
pub mod node;
pub mod sync;

pub use config::{Backoff, NodeConfig, NodeConfigBuilder};
pub use dtopic_clock::{CompositeClock, FlatClock, NodeId};
pub use error::{Result, TopicError};
pub use mesh::{full_mesh, shutdown_all, start_all};
pub use message::{Envelope, Message, Payload, TopicValue};
pub use node::{ConsistentRead, NodeStats, TopicNode};
pub use sync::{GossipTarget, LocalPeer, SyncStats, Synchroniser};
