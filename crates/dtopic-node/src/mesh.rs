//! Cluster wiring helpers.

use crate::config::NodeConfig;
use crate::error::Result;
use crate::message::TopicValue;
use crate::node::TopicNode;
use dtopic_clock::NodeId;
use std::sync::Arc;

/// Create nodes `1..=count`, each pushing to every other one.
///
/// Must be called from within a Tokio runtime. Heartbeats are not started.
pub fn full_mesh<T: TopicValue>(count: u32, config: NodeConfig) -> Result<Vec<Arc<TopicNode<T>>>> {
    let ids: Vec<NodeId> = (1..=count).map(NodeId).collect();
    let nodes: Vec<_> = ids
        .iter()
        .map(|&id| {
            let peers = ids.iter().copied().filter(move |&peer| peer != id);
            TopicNode::with_config(id, peers, config.clone())
        })
        .collect();

    for node in &nodes {
        for peer in &nodes {
            if node.id() != peer.id() {
                node.sync_with(peer)?;
            }
        }
    }

    Ok(nodes)
}

/// Start the heartbeat task on every node.
pub fn start_all<T: TopicValue>(nodes: &[Arc<TopicNode<T>>]) -> Result<()> {
    nodes.iter().try_for_each(|node| node.start())
}

/// Shut down every node.
pub fn shutdown_all<T: TopicValue>(nodes: &[Arc<TopicNode<T>>]) {
    for node in nodes {
        node.shutdown();
    }
}
