//! Multi-node convergence tests
//!
//! These run real clusters on a multi-threaded runtime and check that:
//!  - every replica ends up with every message exactly once
//!  - stable reads converge to the full log once heartbeats have gone round
//!  - incremental reads return only what became stable since the last read
//!  - duplicate deliveries, failing and stalled links are handled

use async_trait::async_trait;
use dtopic_node::{
    full_mesh, shutdown_all, start_all, Envelope, GossipTarget, LocalPeer, Message, NodeConfig,
    NodeConfigBuilder, NodeId, Result, TopicError, TopicNode,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

fn fast_config() -> NodeConfig {
    NodeConfigBuilder::new().heartbeat_interval_ms(10).build()
}

fn values(messages: &[Message<u64>]) -> Vec<u64> {
    messages.iter().filter_map(|m| m.value().copied()).collect()
}

/// Poll `condition` until it holds, failing the test after ten seconds.
async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

// ============================================================================
// Test targets
// ============================================================================

/// Delivers every envelope to the wrapped node twice.
struct Duplicating {
    node: Arc<TopicNode<u64>>,
}

#[async_trait]
impl GossipTarget<u64> for Duplicating {
    fn id(&self) -> NodeId {
        self.node.id()
    }

    async fn deliver(&self, envelope: Envelope<u64>) -> Result<()> {
        self.node.receive(envelope.clone())?;
        self.node.receive(envelope)
    }
}

/// Rejects the first delivery, then hands everything to the wrapped node.
struct FailsOnce {
    inner: LocalPeer<u64>,
    failed: AtomicBool,
}

#[async_trait]
impl GossipTarget<u64> for FailsOnce {
    fn id(&self) -> NodeId {
        self.inner.id()
    }

    async fn deliver(&self, envelope: Envelope<u64>) -> Result<()> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(TopicError::Delivery {
                peer: self.inner.id(),
                reason: "link reset".to_string(),
            });
        }
        self.inner.deliver(envelope).await
    }
}

/// Holds every delivery until a permit is released.
struct Stalled {
    id: NodeId,
    gate: Arc<Semaphore>,
}

#[async_trait]
impl GossipTarget<u64> for Stalled {
    fn id(&self) -> NodeId {
        self.id
    }

    async fn deliver(&self, _envelope: Envelope<u64>) -> Result<()> {
        let permit = self.gate.acquire().await.map_err(|_| TopicError::PeerGone(self.id))?;
        permit.forget();
        Ok(())
    }
}

/// Keeps every envelope it is handed.
struct Capture {
    id: NodeId,
    envelopes: Mutex<Vec<Envelope<u64>>>,
}

#[async_trait]
impl GossipTarget<u64> for Capture {
    fn id(&self) -> NodeId {
        self.id
    }

    async fn deliver(&self, envelope: Envelope<u64>) -> Result<()> {
        self.envelopes.lock().push(envelope);
        Ok(())
    }
}

// ============================================================================
// Cluster scenarios
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ten_producers_four_nodes() {
    let nodes = full_mesh::<u64>(4, fast_config()).unwrap();
    start_all(&nodes).unwrap();

    let counter = Arc::new(AtomicU64::new(0));
    let producers: Vec<_> = (0..10)
        .map(|_| {
            let nodes = nodes.clone();
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                let mut rng = StdRng::from_entropy();
                for _ in 0..10 {
                    let value = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    nodes[rng.gen_range(0..nodes.len())].store(value);
                    tokio::time::sleep(Duration::from_millis(rng.gen_range(0..10))).await;
                }
            })
        })
        .collect();
    for result in futures::future::join_all(producers).await {
        result.unwrap();
    }

    eventually("every node to hold 100 messages", || {
        nodes.iter().all(|n| n.all_messages().len() == 100)
    })
    .await;

    let expected: BTreeSet<u64> = (1..=100).collect();
    for node in &nodes {
        let held = values(&node.all_messages());
        assert_eq!(held.len(), 100, "{} holds duplicates", node.id());
        assert_eq!(held.into_iter().collect::<BTreeSet<_>>(), expected);
    }

    eventually("every message to become stable", || {
        nodes.iter().all(|n| n.consistent_messages().len() == 100)
    })
    .await;

    // same stable order everywhere
    let reference = nodes[0].consistent_messages();
    for node in &nodes[1..] {
        assert_eq!(node.consistent_messages(), reference);
    }

    shutdown_all(&nodes);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stability_needs_heartbeats() {
    let nodes = full_mesh::<u64>(3, fast_config()).unwrap();

    nodes[0].store(1);
    eventually("the message to reach every node", || {
        nodes.iter().all(|n| n.all_messages().len() == 1)
    })
    .await;

    // without heartbeats the origin never learns the others have it
    assert!(nodes[0].consistent_messages().is_empty());

    start_all(&nodes).unwrap();
    eventually("stability on every node", || {
        nodes
            .iter()
            .all(|n| n.consistent_messages() == n.all_messages())
    })
    .await;

    for node in &nodes {
        assert!(node.stats().heartbeats_received > 0);
    }
    shutdown_all(&nodes);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_incremental_reads() {
    let nodes = full_mesh::<u64>(3, fast_config()).unwrap();
    start_all(&nodes).unwrap();

    for v in 1..=5 {
        nodes[(v % 3) as usize].store(v);
    }
    eventually("the first batch to stabilise", || {
        nodes[0].consistent_messages().len() == 5
    })
    .await;
    let first = nodes[0].consistent_snapshot();
    assert_eq!(first.messages.len(), 5);

    for v in 6..=10 {
        nodes[(v % 3) as usize].store(v);
    }
    eventually("the second batch to stabilise", || {
        nodes[0].consistent_messages().len() == 10
    })
    .await;

    let since = values(&nodes[0].consistent_messages_since(&first.watermark));
    let expected: BTreeSet<u64> = (6..=10).collect();
    assert_eq!(since.iter().copied().collect::<BTreeSet<_>>(), expected);

    // old and new reads partition the stable log
    let mut combined = values(&first.messages);
    combined.extend(since);
    combined.sort_unstable();
    assert_eq!(combined, (1..=10).collect::<Vec<_>>());

    shutdown_all(&nodes);
}

// ============================================================================
// Link behaviour
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_delivery_is_idempotent() {
    let a = TopicNode::<u64>::new(NodeId(1), [NodeId(2)]);
    let b = TopicNode::<u64>::new(NodeId(2), [NodeId(1)]);
    assert!(a
        .sync_with_target(Arc::new(Duplicating { node: Arc::clone(&b) }))
        .unwrap());

    for v in 1..=5 {
        a.store(v);
    }
    eventually("a's backlog to drain", || a.synced()).await;

    assert_eq!(values(&b.all_messages()), vec![1, 2, 3, 4, 5]);
    assert_eq!(b.local_clock().get(NodeId(1)), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_push_never_leaves_a_hole() {
    let config = NodeConfigBuilder::new()
        .retry_backoff(Duration::from_millis(1), Duration::from_millis(5))
        .build();
    let a = TopicNode::<u64>::with_config(NodeId(1), [NodeId(2)], config);
    let b = TopicNode::<u64>::new(NodeId(2), [NodeId(1)]);
    a.sync_with_target(Arc::new(FailsOnce {
        inner: LocalPeer::new(&b),
        failed: AtomicBool::new(false),
    }))
    .unwrap();
    b.sync_with(&a).unwrap();

    a.store(1);
    a.store(2);
    eventually("a's backlog to drain", || a.synced()).await;
    assert_eq!(values(&b.all_messages()), vec![1, 2]);

    assert!(b.heartbeat_tick());
    eventually("b's heartbeat to reach a", || a.stats().heartbeats_received == 1).await;

    // everything a calls stable is held by b
    let stable = values(&a.consistent_messages());
    assert_eq!(stable, vec![1, 2]);
    let held = values(&b.all_messages());
    assert!(stable.iter().all(|v| held.contains(v)));

    let stats = a.stats();
    assert_eq!(stats.retries, 1);
    assert_eq!(stats.failed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_heartbeat_held_back_by_backlog() {
    let config = NodeConfigBuilder::new().backlog_factor(1).build();
    let a = TopicNode::<u64>::with_config(NodeId(1), [NodeId(2)], config);
    let b = TopicNode::<u64>::new(NodeId(2), [NodeId(1)]);

    // capture an envelope from b so a owes a heartbeat
    let capture = Arc::new(Capture {
        id: NodeId(1),
        envelopes: Mutex::new(Vec::new()),
    });
    b.sync_with_target(capture.clone()).unwrap();
    b.store(100);
    eventually("b's envelope to be captured", || b.synced()).await;
    let envelope = capture.envelopes.lock().pop().unwrap();

    let gate = Arc::new(Semaphore::new(0));
    a.sync_with_target(Arc::new(Stalled {
        id: NodeId(2),
        gate: Arc::clone(&gate),
    }))
    .unwrap();

    a.receive(envelope).unwrap();
    assert!(a.needs_heartbeat());

    // threshold is 1 x 2 clock entries
    a.store(1);
    a.store(2);
    assert_eq!(a.backlog(), 2);
    assert!(!a.heartbeat_tick());
    assert!(a.needs_heartbeat());

    gate.add_permits(2);
    eventually("a's backlog to drain", || a.synced()).await;
    assert!(a.heartbeat_tick());
    assert!(!a.needs_heartbeat());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropped_peer_fails_without_stalling() {
    let nodes = full_mesh::<u64>(2, fast_config()).unwrap();
    let a = Arc::clone(&nodes[0]);
    drop(nodes);

    // b is gone; pushes fail but the backlog still drains
    a.store(1);
    eventually("a's backlog to drain", || a.synced()).await;

    let stats = a.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.delivered, 0);
    assert_eq!(stats.messages, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_stops_heartbeats() {
    let nodes = full_mesh::<u64>(2, fast_config()).unwrap();
    start_all(&nodes).unwrap();

    nodes[0].store(1);
    eventually("stability", || nodes[1].consistent_messages().len() == 1).await;

    shutdown_all(&nodes);
    assert!(nodes.iter().all(|n| !n.is_running()));
    assert!(nodes.iter().all(|n| n.peers().is_empty()));

    // give any in-flight work time to settle, then check nothing new is sent
    tokio::time::sleep(Duration::from_millis(50)).await;
    let sent: Vec<u64> = nodes.iter().map(|n| n.stats().heartbeats_sent).collect();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let later: Vec<u64> = nodes.iter().map(|n| n.stats().heartbeats_sent).collect();
    assert_eq!(sent, later);
}
