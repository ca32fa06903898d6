//! Push-based gossip between nodes.
//!
//! A `Synchroniser` owns one outgoing link per registered peer. Each link is
//! a FIFO queue drained by its own task, so `synchronise` only enqueues and
//! never waits on a peer. The backlog counts envelopes that have been
//! enqueued but not yet handed to their target.
//!
//! A forwarder retries a failed push with backoff until the target accepts
//! it, the failure is permanent, or the synchroniser is closed. Later
//! envelopes on the same link wait until then.

use crate::config::Backoff;
use crate::error::{Result, TopicError};
use crate::message::{Envelope, TopicValue};
use crate::node::TopicNode;
use async_trait::async_trait;
use dtopic_clock::NodeId;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Something envelopes can be pushed to.
#[async_trait]
pub trait GossipTarget<T: TopicValue>: Send + Sync + 'static {
    /// Id of the node behind this target.
    fn id(&self) -> NodeId;

    /// Hand one envelope to the target.
    async fn deliver(&self, envelope: Envelope<T>) -> Result<()>;
}

/// In-process target that feeds envelopes straight into another node.
///
/// Holds a weak reference so links never keep a peer alive.
pub struct LocalPeer<T: TopicValue> {
    id: NodeId,
    node: Weak<TopicNode<T>>,
}

impl<T: TopicValue> LocalPeer<T> {
    pub fn new(node: &Arc<TopicNode<T>>) -> Self {
        Self {
            id: node.id(),
            node: Arc::downgrade(node),
        }
    }
}

#[async_trait]
impl<T: TopicValue> GossipTarget<T> for LocalPeer<T> {
    fn id(&self) -> NodeId {
        self.id
    }

    async fn deliver(&self, envelope: Envelope<T>) -> Result<()> {
        let node = self.node.upgrade().ok_or(TopicError::PeerGone(self.id))?;
        node.receive(envelope)
    }
}

/// Counters shared between a synchroniser and its forwarders.
#[derive(Debug, Default)]
struct SyncCounters {
    backlog: AtomicUsize,
    delivered: AtomicU64,
    retries: AtomicU64,
    failed: AtomicU64,
    closed: AtomicBool,
}

/// Snapshot of synchroniser counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub peers: usize,
    pub backlog: usize,
    pub delivered: u64,
    pub retries: u64,
    pub failed: u64,
}

struct Link<T> {
    peer: NodeId,
    tx: mpsc::UnboundedSender<Envelope<T>>,
}

/// Forwards every envelope to every registered peer.
pub struct Synchroniser<T: TopicValue> {
    owner: NodeId,
    links: RwLock<Vec<Link<T>>>,
    counters: Arc<SyncCounters>,
    backoff: Backoff,
}

impl<T: TopicValue> Synchroniser<T> {
    pub fn new(owner: NodeId) -> Self {
        Self::with_backoff(owner, Backoff::default())
    }

    pub fn with_backoff(owner: NodeId, backoff: Backoff) -> Self {
        Self {
            owner,
            links: RwLock::new(Vec::new()),
            counters: Arc::new(SyncCounters::default()),
            backoff,
        }
    }

    /// Register a push target.
    ///
    /// Returns `Ok(false)` if a target with the same id is already
    /// registered. The forwarder is spawned on the current Tokio runtime.
    pub fn sync_with(&self, target: Arc<dyn GossipTarget<T>>) -> Result<bool> {
        let peer = target.id();
        if peer == self.owner {
            return Err(TopicError::SelfSync(peer));
        }
        let runtime = Handle::try_current().map_err(|_| TopicError::NoRuntime)?;

        let mut links = self.links.write();
        if links.iter().any(|link| link.peer == peer) {
            debug!(node = %self.owner, peer = %peer, "already synchronising");
            return Ok(false);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(forward(
            self.owner,
            target,
            rx,
            Arc::clone(&self.counters),
            self.backoff,
        ));
        links.push(Link { peer, tx });

        debug!(node = %self.owner, peer = %peer, "registered push target");
        Ok(true)
    }

    /// Enqueue `envelope` on every link.
    pub fn synchronise(&self, envelope: &Envelope<T>) {
        for link in self.links.read().iter() {
            self.counters.backlog.fetch_add(1, Ordering::SeqCst);
            if link.tx.send(envelope.clone()).is_err() {
                self.counters.backlog.fetch_sub(1, Ordering::SeqCst);
                warn!(node = %self.owner, peer = %link.peer, "forwarder gone, envelope dropped");
            }
        }
    }

    /// Envelopes enqueued but not yet delivered.
    pub fn queue(&self) -> usize {
        self.counters.backlog.load(Ordering::SeqCst)
    }

    pub fn peers(&self) -> Vec<NodeId> {
        self.links.read().iter().map(|link| link.peer).collect()
    }

    pub fn peer_count(&self) -> usize {
        self.links.read().len()
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            peers: self.peer_count(),
            backlog: self.queue(),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Drop every link. Forwarders make one more attempt at what is already
    /// queued, then exit.
    pub fn close(&self) {
        self.counters.closed.store(true, Ordering::SeqCst);
        let links = std::mem::take(&mut *self.links.write());
        if !links.is_empty() {
            debug!(node = %self.owner, links = links.len(), "closing push links");
        }
    }
}

async fn forward<T: TopicValue>(
    owner: NodeId,
    target: Arc<dyn GossipTarget<T>>,
    mut rx: mpsc::UnboundedReceiver<Envelope<T>>,
    counters: Arc<SyncCounters>,
    backoff: Backoff,
) {
    let peer = target.id();
    while let Some(envelope) = rx.recv().await {
        push(owner, target.as_ref(), envelope, &counters, backoff).await;
        counters.backlog.fetch_sub(1, Ordering::SeqCst);
    }
    trace!(node = %owner, peer = %peer, "forwarder exiting");
}

/// Deliver one envelope, retrying transient failures.
async fn push<T: TopicValue>(
    owner: NodeId,
    target: &dyn GossipTarget<T>,
    envelope: Envelope<T>,
    counters: &SyncCounters,
    backoff: Backoff,
) {
    let peer = target.id();
    let mut delay = backoff.initial;
    loop {
        match target.deliver(envelope.clone()).await {
            Ok(()) => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) if e.is_retryable() && !counters.closed.load(Ordering::SeqCst) => {
                counters.retries.fetch_add(1, Ordering::Relaxed);
                debug!(node = %owner, peer = %peer, error = %e, retry_in = ?delay, "push failed, retrying");
                tokio::time::sleep(delay).await;
                delay = backoff.next_delay(delay);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(node = %owner, peer = %peer, error = %e, "push abandoned");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use dtopic_clock::CompositeClock;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Records everything it is handed.
    struct Recorder {
        id: NodeId,
        seen: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl GossipTarget<u32> for Recorder {
        fn id(&self) -> NodeId {
            self.id
        }

        async fn deliver(&self, envelope: Envelope<u32>) -> Result<()> {
            if let Some(v) = envelope.message.value() {
                self.seen.lock().push(*v);
            }
            Ok(())
        }
    }

    /// Rejects the first `failures` deliveries, then records like `Recorder`.
    struct Flaky {
        failures: AtomicUsize,
        inner: Recorder,
    }

    #[async_trait]
    impl GossipTarget<u32> for Flaky {
        fn id(&self) -> NodeId {
            self.inner.id
        }

        async fn deliver(&self, envelope: Envelope<u32>) -> Result<()> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(TopicError::Delivery {
                    peer: self.inner.id,
                    reason: "connection reset".to_string(),
                });
            }
            self.inner.deliver(envelope).await
        }
    }

    fn recorder(id: u32) -> Arc<Recorder> {
        Arc::new(Recorder {
            id: NodeId(id),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn envelope(value: u32) -> Envelope<u32> {
        let clock = Arc::new(CompositeClock::new(NodeId(1), [NodeId(2)]).next());
        Envelope::new(Message::stamped(value, clock.local_entry().clone()), clock)
    }

    async fn drained(sync: &Synchroniser<u32>) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while sync.queue() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("backlog never drained");
    }

    #[test]
    fn test_sync_with_requires_runtime() {
        let sync = Synchroniser::<u32>::new(NodeId(1));
        assert_eq!(sync.sync_with(recorder(2)), Err(TopicError::NoRuntime));
        assert_eq!(sync.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_rejects_self_and_duplicates() {
        let sync = Synchroniser::<u32>::new(NodeId(1));
        assert_eq!(sync.sync_with(recorder(1)), Err(TopicError::SelfSync(NodeId(1))));
        assert_eq!(sync.sync_with(recorder(2)), Ok(true));
        assert_eq!(sync.sync_with(recorder(2)), Ok(false));
        assert_eq!(sync.peers(), vec![NodeId(2)]);
    }

    #[tokio::test]
    async fn test_forwards_in_order_to_every_peer() {
        let sync = Synchroniser::new(NodeId(1));
        let a = recorder(2);
        let b = recorder(3);
        sync.sync_with(a.clone()).unwrap();
        sync.sync_with(b.clone()).unwrap();

        for v in 0..20 {
            sync.synchronise(&envelope(v));
        }
        drained(&sync).await;

        let expected: Vec<u32> = (0..20).collect();
        assert_eq!(*a.seen.lock(), expected);
        assert_eq!(*b.seen.lock(), expected);

        let stats = sync.stats();
        assert_eq!(stats.delivered, 40);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.backlog, 0);
    }

    #[tokio::test]
    async fn test_failed_push_is_retried_in_order() {
        let backoff = Backoff {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(4),
        };
        let sync = Synchroniser::with_backoff(NodeId(1), backoff);
        let flaky = Arc::new(Flaky {
            failures: AtomicUsize::new(3),
            inner: Recorder {
                id: NodeId(2),
                seen: Mutex::new(Vec::new()),
            },
        });
        sync.sync_with(flaky.clone()).unwrap();

        for v in 0..5 {
            sync.synchronise(&envelope(v));
        }
        drained(&sync).await;

        assert_eq!(*flaky.inner.seen.lock(), vec![0, 1, 2, 3, 4]);
        let stats = sync.stats();
        assert_eq!(stats.retries, 3);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.delivered, 5);
    }

    #[tokio::test]
    async fn test_close_drops_links() {
        let sync = Synchroniser::new(NodeId(1));
        let a = recorder(2);
        sync.sync_with(a.clone()).unwrap();
        sync.close();
        assert_eq!(sync.peer_count(), 0);

        sync.synchronise(&envelope(1));
        assert_eq!(sync.queue(), 0);
        assert!(a.seen.lock().is_empty());
    }
}
