//! Topic node: a replica of the shared append-only log.
//!
//! Writers (`store`, `receive`) are serialized by a per-node mutex. The clock
//! and the log are each published by an atomic pointer swap, the log always
//! first, so a reader that loads a clock also sees every message that clock
//! accounts for. Reads never take the write lock.
//!
//! Heartbeats only move clocks; they are never kept in the log.

use crate::config::NodeConfig;
use crate::error::{Result, TopicError};
use crate::message::{Envelope, Message, Payload, TopicValue};
use crate::sync::{GossipTarget, LocalPeer, Synchroniser};
use arc_swap::ArcSwap;
use dtopic_clock::{CompositeClock, FlatClock, NodeId};
use im::OrdSet;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

/// Stable messages together with the watermark they were read at.
///
/// Pass `watermark` to `consistent_messages_since` to fetch only what became
/// stable afterwards.
#[derive(Clone, Debug)]
pub struct ConsistentRead<T> {
    pub watermark: FlatClock,
    pub messages: Vec<Message<T>>,
}

/// Point-in-time statistics for a node.
#[derive(Clone, Debug, Default)]
pub struct NodeStats {
    pub messages: usize,
    pub stable_messages: usize,
    pub heartbeats_sent: u64,
    pub heartbeats_received: u64,
    pub backlog: usize,
    pub peers: usize,
    pub delivered: u64,
    pub retries: u64,
    pub failed: u64,
}

/// One replica of the topic.
pub struct TopicNode<T: TopicValue> {
    id: NodeId,
    config: NodeConfig,
    clock: ArcSwap<CompositeClock>,
    log: ArcSwap<OrdSet<Message<T>>>,
    write_lock: Mutex<()>,
    synchroniser: Synchroniser<T>,
    needs_heartbeat: AtomicBool,
    heartbeats_sent: AtomicU64,
    heartbeats_received: AtomicU64,
    heartbeat: Mutex<Option<oneshot::Sender<()>>>,
}

impl<T: TopicValue> TopicNode<T> {
    /// Create a node that tracks `peers` in its clock from the start.
    pub fn new(id: NodeId, peers: impl IntoIterator<Item = NodeId>) -> Arc<Self> {
        Self::with_config(id, peers, NodeConfig::default())
    }

    pub fn with_config(
        id: NodeId,
        peers: impl IntoIterator<Item = NodeId>,
        config: NodeConfig,
    ) -> Arc<Self> {
        let synchroniser = Synchroniser::with_backoff(id, config.retry_backoff);
        Arc::new(Self {
            id,
            config,
            clock: ArcSwap::from_pointee(CompositeClock::new(id, peers)),
            log: ArcSwap::from_pointee(OrdSet::new()),
            write_lock: Mutex::new(()),
            synchroniser,
            needs_heartbeat: AtomicBool::new(false),
            heartbeats_sent: AtomicU64::new(0),
            heartbeats_received: AtomicU64::new(0),
            heartbeat: Mutex::new(None),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Push every future message to `peer`.
    ///
    /// Returns `Ok(false)` if `peer` was already registered. Peers should be
    /// listed at construction; a peer the clock does not track yet is only
    /// accepted while this node has neither stored nor received anything,
    /// since tracking it later would pull the watermark back below messages
    /// already reported stable.
    pub fn sync_with(&self, peer: &Arc<TopicNode<T>>) -> Result<bool> {
        self.sync_with_target(Arc::new(LocalPeer::new(peer)))
    }

    /// Push every future message to an arbitrary target.
    pub fn sync_with_target(&self, target: Arc<dyn GossipTarget<T>>) -> Result<bool> {
        let peer = target.id();
        let _guard = self.write_lock.lock();
        let clock = self.clock.load_full();
        let tracked = peer == self.id || clock.peer_entry(peer).is_some();
        if !tracked && clock.local_entry().total_progress() > 0 {
            return Err(TopicError::UnknownPeer(peer));
        }

        let registered = self.synchroniser.sync_with(target)?;
        if registered && !tracked {
            self.clock.store(Arc::new(clock.add(peer)));
        }
        Ok(registered)
    }

    /// Append `value` to the log and push it to every peer.
    pub fn store(&self, value: T) -> Message<T> {
        self.store_payload(Payload::Value(value)).message
    }

    fn store_payload(&self, payload: Payload<T>) -> Envelope<T> {
        let _guard = self.write_lock.lock();

        let clock = Arc::new(self.clock.load().next());
        let message = Message::new(payload, clock.local_entry().clone());
        if !message.is_heartbeat() {
            self.insert(message.clone());
        }
        self.clock.store(Arc::clone(&clock));

        let envelope = Envelope::new(message, clock);
        self.synchroniser.synchronise(&envelope);

        trace!(
            node = %self.id,
            seq = envelope.message.sequence(),
            heartbeat = envelope.message.is_heartbeat(),
            "stored"
        );
        envelope
    }

    /// Merge a peer's envelope. Receiving the same envelope twice is harmless.
    ///
    /// Envelopes from one sender must arrive without holes: one numbered
    /// past the next expected sequence is refused with
    /// `TopicError::SequenceGap` and changes nothing.
    pub fn receive(&self, envelope: Envelope<T>) -> Result<()> {
        let _guard = self.write_lock.lock();

        let current = self.clock.load_full();
        let from = envelope.message.origin();
        let seq = envelope.message.sequence();
        let expected = current.local_entry().get(from) + 1;
        if from != self.id && seq > expected {
            warn!(node = %self.id, from = %from, seq, expected, "refusing out of order envelope");
            return Err(TopicError::SequenceGap {
                node: self.id,
                from,
                expected,
                got: seq,
            });
        }

        let clock = current.update(&envelope.clock);
        let heartbeat = envelope.message.is_heartbeat();
        let inserted = !heartbeat && self.insert(envelope.message);
        self.clock.store(Arc::new(clock));
        self.needs_heartbeat.store(true, Ordering::SeqCst);
        if heartbeat {
            self.heartbeats_received.fetch_add(1, Ordering::SeqCst);
        }

        trace!(node = %self.id, from = %from, seq, inserted, "received");
        Ok(())
    }

    /// Publish a new log containing `message`. Caller holds the write lock.
    fn insert(&self, message: Message<T>) -> bool {
        let log = self.log.load();
        if log.contains(&message) {
            return false;
        }
        let mut next = OrdSet::clone(&log);
        next.insert(message);
        self.log.store(Arc::new(next));
        true
    }

    /// Send a heartbeat if one is owed and the push backlog is small enough.
    ///
    /// Returns whether a heartbeat was stored.
    pub fn heartbeat_tick(&self) -> bool {
        let threshold = self.config.backlog_threshold(self.clock.load().len());
        let backlog = self.synchroniser.queue();
        if backlog >= threshold {
            trace!(node = %self.id, backlog, threshold, "heartbeat held back");
            return false;
        }
        if !self.needs_heartbeat.swap(false, Ordering::SeqCst) {
            return false;
        }

        let envelope = self.store_payload(Payload::Heartbeat);
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
        trace!(node = %self.id, seq = envelope.message.sequence(), "heartbeat sent");
        true
    }

    pub fn needs_heartbeat(&self) -> bool {
        self.needs_heartbeat.load(Ordering::SeqCst)
    }

    /// Start the periodic heartbeat task on the current Tokio runtime.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let runtime = Handle::try_current().map_err(|_| TopicError::NoRuntime)?;

        let mut slot = self.heartbeat.lock();
        if slot.is_some() {
            return Err(TopicError::AlreadyStarted(self.id));
        }

        let (tx, rx) = oneshot::channel();
        runtime.spawn(run_heartbeat(
            Arc::downgrade(self),
            self.config.heartbeat_interval,
            rx,
        ));
        *slot = Some(tx);

        debug!(node = %self.id, interval = ?self.config.heartbeat_interval, "heartbeat started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.heartbeat.lock().is_some()
    }

    /// Stop heartbeats and close every push link.
    pub fn shutdown(&self) {
        if let Some(tx) = self.heartbeat.lock().take() {
            let _ = tx.send(());
        }
        self.synchroniser.close();
        debug!(node = %self.id, "shut down");
    }

    pub fn clock(&self) -> Arc<CompositeClock> {
        self.clock.load_full()
    }

    pub fn local_clock(&self) -> FlatClock {
        self.clock.load().local_entry().clone()
    }

    /// The stability watermark: what every node is known to have seen.
    pub fn lowest_common_clock(&self) -> FlatClock {
        self.clock.load().lowest_common_clock()
    }

    /// Every stable message, in log order, with the watermark used.
    pub fn consistent_snapshot(&self) -> ConsistentRead<T> {
        // clock first: the log published alongside it is at least as new
        let clock = self.clock.load_full();
        let log = self.log.load_full();

        let watermark = clock.lowest_common_clock();
        let messages = log
            .iter()
            .filter(|m| m.is_before(&watermark))
            .cloned()
            .collect();
        ConsistentRead {
            watermark,
            messages,
        }
    }

    /// Messages every node has seen, in log order.
    pub fn consistent_messages(&self) -> Vec<Message<T>> {
        self.consistent_snapshot().messages
    }

    /// Stable messages that `since` had not yet observed.
    pub fn consistent_messages_since(&self, since: &FlatClock) -> Vec<Message<T>> {
        self.consistent_snapshot()
            .messages
            .into_iter()
            .filter(|m| m.is_after(since))
            .collect()
    }

    /// Every message this node holds, stable or not.
    pub fn all_messages(&self) -> Vec<Message<T>> {
        self.log.load().iter().cloned().collect()
    }

    /// Envelopes still waiting to be pushed.
    pub fn backlog(&self) -> usize {
        self.synchroniser.queue()
    }

    /// True once every outgoing push has been delivered.
    pub fn synced(&self) -> bool {
        self.backlog() == 0
    }

    pub fn peers(&self) -> Vec<NodeId> {
        self.synchroniser.peers()
    }

    pub fn stats(&self) -> NodeStats {
        let sync = self.synchroniser.stats();

        NodeStats {
            messages: self.log.load().len(),
            stable_messages: self.consistent_snapshot().messages.len(),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            heartbeats_received: self.heartbeats_received.load(Ordering::SeqCst),
            backlog: sync.backlog,
            peers: sync.peers,
            delivered: sync.delivered,
            retries: sync.retries,
            failed: sync.failed,
        }
    }
}

async fn run_heartbeat<T: TopicValue>(
    node: Weak<TopicNode<T>>,
    period: Duration,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let Some(node) = node.upgrade() else { break };
                node.heartbeat_tick();
            }
        }
    }
    trace!("heartbeat task exiting");
}
