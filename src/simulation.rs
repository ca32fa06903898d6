use async_stream::stream;
use dtopic_node::{full_mesh, shutdown_all, start_all, NodeConfig, NodeConfigBuilder, TopicError, TopicNode};
use futures::stream::Stream;
use futures::stream::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

/// Parameters for one simulated cluster run.
#[derive(Clone, Debug)]
pub struct SimulationConfig {
    pub nodes: u32,
    pub producers: usize,
    pub inserts_per_producer: usize,
    /// Upper bound (exclusive) of the random pause after each insert.
    pub max_delay_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// How long to wait for replication and for stability, each.
    pub timeout_secs: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            nodes: 4,
            producers: 10,
            inserts_per_producer: 10,
            max_delay_ms: 10,
            heartbeat_interval_ms: 10,
            timeout_secs: 30,
        }
    }
}

impl SimulationConfig {
    pub fn total_messages(&self) -> usize {
        self.producers * self.inserts_per_producer
    }

    fn node_config(&self) -> NodeConfig {
        NodeConfigBuilder::new()
            .heartbeat_interval_ms(self.heartbeat_interval_ms)
            .build()
    }
}

/// Builder for simulation parameters.
pub struct SimulationConfigBuilder {
    config: SimulationConfig,
}

impl SimulationConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SimulationConfig::default(),
        }
    }

    pub fn nodes(mut self, nodes: u32) -> Self {
        self.config.nodes = nodes;
        self
    }

    pub fn producers(mut self, producers: usize) -> Self {
        self.config.producers = producers;
        self
    }

    pub fn inserts_per_producer(mut self, inserts: usize) -> Self {
        self.config.inserts_per_producer = inserts;
        self
    }

    pub fn max_delay_ms(mut self, ms: u64) -> Self {
        self.config.max_delay_ms = ms;
        self
    }

    pub fn heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.config.heartbeat_interval_ms = ms;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.config.timeout_secs = secs;
        self
    }

    pub fn build(self) -> SimulationConfig {
        self.config
    }
}

impl Default for SimulationConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("a simulation needs at least one node")]
    EmptyCluster,

    #[error("cluster setup failed: {0}")]
    Topic(#[from] TopicError),

    #[error("timed out after {secs}s waiting for {stage}")]
    Timeout { stage: &'static str, secs: u64 },

    #[error("producer task failed: {0}")]
    Producer(#[from] tokio::task::JoinError),

    #[error("{node} holds {held} distinct values, expected {expected}")]
    Diverged {
        node: String,
        held: usize,
        expected: usize,
    },
}

/// Statistics collected during a simulation run
#[derive(Clone, Debug)]
pub struct SimulationStats {
    pub nodes: u32,
    pub producers: usize,
    pub total_messages: usize,
    pub heartbeats_sent: u64,
    pub pushes_delivered: u64,
    pub pushes_failed: u64,
    pub produce_time: Duration,
    pub replication_time: Duration,
    pub stabilisation_time: Duration,
    pub total_time: Duration,
}

impl SimulationStats {
    pub fn inserts_per_second(&self) -> f64 {
        self.total_messages as f64 / self.produce_time.as_secs_f64().max(f64::EPSILON)
    }

    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Topic Simulation Statistics                   ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Nodes:                     {:>30} ║", self.nodes);
        println!("║  Producers:                 {:>30} ║", self.producers);
        println!("║  Messages Stored:           {:>30} ║", self.total_messages);
        println!("║  Heartbeats Sent:           {:>30} ║", self.heartbeats_sent);
        println!("║  Pushes Delivered:          {:>30} ║", self.pushes_delivered);
        println!("║  Pushes Failed:             {:>30} ║", self.pushes_failed);
        println!("║  Produce Time:              {:>29}s ║", format!("{:.3}", self.produce_time.as_secs_f64()));
        println!("║  Replication Time:          {:>29}s ║", format!("{:.3}", self.replication_time.as_secs_f64()));
        println!("║  Stabilisation Time:        {:>29}s ║", format!("{:.3}", self.stabilisation_time.as_secs_f64()));
        println!("║  Total Time:                {:>29}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("║  Inserts/Second:            {:>30.0} ║", self.inserts_per_second());
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

/// Generator that yields (target node index, pause) for each insert of one producer
fn producer_schedule(
    num_nodes: usize,
    inserts: usize,
    max_delay_ms: u64,
) -> impl Stream<Item = (usize, Duration)> {
    stream! {
        let mut rng = StdRng::from_entropy();
        for _ in 0..inserts {
            let target = rng.gen_range(0..num_nodes);
            let delay = if max_delay_ms == 0 { 0 } else { rng.gen_range(0..max_delay_ms) };
            yield (target, Duration::from_millis(delay));
        }
    }
}

async fn wait_until(
    stage: &'static str,
    secs: u64,
    condition: impl Fn() -> bool,
) -> Result<Duration, SimulationError> {
    let start = Instant::now();
    tokio::time::timeout(Duration::from_secs(secs), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .map_err(|_| SimulationError::Timeout { stage, secs })?;
    Ok(start.elapsed())
}

fn verify(nodes: &[Arc<TopicNode<u64>>], expected: usize) -> Result<(), SimulationError> {
    for node in nodes {
        let held: BTreeSet<u64> = node
            .all_messages()
            .iter()
            .filter_map(|m| m.value().copied())
            .collect();
        if !held.iter().copied().eq(1..=expected as u64) {
            return Err(SimulationError::Diverged {
                node: node.id().to_string(),
                held: held.len(),
                expected,
            });
        }
    }
    Ok(())
}

/// Build a full mesh, run concurrent producers storing 1..=N on random
/// nodes, then wait for every node to hold and stabilise every value.
pub async fn run_simulation(config: &SimulationConfig) -> Result<SimulationStats, SimulationError> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Topic Simulation                                    ║");
    println!("║  Nodes: {} | Producers: {} | Inserts/Producer: {} ║",
             config.nodes, config.producers, config.inserts_per_producer);
    println!("╚════════════════════════════════════════════════════════════╝");

    if config.nodes == 0 {
        return Err(SimulationError::EmptyCluster);
    }
    let start = Instant::now();
    let total = config.total_messages();

    let nodes = full_mesh::<u64>(config.nodes, config.node_config())?;
    start_all(&nodes)?;
    info!(nodes = nodes.len(), "cluster started");

    println!("\n[Phase 1/3] Producing values...");

    // Phase 1: concurrent producers
    let counter = Arc::new(AtomicU64::new(0));
    let mut handles = vec![];
    for producer in 0..config.producers {
        let nodes = nodes.clone();
        let counter = Arc::clone(&counter);
        let mut schedule = Box::pin(producer_schedule(
            nodes.len(),
            config.inserts_per_producer,
            config.max_delay_ms,
        ));
        handles.push(tokio::spawn(async move {
            while let Some((target, delay)) = schedule.next().await {
                let value = counter.fetch_add(1, Ordering::SeqCst) + 1;
                let message = nodes[target].store(value);
                debug!(producer, node = %message.origin(), value, "stored");
                tokio::time::sleep(delay).await;
            }
        }));
    }
    for handle in handles {
        handle.await?;
    }
    let produce_time = start.elapsed();

    println!("[Phase 1/3] ✓ Completed");
    println!("[Phase 2/3] Waiting for replication...");

    // Phase 2: every node holds every value
    let replication_time = wait_until("replication", config.timeout_secs, || {
        nodes.iter().all(|n| n.all_messages().len() == total)
    })
    .await?;
    verify(&nodes, total)?;

    println!("[Phase 2/3] ✓ Completed");
    println!("[Phase 3/3] Waiting for stability...");

    // Phase 3: every value is stable everywhere
    let stabilisation_time = wait_until("stability", config.timeout_secs, || {
        nodes.iter().all(|n| n.consistent_messages().len() == total)
    })
    .await?;

    println!("[Phase 3/3] ✓ Completed");

    shutdown_all(&nodes);
    let node_stats: Vec<_> = nodes.iter().map(|n| n.stats()).collect();

    Ok(SimulationStats {
        nodes: config.nodes,
        producers: config.producers,
        total_messages: total,
        heartbeats_sent: node_stats.iter().map(|s| s.heartbeats_sent).sum(),
        pushes_delivered: node_stats.iter().map(|s| s.delivered).sum(),
        pushes_failed: node_stats.iter().map(|s| s.failed).sum(),
        produce_time,
        replication_time,
        stabilisation_time,
        total_time: start.elapsed(),
    })
}
