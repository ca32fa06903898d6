//! Node configuration.

use std::time::Duration;

/// Delay schedule for re-sending an envelope a peer failed to accept.
///
/// Doubles after every failed attempt, capped at `max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(10),
            max: Duration::from_secs(1),
        }
    }
}

impl Backoff {
    /// The delay to use after `current`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }
}

/// Configuration for a topic node.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Period of the heartbeat task started by `TopicNode::start`.
    pub heartbeat_interval: Duration,
    /// Heartbeats are held back while the push backlog is at least
    /// `backlog_factor` times the number of clock entries.
    pub backlog_factor: usize,
    /// Retry schedule for failed pushes.
    pub retry_backoff: Backoff,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(100),
            backlog_factor: 2,
            retry_backoff: Backoff::default(),
        }
    }
}

impl NodeConfig {
    /// Backlog size at which heartbeats are suppressed for a clock of `entries` nodes.
    pub fn backlog_threshold(&self, entries: usize) -> usize {
        self.backlog_factor.saturating_mul(entries)
    }
}

/// Builder for node configuration.
pub struct NodeConfigBuilder {
    config: NodeConfig,
}

impl NodeConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: NodeConfig::default(),
        }
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn heartbeat_interval_ms(self, ms: u64) -> Self {
        self.heartbeat_interval(Duration::from_millis(ms))
    }

    pub fn backlog_factor(mut self, factor: usize) -> Self {
        self.config.backlog_factor = factor;
        self
    }

    pub fn retry_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.config.retry_backoff = Backoff { initial, max };
        self
    }

    pub fn build(self) -> NodeConfig {
        self.config
    }
}

impl Default for NodeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
