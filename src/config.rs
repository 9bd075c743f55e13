//! Configuration for a discovery node.
//!
//! The core accepts one plain configuration record at construction;
//! loading it from files, environment variables, or CLI flags is the
//! embedding application's concern. All fields are public: construct
//! with [`DiscoveryConfig::new`] and adjust, or chain the builder
//! methods for the commonly tuned knobs.
use std::net::SocketAddr;
use std::time::Duration;

use crate::breaker::{BreakerSettings, RetryPolicy};
use crate::types::ConflictStrategy;

/// Default TCP port for gossip traffic.
pub const DEFAULT_PORT: u16 = 7946;

/// Configuration record for a [`DiscoveryNode`](crate::node::DiscoveryNode).
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Address to bind for inbound gossip.
    pub bind_addr: SocketAddr,
    /// Initial peer addresses used to join the mesh.
    pub bootstrap_peers: Vec<SocketAddr>,

    /// Period of the outbound gossip round.
    pub gossip_interval: Duration,
    /// Peers contacted per gossip round.
    pub fanout: usize,
    /// Initial `hops_remaining` on locally originated messages.
    pub message_ttl_hops: u32,
    /// Messages older than this are dropped on receipt.
    pub message_max_age: Duration,
    /// Random ALIVE entries re-gossiped per round for opportunistic repair.
    pub repair_sample_size: usize,
    /// Bound on the outbound queue; excess is coalesced then dropped oldest.
    pub max_queue_size: usize,
    /// Bound on the inbound message-id deduplication set.
    pub dedup_capacity: usize,

    /// Period of the anti-entropy reconciler.
    pub anti_entropy_interval: Duration,
    /// Deadline for one full reconciliation round.
    pub reconciliation_timeout: Duration,

    /// ALIVE entries not heard from for this long become SUSPECT.
    pub entry_alive_ttl: Duration,
    /// SUSPECT entries are tombstoned after this long in that state.
    pub entry_suspect_ttl: Duration,
    /// Tombstones are garbage-collected after this long.
    pub tombstone_ttl: Duration,
    /// Period of the eviction sweeper.
    pub eviction_interval: Duration,
    /// Optional hard cap on registry entries.
    pub max_registry_entries: Option<usize>,

    /// Consecutive failures before a peer is SUSPECT.
    pub suspect_threshold: u32,
    /// Consecutive failures before a peer is FAILED.
    pub failed_threshold: u32,
    /// Probe period for FAILED peers.
    pub failed_probe_interval: Duration,

    /// Consecutive breaker-countable failures before a breaker opens.
    pub failure_threshold: u32,
    /// Consecutive half-open successes before a breaker closes.
    pub success_threshold: u32,
    /// How long an open breaker rejects calls before going half-open.
    pub reset_timeout: Duration,
    /// Hard deadline on every outbound network call.
    pub network_timeout: Duration,

    /// Attempts per outbound operation (including the first).
    pub max_retries: u32,
    /// Base of the exponential backoff between attempts.
    pub initial_backoff: Duration,
    /// Ceiling on the backoff.
    pub max_backoff: Duration,

    /// Process-wide conflict-resolution strategy.
    pub conflict_resolution: ConflictStrategy,

    /// How long `stop()` waits for tasks before aborting them.
    pub shutdown_grace: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            bootstrap_peers: Vec::new(),

            gossip_interval: Duration::from_secs(1),
            fanout: 3,
            message_ttl_hops: 3,
            message_max_age: Duration::from_secs(30),
            repair_sample_size: 3,
            max_queue_size: 1024,
            dedup_capacity: 4096,

            anti_entropy_interval: Duration::from_secs(30),
            reconciliation_timeout: Duration::from_secs(5),

            entry_alive_ttl: Duration::from_secs(30),
            entry_suspect_ttl: Duration::from_secs(30),
            tombstone_ttl: Duration::from_secs(600),
            eviction_interval: Duration::from_secs(5),
            max_registry_entries: None,

            suspect_threshold: 3,
            failed_threshold: 6,
            failed_probe_interval: Duration::from_secs(30),

            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            network_timeout: Duration::from_secs(3),

            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),

            conflict_resolution: ConflictStrategy::default(),

            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl DiscoveryConfig {
    /// Create a config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Seed the peer table with bootstrap addresses.
    pub fn bootstrap(mut self, peers: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.bootstrap_peers = peers.into_iter().collect();
        self
    }

    /// Set the outbound gossip round period.
    pub fn gossip_interval(mut self, interval: Duration) -> Self {
        self.gossip_interval = interval;
        self
    }

    /// Set the gossip fan-out.
    pub fn fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout;
        self
    }

    /// Set the anti-entropy period.
    pub fn anti_entropy_interval(mut self, interval: Duration) -> Self {
        self.anti_entropy_interval = interval;
        self
    }

    /// Set the conflict-resolution strategy.
    pub fn conflict_resolution(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_resolution = strategy;
        self
    }

    /// Set the registry lifecycle TTLs in one call.
    pub fn entry_ttls(mut self, alive: Duration, suspect: Duration, tombstone: Duration) -> Self {
        self.entry_alive_ttl = alive;
        self.entry_suspect_ttl = suspect;
        self.tombstone_ttl = tombstone;
        self
    }

    /// Breaker settings bundle for per-peer circuit breakers.
    pub fn breaker_settings(&self) -> BreakerSettings {
        BreakerSettings::new(
            self.failure_threshold,
            self.success_threshold,
            self.reset_timeout,
        )
    }

    /// Retry policy bundle for outbound operations.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.initial_backoff, self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.bind_addr.port(), DEFAULT_PORT);
        assert!(config.bootstrap_peers.is_empty());
        assert!(config.fanout > 0);
        assert!(config.entry_alive_ttl < config.tombstone_ttl);
        assert!(config.suspect_threshold < config.failed_threshold);
    }

    #[test]
    fn builder_methods_chain() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let seed: SocketAddr = "10.0.0.1:7946".parse().unwrap();
        let config = DiscoveryConfig::new()
            .bind_addr(addr)
            .bootstrap([seed])
            .fanout(5)
            .gossip_interval(Duration::from_millis(250))
            .conflict_resolution(crate::types::ConflictStrategy::Timestamp);

        assert_eq!(config.bind_addr, addr);
        assert_eq!(config.bootstrap_peers, vec![seed]);
        assert_eq!(config.fanout, 5);
        assert_eq!(config.gossip_interval, Duration::from_millis(250));
    }
}
