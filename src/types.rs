//! Common types for the discovery core.
//!
//! This module defines the replicated data model: service instances, the
//! identifiers they hang off, and the conflict-resolution strategies that
//! decide between competing replicas. Everything here is plain data with
//! serde derives; behavior lives in the registry and gossip layers.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Metadata key consulted by the priority conflict-resolution strategy.
pub const PRIORITY_METADATA_KEY: &str = "priority";

/// Unique identifier for a node in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Generate a new random node ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a node ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Globally unique identifier of one service instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceId(pub String);

impl ServiceId {
    /// Create a service ID from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ServiceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Replication status of a service entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceStatus {
    /// The entry is live and discoverable.
    Alive,
    /// Evidence for the entry has gone stale; still held, not discoverable.
    Suspect,
    /// The service is gone. Reported to subscribers; stored entries move
    /// straight to `Tombstoned` so stale gossip cannot revive them.
    Dead,
    /// Deregistered. Retained for `tombstone_ttl` to suppress resurrection.
    Tombstoned,
}

impl ServiceStatus {
    /// Whether the entry should appear in discovery results.
    pub fn is_alive(&self) -> bool {
        matches!(self, ServiceStatus::Alive)
    }

    /// Whether the entry is a tombstone.
    pub fn is_tombstoned(&self) -> bool {
        matches!(self, ServiceStatus::Tombstoned)
    }
}

/// One advertised service instance: the unit of replication.
///
/// Only the origin node may mint new versions. A non-origin replica never
/// mutates `version`, `origin_timestamp`, `host`, `port`, or `metadata`;
/// it only updates `last_heard_at` and `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Capability class, e.g. "file-sharing", "tracker", "indexserver".
    pub service_type: String,
    /// Globally unique instance identifier.
    pub service_id: ServiceId,
    /// The node that authoritatively owns this entry.
    pub origin_node_id: NodeId,
    /// Network endpoint of the service.
    pub host: String,
    pub port: u16,
    /// Free-form attributes: advertised filename, size, checksum, ...
    pub metadata: HashMap<String, String>,
    /// Monotonic counter per service id, incremented by the origin.
    pub version: u64,
    /// Wall-clock instant at which the origin produced this version.
    pub origin_timestamp: DateTime<Utc>,
    /// Local wall-clock instant of the most recent evidence for this entry.
    pub last_heard_at: DateTime<Utc>,
    /// Replication status.
    pub status: ServiceStatus,
}

impl ServiceInstance {
    /// The advertised `host:port` endpoint.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Numeric priority from metadata, defaulting to 0.
    ///
    /// Used only by [`ConflictStrategy::Priority`]; unparseable values
    /// count as 0.
    pub fn priority(&self) -> i64 {
        self.metadata
            .get(PRIORITY_METADATA_KEY)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0)
    }

    /// Whether two entries carry identical origin-owned content.
    ///
    /// Version, timestamps, and status are deliberately excluded: this is
    /// the "byte-equal" test that makes `register` idempotent.
    pub fn same_content(&self, other: &ServiceInstance) -> bool {
        self.service_type == other.service_type
            && self.host == other.host
            && self.port == other.port
            && self.metadata == other.metadata
    }
}

/// Process-wide strategy for resolving conflicting replicas.
///
/// Every strategy ends with a lexicographic `origin_node_id` tie-break, so
/// merging two replicas yields the same winner regardless of arrival
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    /// Last-writer-wins: `(origin_timestamp, version, origin_node_id)`.
    Timestamp,
    /// Version-first: `(version, origin_timestamp, origin_node_id)`.
    #[default]
    Composite,
    /// Priority metadata first, then the composite ordering.
    Priority,
}

impl ConflictStrategy {
    /// Whether `remote` strictly beats `local` under this strategy.
    ///
    /// Equal keys mean the remote loses, so a losing replica is never
    /// re-propagated.
    pub fn remote_wins(&self, local: &ServiceInstance, remote: &ServiceInstance) -> bool {
        let ord = match self {
            ConflictStrategy::Timestamp => remote
                .origin_timestamp
                .cmp(&local.origin_timestamp)
                .then(remote.version.cmp(&local.version)),
            ConflictStrategy::Composite => remote
                .version
                .cmp(&local.version)
                .then(remote.origin_timestamp.cmp(&local.origin_timestamp)),
            ConflictStrategy::Priority => remote
                .priority()
                .cmp(&local.priority())
                .then(remote.version.cmp(&local.version))
                .then(remote.origin_timestamp.cmp(&local.origin_timestamp)),
        };
        ord.then_with(|| remote.origin_node_id.cmp(&local.origin_node_id))
            .is_gt()
    }
}

/// Compact per-entry summary exchanged during anti-entropy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DigestEntry {
    pub version: u64,
    pub origin_timestamp: DateTime<Utc>,
    pub status: ServiceStatus,
}

impl DigestEntry {
    /// Summarize a full entry.
    pub fn of(entry: &ServiceInstance) -> Self {
        Self {
            version: entry.version,
            origin_timestamp: entry.origin_timestamp,
            status: entry.status,
        }
    }

    /// Ordering key used when comparing digests.
    pub fn ordering(&self) -> (u64, DateTime<Utc>) {
        (self.version, self.origin_timestamp)
    }
}

/// A registry summary: one [`DigestEntry`] per known service id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryDigest {
    pub entries: HashMap<ServiceId, DigestEntry>,
}

impl RegistryDigest {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn instance(version: u64, ts_millis: i64, node: NodeId) -> ServiceInstance {
        let ts = Utc.timestamp_millis_opt(ts_millis).unwrap();
        ServiceInstance {
            service_type: "file-sharing".into(),
            service_id: ServiceId::new("svc1"),
            origin_node_id: node,
            host: "127.0.0.1".into(),
            port: 9000,
            metadata: HashMap::new(),
            version,
            origin_timestamp: ts,
            last_heard_at: ts,
            status: ServiceStatus::Alive,
        }
    }

    #[test]
    fn node_id_display_is_short() {
        let id = NodeId::new();
        assert_eq!(format!("{id}").len(), 8);
    }

    #[test]
    fn composite_prefers_version_over_timestamp() {
        let a = instance(2, 1_000, NodeId::new());
        let b = instance(1, 9_000, NodeId::new());
        assert!(!ConflictStrategy::Composite.remote_wins(&a, &b));
        assert!(ConflictStrategy::Composite.remote_wins(&b, &a));
    }

    #[test]
    fn timestamp_prefers_later_writer() {
        let a = instance(1, 1_000, NodeId::new());
        let b = instance(1, 9_000, NodeId::new());
        assert!(ConflictStrategy::Timestamp.remote_wins(&a, &b));
        assert!(!ConflictStrategy::Timestamp.remote_wins(&b, &a));
    }

    #[test]
    fn full_ties_break_on_node_id() {
        let n1 = NodeId::from_uuid(Uuid::from_u128(1));
        let n2 = NodeId::from_uuid(Uuid::from_u128(2));
        let a = instance(1, 1_000, n1);
        let b = instance(1, 1_000, n2);
        for strategy in [
            ConflictStrategy::Timestamp,
            ConflictStrategy::Composite,
            ConflictStrategy::Priority,
        ] {
            assert!(strategy.remote_wins(&a, &b), "{strategy:?}");
            assert!(!strategy.remote_wins(&b, &a), "{strategy:?}");
        }
    }

    #[test]
    fn equal_replicas_never_win() {
        let n = NodeId::new();
        let a = instance(3, 5_000, n);
        assert!(!ConflictStrategy::Composite.remote_wins(&a, &a.clone()));
    }

    #[test]
    fn priority_metadata_overrides_version() {
        let mut low = instance(5, 1_000, NodeId::new());
        let mut high = instance(1, 1_000, NodeId::new());
        low.metadata
            .insert(PRIORITY_METADATA_KEY.into(), "1".into());
        high.metadata
            .insert(PRIORITY_METADATA_KEY.into(), "10".into());
        assert!(ConflictStrategy::Priority.remote_wins(&low, &high));
    }

    #[test]
    fn same_content_ignores_version_and_status() {
        let n = NodeId::new();
        let a = instance(1, 1_000, n);
        let mut b = instance(7, 9_000, n);
        b.status = ServiceStatus::Suspect;
        assert!(a.same_content(&b));

        b.port = 9001;
        assert!(!a.same_content(&b));
    }
}
