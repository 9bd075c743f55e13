//! The replicated service registry.
//!
//! An in-memory map from service id to the current [`ServiceInstance`],
//! shared by the public API, the gossip engine, and the anti-entropy
//! reconciler. Reads are concurrent; writes are serialized per key by the
//! sharded map, so no reader ever observes a half-written entry.
//!
//! Two merge paths exist and they are deliberately different:
//!
//! - [`ServiceRegistry::register`] / [`ServiceRegistry::deregister`] are
//!   origin-only mutations that mint new versions.
//! - [`ServiceRegistry::apply_remote`] merges replicas from the wire and
//!   never invents versions; it resolves conflicts with the process-wide
//!   [`ConflictStrategy`] plus the tombstone rules that give the
//!   no-resurrection guarantee.
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::subscriptions::{ServiceEvent, ServiceTransition, SubscriptionHub};
use crate::types::{
    ConflictStrategy, DigestEntry, NodeId, RegistryDigest, ServiceId, ServiceInstance,
    ServiceStatus,
};

/// Result of merging one remote replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The entry was unknown and has been stored.
    Inserted,
    /// The remote replica won and replaced the local one.
    Updated,
    /// The local replica won; the caller must not re-propagate the remote.
    Unchanged,
}

impl ApplyOutcome {
    /// Whether the merge changed local state (and is worth relaying).
    pub fn changed(&self) -> bool {
        !matches!(self, ApplyOutcome::Unchanged)
    }
}

/// Counters from one eviction sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// ALIVE entries demoted to SUSPECT.
    pub demoted: usize,
    /// SUSPECT entries tombstoned.
    pub tombstoned: usize,
    /// Expired tombstones removed.
    pub removed: usize,
}

/// Point-in-time registry occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub total: usize,
    pub alive: usize,
    pub suspect: usize,
    pub tombstoned: usize,
}

struct StoredEntry {
    instance: ServiceInstance,
    /// Local wall-clock of the last status change; drives the sweeper.
    status_since: DateTime<Utc>,
}

impl StoredEntry {
    fn new(instance: ServiceInstance) -> Self {
        Self {
            instance,
            status_since: Utc::now(),
        }
    }
}

/// The replicated registry shared across all discovery tasks.
pub struct ServiceRegistry {
    local_node: NodeId,
    strategy: ConflictStrategy,
    capacity: Option<usize>,
    entries: DashMap<ServiceId, StoredEntry>,
    hub: Arc<SubscriptionHub>,
}

impl ServiceRegistry {
    pub fn new(
        local_node: NodeId,
        strategy: ConflictStrategy,
        capacity: Option<usize>,
        hub: Arc<SubscriptionHub>,
    ) -> Self {
        Self {
            local_node,
            strategy,
            capacity,
            entries: DashMap::new(),
            hub,
        }
    }

    /// The node that owns this registry.
    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    // ─────────────────────────────────────────────────────────────────────
    // Origin mutations
    // ─────────────────────────────────────────────────────────────────────

    /// Register (or republish) a service owned by this node.
    ///
    /// Re-registering identical content is a no-op that returns the
    /// current entry; any content change mints `version + 1`.
    pub fn register(
        &self,
        service_type: impl Into<String>,
        service_id: ServiceId,
        host: impl Into<String>,
        port: u16,
        metadata: HashMap<String, String>,
    ) -> DiscoveryResult<ServiceInstance> {
        let now = Utc::now();
        let candidate = ServiceInstance {
            service_type: service_type.into(),
            service_id: service_id.clone(),
            origin_node_id: self.local_node,
            host: host.into(),
            port,
            metadata,
            version: 1,
            origin_timestamp: now,
            last_heard_at: now,
            status: ServiceStatus::Alive,
        };

        // Capacity is checked before taking the entry guard; len() walks
        // every shard and must not run while one is write-locked.
        if let Some(capacity) = self.capacity {
            if !self.entries.contains_key(&service_id) && self.entries.len() >= capacity {
                return Err(DiscoveryError::RegistryFull { capacity });
            }
        }

        match self.entries.entry(service_id) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let stored = occupied.get();
                if stored.instance.origin_node_id != self.local_node {
                    return Err(DiscoveryError::invalid(format!(
                        "service '{}' is owned by node {}",
                        stored.instance.service_id, stored.instance.origin_node_id
                    )));
                }
                if stored.instance.status.is_alive() && stored.instance.same_content(&candidate) {
                    return Ok(stored.instance.clone());
                }

                let was_alive = stored.instance.status.is_alive();
                let mut next = candidate;
                next.version = stored.instance.version + 1;
                occupied.insert(StoredEntry::new(next.clone()));
                if !was_alive {
                    self.publish(&next, ServiceTransition::Up);
                }
                Ok(next)
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(StoredEntry::new(candidate.clone()));
                self.publish(&candidate, ServiceTransition::Up);
                Ok(candidate)
            }
        }
    }

    /// Tombstone a service owned by this node, minting a new version.
    ///
    /// Returns the tombstone to gossip, or `None` if the entry was
    /// already tombstoned.
    pub fn deregister(&self, service_id: &ServiceId) -> DiscoveryResult<Option<ServiceInstance>> {
        let mut stored = self
            .entries
            .get_mut(service_id)
            .ok_or_else(|| DiscoveryError::unknown_service(service_id))?;

        if stored.instance.origin_node_id != self.local_node {
            return Err(DiscoveryError::invalid(format!(
                "service '{service_id}' is owned by node {}",
                stored.instance.origin_node_id
            )));
        }
        if stored.instance.status.is_tombstoned() {
            return Ok(None);
        }

        let now = Utc::now();
        stored.instance.version += 1;
        stored.instance.origin_timestamp = now;
        stored.instance.last_heard_at = now;
        stored.instance.status = ServiceStatus::Tombstoned;
        stored.status_since = now;
        let tombstone = stored.instance.clone();
        drop(stored);

        self.publish(&tombstone, ServiceTransition::Down);
        Ok(Some(tombstone))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Replica merging
    // ─────────────────────────────────────────────────────────────────────

    /// Merge a replica received from gossip or anti-entropy.
    pub fn apply_remote(&self, mut remote: ServiceInstance) -> ApplyOutcome {
        let now = Utc::now();
        remote.last_heard_at = now;

        // See register() for why this cannot run under the entry guard.
        if let Some(capacity) = self.capacity {
            if !self.entries.contains_key(&remote.service_id) && self.entries.len() >= capacity {
                tracing::warn!(
                    service = %remote.service_id,
                    capacity,
                    "registry full, dropping remote entry"
                );
                return ApplyOutcome::Unchanged;
            }
        }

        match self.entries.entry(remote.service_id.clone()) {
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                // Unknown tombstones are stored too: that is what makes
                // the no-resurrection guarantee hold for entries this
                // node never saw alive.
                let announce = remote.status.is_alive();
                vacant.insert(StoredEntry::new(remote.clone()));
                if announce {
                    self.publish(&remote, ServiceTransition::Up);
                }
                ApplyOutcome::Inserted
            }
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let local = &occupied.get().instance;

                if self.remote_wins(local, &remote) {
                    let previous = transition_class(local.status);
                    let next = transition_class(remote.status);
                    let status_changed = local.status != remote.status;
                    let mut stored = occupied.get_mut();
                    stored.instance = remote.clone();
                    if status_changed {
                        stored.status_since = now;
                    }
                    drop(stored);
                    if previous != next {
                        self.publish(&remote, next);
                    }
                    ApplyOutcome::Updated
                } else {
                    // The losing replica is still evidence: refresh the
                    // liveness clock, and let an equal ALIVE replica from
                    // the wire clear a local SUSPECT demotion.
                    let mut stored = occupied.get_mut();
                    stored.instance.last_heard_at = now;
                    let revived = stored.instance.status == ServiceStatus::Suspect
                        && remote.status.is_alive()
                        && remote.version == stored.instance.version;
                    if revived {
                        stored.instance.status = ServiceStatus::Alive;
                        stored.status_since = now;
                        let snapshot = stored.instance.clone();
                        drop(stored);
                        self.publish(&snapshot, ServiceTransition::Up);
                    }
                    ApplyOutcome::Unchanged
                }
            }
        }
    }

    /// Conflict resolution: the configured strategy, bracketed by the
    /// tombstone rule.
    ///
    /// A tombstone pins every version at or below its own, whichever side
    /// of the merge it arrives on. The rule is symmetric in the pair, so
    /// merge order never matters, and it subsumes both "a tombstone
    /// supersedes an equal-or-lower live entry" and the no-resurrection
    /// guarantee.
    fn remote_wins(&self, local: &ServiceInstance, remote: &ServiceInstance) -> bool {
        match (local.status.is_tombstoned(), remote.status.is_tombstoned()) {
            (false, true) if remote.version >= local.version => true,
            (true, false) if local.version >= remote.version => false,
            _ => self.strategy.remote_wins(local, remote),
        }
    }

    /// Refresh `last_heard_at` for heartbeat-named entries.
    ///
    /// A heartbeat is direct evidence from the origin, so it also clears
    /// a local SUSPECT demotion. Returns the ids this node does not know,
    /// so the caller can pull them.
    pub fn touch(&self, ids: &[ServiceId]) -> Vec<ServiceId> {
        let now = Utc::now();
        let mut unknown = Vec::new();
        for id in ids {
            match self.entries.get_mut(id) {
                Some(mut stored) => {
                    if stored.instance.status.is_tombstoned() {
                        continue;
                    }
                    stored.instance.last_heard_at = now;
                    if stored.instance.status == ServiceStatus::Suspect {
                        stored.instance.status = ServiceStatus::Alive;
                        stored.status_since = now;
                        let snapshot = stored.instance.clone();
                        drop(stored);
                        self.publish(&snapshot, ServiceTransition::Up);
                    }
                }
                None => unknown.push(id.clone()),
            }
        }
        unknown
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    /// Current entry for a service id, tombstones included.
    pub fn get(&self, service_id: &ServiceId) -> Option<ServiceInstance> {
        self.entries
            .get(service_id)
            .map(|stored| stored.instance.clone())
    }

    /// Whether the service is known and ALIVE.
    pub fn is_healthy(&self, service_id: &ServiceId) -> bool {
        self.entries
            .get(service_id)
            .map(|stored| stored.instance.status.is_alive())
            .unwrap_or(false)
    }

    /// Snapshot of ALIVE entries of one type, optionally filtered by a
    /// metadata predicate.
    pub fn discover(
        &self,
        service_type: &str,
        predicate: Option<&(dyn Fn(&HashMap<String, String>) -> bool)>,
    ) -> Vec<ServiceInstance> {
        self.entries
            .iter()
            .filter(|entry| {
                let inst = &entry.value().instance;
                inst.status.is_alive()
                    && inst.service_type == service_type
                    && predicate.map(|p| p(&inst.metadata)).unwrap_or(true)
            })
            .map(|entry| entry.value().instance.clone())
            .collect()
    }

    /// Compact summary of every known entry, for anti-entropy.
    pub fn snapshot_digest(&self) -> RegistryDigest {
        let entries = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), DigestEntry::of(&entry.value().instance)))
            .collect();
        RegistryDigest { entries }
    }

    /// Compare the local registry against a peer's digest.
    ///
    /// Returns `(to_send, wanted)`: full entries the peer is missing or
    /// holds a losing version of, and ids the peer knows better than us.
    pub fn diff_against(&self, remote: &RegistryDigest) -> (Vec<ServiceInstance>, Vec<ServiceId>) {
        let mut to_send = Vec::new();
        let mut wanted = Vec::new();

        for entry in self.entries.iter() {
            let local = DigestEntry::of(&entry.value().instance);
            match remote.entries.get(entry.key()) {
                None => to_send.push(entry.value().instance.clone()),
                Some(theirs) => {
                    if local.ordering() > theirs.ordering()
                        || (local.ordering() == theirs.ordering()
                            && local.status.is_tombstoned()
                            && !theirs.status.is_tombstoned())
                    {
                        to_send.push(entry.value().instance.clone());
                    } else if theirs.ordering() > local.ordering()
                        || (local.ordering() == theirs.ordering()
                            && theirs.status.is_tombstoned()
                            && !local.status.is_tombstoned())
                    {
                        wanted.push(entry.key().clone());
                    }
                }
            }
        }

        for id in remote.entries.keys() {
            if !self.entries.contains_key(id) {
                wanted.push(id.clone());
            }
        }

        (to_send, wanted)
    }

    /// Full entries for the given ids, in request order where known.
    pub fn entries_for_ids(&self, ids: &[ServiceId]) -> Vec<ServiceInstance> {
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Ids of ALIVE entries originated by this node (heartbeat payload).
    pub fn local_origin_ids(&self) -> Vec<ServiceId> {
        self.entries
            .iter()
            .filter(|entry| {
                let inst = &entry.value().instance;
                inst.origin_node_id == self.local_node && inst.status.is_alive()
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Random ALIVE entries for opportunistic repair gossip.
    pub fn random_alive_sample(&self, count: usize) -> Vec<ServiceInstance> {
        if count == 0 {
            return Vec::new();
        }
        let alive: Vec<ServiceInstance> = self
            .entries
            .iter()
            .filter(|entry| entry.value().instance.status.is_alive())
            .map(|entry| entry.value().instance.clone())
            .collect();
        alive
            .choose_multiple(&mut rand::thread_rng(), count)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for entry in self.entries.iter() {
            stats.total += 1;
            match entry.value().instance.status {
                ServiceStatus::Alive => stats.alive += 1,
                ServiceStatus::Suspect => stats.suspect += 1,
                ServiceStatus::Dead | ServiceStatus::Tombstoned => stats.tombstoned += 1,
            }
        }
        stats
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Demote every ALIVE entry originated by `origin` to SUSPECT.
    /// Called when the failure detector marks that peer FAILED.
    pub fn demote_origin(&self, origin: NodeId) -> usize {
        let ids: Vec<ServiceId> = self
            .entries
            .iter()
            .filter(|entry| {
                let inst = &entry.value().instance;
                inst.origin_node_id == origin && inst.status.is_alive()
            })
            .map(|entry| entry.key().clone())
            .collect();

        let now = Utc::now();
        let mut demoted = 0;
        for id in ids {
            if let Some(mut stored) = self.entries.get_mut(&id) {
                if stored.instance.status.is_alive() {
                    stored.instance.status = ServiceStatus::Suspect;
                    stored.status_since = now;
                    let snapshot = stored.instance.clone();
                    drop(stored);
                    self.publish(&snapshot, ServiceTransition::Degraded);
                    demoted += 1;
                }
            }
        }
        if demoted > 0 {
            tracing::info!(%origin, demoted, "demoted services of failed origin");
        }
        demoted
    }

    /// One eviction pass: stale ALIVE → SUSPECT, old SUSPECT → TOMBSTONED,
    /// expired tombstones → removed. Entries originated by this node are
    /// exempt from demotion.
    pub fn sweep(
        &self,
        alive_ttl: Duration,
        suspect_ttl: Duration,
        tombstone_ttl: Duration,
    ) -> SweepSummary {
        let now = Utc::now();
        let cutoff = |ttl: Duration| {
            now.checked_sub_signed(to_chrono(ttl))
                .unwrap_or(DateTime::<Utc>::MIN_UTC)
        };
        let alive_cutoff = cutoff(alive_ttl);
        let suspect_cutoff = cutoff(suspect_ttl);
        let tombstone_cutoff = cutoff(tombstone_ttl);

        enum Action {
            Demote,
            Tombstone,
            Remove,
        }

        let planned: Vec<(ServiceId, Action)> = self
            .entries
            .iter()
            .filter_map(|entry| {
                let stored = entry.value();
                let inst = &stored.instance;
                match inst.status {
                    ServiceStatus::Alive => {
                        if inst.origin_node_id != self.local_node
                            && inst.last_heard_at < alive_cutoff
                        {
                            Some((entry.key().clone(), Action::Demote))
                        } else {
                            None
                        }
                    }
                    ServiceStatus::Suspect => {
                        if stored.status_since < suspect_cutoff {
                            Some((entry.key().clone(), Action::Tombstone))
                        } else {
                            None
                        }
                    }
                    ServiceStatus::Dead | ServiceStatus::Tombstoned => {
                        if stored.status_since < tombstone_cutoff {
                            Some((entry.key().clone(), Action::Remove))
                        } else {
                            None
                        }
                    }
                }
            })
            .collect();

        let mut summary = SweepSummary::default();
        for (id, action) in planned {
            match action {
                Action::Demote => {
                    if let Some(mut stored) = self.entries.get_mut(&id) {
                        if stored.instance.status.is_alive() {
                            stored.instance.status = ServiceStatus::Suspect;
                            stored.status_since = now;
                            let snapshot = stored.instance.clone();
                            drop(stored);
                            self.publish(&snapshot, ServiceTransition::Degraded);
                            summary.demoted += 1;
                        }
                    }
                }
                Action::Tombstone => {
                    if let Some(mut stored) = self.entries.get_mut(&id) {
                        if stored.instance.status == ServiceStatus::Suspect {
                            stored.instance.status = ServiceStatus::Tombstoned;
                            stored.status_since = now;
                            let snapshot = stored.instance.clone();
                            drop(stored);
                            self.publish(&snapshot, ServiceTransition::Down);
                            summary.tombstoned += 1;
                        }
                    }
                }
                Action::Remove => {
                    if self.entries.remove(&id).is_some() {
                        summary.removed += 1;
                    }
                }
            }
        }

        if summary != SweepSummary::default() {
            tracing::debug!(
                demoted = summary.demoted,
                tombstoned = summary.tombstoned,
                removed = summary.removed,
                "eviction sweep"
            );
        }
        summary
    }

    fn publish(&self, instance: &ServiceInstance, transition: ServiceTransition) {
        self.hub
            .publish(ServiceEvent::new(instance.clone(), transition));
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("local_node", &self.local_node)
            .field("strategy", &self.strategy)
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// Subscriber-facing class of a stored status.
fn transition_class(status: ServiceStatus) -> ServiceTransition {
    match status {
        ServiceStatus::Alive => ServiceTransition::Up,
        ServiceStatus::Suspect => ServiceTransition::Degraded,
        ServiceStatus::Dead | ServiceStatus::Tombstoned => ServiceTransition::Down,
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn registry() -> ServiceRegistry {
        registry_with(ConflictStrategy::Composite, None)
    }

    fn registry_with(strategy: ConflictStrategy, capacity: Option<usize>) -> ServiceRegistry {
        ServiceRegistry::new(
            NodeId::new(),
            strategy,
            capacity,
            Arc::new(SubscriptionHub::new()),
        )
    }

    fn remote_instance(
        id: &str,
        version: u64,
        ts_millis: i64,
        origin: NodeId,
        status: ServiceStatus,
    ) -> ServiceInstance {
        let ts = Utc.timestamp_millis_opt(ts_millis).unwrap();
        ServiceInstance {
            service_type: "file-sharing".into(),
            service_id: ServiceId::new(id),
            origin_node_id: origin,
            host: "10.0.0.1".into(),
            port: 9000,
            metadata: HashMap::new(),
            version,
            origin_timestamp: ts,
            last_heard_at: ts,
            status,
        }
    }

    #[test]
    fn register_starts_at_version_one_and_bumps_on_change() {
        let reg = registry();
        let first = reg
            .register("tracker", ServiceId::new("svc1"), "127.0.0.1", 9000, HashMap::new())
            .unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(first.status, ServiceStatus::Alive);

        // Identical content: idempotent, no version bump.
        let again = reg
            .register("tracker", ServiceId::new("svc1"), "127.0.0.1", 9000, HashMap::new())
            .unwrap();
        assert_eq!(again.version, 1);

        // Changed content: new version.
        let changed = reg
            .register("tracker", ServiceId::new("svc1"), "127.0.0.1", 9001, HashMap::new())
            .unwrap();
        assert_eq!(changed.version, 2);
    }

    #[test]
    fn register_rejects_foreign_ownership() {
        let reg = registry();
        let foreign = remote_instance("svc1", 1, 1_000, NodeId::new(), ServiceStatus::Alive);
        assert_eq!(reg.apply_remote(foreign), ApplyOutcome::Inserted);

        let err = reg
            .register("tracker", ServiceId::new("svc1"), "127.0.0.1", 9000, HashMap::new())
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidArgument { .. }));
    }

    #[test]
    fn register_honors_the_capacity_cap() {
        let reg = registry_with(ConflictStrategy::Composite, Some(1));
        reg.register("tracker", ServiceId::new("svc1"), "h", 1, HashMap::new())
            .unwrap();
        let err = reg
            .register("tracker", ServiceId::new("svc2"), "h", 2, HashMap::new())
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::RegistryFull { capacity: 1 }));
    }

    #[test]
    fn deregister_mints_a_tombstone_version() {
        let reg = registry();
        let id = ServiceId::new("svc1");
        reg.register("tracker", id.clone(), "h", 1, HashMap::new())
            .unwrap();

        let tombstone = reg.deregister(&id).unwrap().unwrap();
        assert_eq!(tombstone.version, 2);
        assert_eq!(tombstone.status, ServiceStatus::Tombstoned);

        // Second deregister is a no-op.
        assert!(reg.deregister(&id).unwrap().is_none());
        // Unknown ids are invalid arguments.
        assert!(reg.deregister(&ServiceId::new("nope")).is_err());
    }

    #[test]
    fn apply_remote_inserts_then_respects_versions() {
        let reg = registry();
        let origin = NodeId::new();

        let v1 = remote_instance("svc1", 1, 1_000, origin, ServiceStatus::Alive);
        assert_eq!(reg.apply_remote(v1.clone()), ApplyOutcome::Inserted);

        let v2 = remote_instance("svc1", 2, 2_000, origin, ServiceStatus::Alive);
        assert_eq!(reg.apply_remote(v2), ApplyOutcome::Updated);

        // Stale replica loses and must not be re-propagated.
        assert_eq!(reg.apply_remote(v1), ApplyOutcome::Unchanged);
        assert_eq!(reg.get(&ServiceId::new("svc1")).unwrap().version, 2);
    }

    #[test]
    fn tombstone_supersedes_equal_version_from_same_origin() {
        let reg = registry();
        let origin = NodeId::new();

        let alive = remote_instance("svc1", 3, 5_000, origin, ServiceStatus::Alive);
        reg.apply_remote(alive);

        let tombstone = remote_instance("svc1", 3, 5_000, origin, ServiceStatus::Tombstoned);
        assert_eq!(reg.apply_remote(tombstone), ApplyOutcome::Updated);
        assert!(reg
            .get(&ServiceId::new("svc1"))
            .unwrap()
            .status
            .is_tombstoned());
    }

    #[test]
    fn no_resurrection_at_or_below_tombstone_version() {
        let reg = registry();
        let origin = NodeId::new();

        let tombstone = remote_instance("svc1", 2, 2_000, origin, ServiceStatus::Tombstoned);
        assert_eq!(reg.apply_remote(tombstone), ApplyOutcome::Inserted);

        // Same or lower version can never come back, even with a newer
        // timestamp.
        let stale = remote_instance("svc1", 2, 9_000, origin, ServiceStatus::Alive);
        assert_eq!(reg.apply_remote(stale), ApplyOutcome::Unchanged);
        let lower = remote_instance("svc1", 1, 9_000, origin, ServiceStatus::Alive);
        assert_eq!(reg.apply_remote(lower), ApplyOutcome::Unchanged);

        // A genuinely newer version (origin re-registered) may.
        let reborn = remote_instance("svc1", 3, 9_500, origin, ServiceStatus::Alive);
        assert_eq!(reg.apply_remote(reborn), ApplyOutcome::Updated);
        assert!(reg.is_healthy(&ServiceId::new("svc1")));
    }

    #[test]
    fn discover_returns_only_alive_matching_entries() {
        let reg = registry();
        let origin = NodeId::new();
        reg.apply_remote(remote_instance("a", 1, 1_000, origin, ServiceStatus::Alive));
        reg.apply_remote(remote_instance("b", 1, 1_000, origin, ServiceStatus::Suspect));
        let mut with_meta = remote_instance("c", 1, 1_000, origin, ServiceStatus::Alive);
        with_meta.metadata.insert("codec".into(), "flac".into());
        reg.apply_remote(with_meta);

        let all = reg.discover("file-sharing", None);
        assert_eq!(all.len(), 2);

        let filtered = reg.discover(
            "file-sharing",
            Some(&|meta: &HashMap<String, String>| meta.get("codec").map(String::as_str) == Some("flac")),
        );
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].service_id, ServiceId::new("c"));

        assert!(reg.discover("tracker", None).is_empty());
    }

    #[test]
    fn heartbeat_touch_revives_suspects_and_reports_unknowns() {
        let reg = registry();
        let origin = NodeId::new();
        reg.apply_remote(remote_instance("a", 1, 1_000, origin, ServiceStatus::Suspect));

        let unknown = reg.touch(&[ServiceId::new("a"), ServiceId::new("ghost")]);
        assert_eq!(unknown, vec![ServiceId::new("ghost")]);
        assert!(reg.is_healthy(&ServiceId::new("a")));
    }

    #[test]
    fn sweep_walks_the_lifecycle() {
        let reg = registry();
        let origin = NodeId::new();
        let old = remote_instance("a", 1, 1_000, origin, ServiceStatus::Alive);
        reg.apply_remote(old);
        // Backdate the evidence so the entry looks stale.
        {
            let mut stored = reg.entries.get_mut(&ServiceId::new("a")).unwrap();
            stored.instance.last_heard_at = Utc::now() - chrono::Duration::seconds(120);
        }

        let pass = reg.sweep(
            Duration::from_secs(60),
            Duration::from_secs(60),
            Duration::from_secs(600),
        );
        assert_eq!(pass.demoted, 1);
        assert_eq!(reg.get(&ServiceId::new("a")).unwrap().status, ServiceStatus::Suspect);

        // Backdate the suspect transition; next sweep tombstones.
        {
            let mut stored = reg.entries.get_mut(&ServiceId::new("a")).unwrap();
            stored.status_since = Utc::now() - chrono::Duration::seconds(120);
        }
        let pass = reg.sweep(
            Duration::from_secs(60),
            Duration::from_secs(60),
            Duration::from_secs(600),
        );
        assert_eq!(pass.tombstoned, 1);

        // Backdate the tombstone; next sweep removes.
        {
            let mut stored = reg.entries.get_mut(&ServiceId::new("a")).unwrap();
            stored.status_since = Utc::now() - chrono::Duration::seconds(1_200);
        }
        let pass = reg.sweep(
            Duration::from_secs(60),
            Duration::from_secs(60),
            Duration::from_secs(600),
        );
        assert_eq!(pass.removed, 1);
        assert!(reg.get(&ServiceId::new("a")).is_none());
    }

    #[test]
    fn sweep_never_demotes_local_origin_entries() {
        let reg = registry();
        let id = ServiceId::new("mine");
        reg.register("tracker", id.clone(), "h", 1, HashMap::new())
            .unwrap();
        {
            let mut stored = reg.entries.get_mut(&id).unwrap();
            stored.instance.last_heard_at = Utc::now() - chrono::Duration::seconds(3_600);
        }
        let pass = reg.sweep(
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(600),
        );
        assert_eq!(pass.demoted, 0);
        assert!(reg.is_healthy(&id));
    }

    #[test]
    fn demote_origin_suspects_everything_from_that_node() {
        let reg = registry();
        let failed = NodeId::new();
        let healthy = NodeId::new();
        reg.apply_remote(remote_instance("a", 1, 1_000, failed, ServiceStatus::Alive));
        reg.apply_remote(remote_instance("b", 1, 1_000, failed, ServiceStatus::Alive));
        reg.apply_remote(remote_instance("c", 1, 1_000, healthy, ServiceStatus::Alive));

        assert_eq!(reg.demote_origin(failed), 2);
        assert_eq!(reg.get(&ServiceId::new("a")).unwrap().status, ServiceStatus::Suspect);
        assert!(reg.is_healthy(&ServiceId::new("c")));
    }

    #[test]
    fn digest_diff_is_symmetric() {
        let reg_a = registry();
        let reg_b = registry();
        let origin = NodeId::new();

        reg_a.apply_remote(remote_instance("both", 2, 2_000, origin, ServiceStatus::Alive));
        reg_b.apply_remote(remote_instance("both", 1, 1_000, origin, ServiceStatus::Alive));
        reg_a.apply_remote(remote_instance("only_a", 1, 1_000, origin, ServiceStatus::Alive));
        reg_b.apply_remote(remote_instance("only_b", 1, 1_000, origin, ServiceStatus::Alive));

        let (to_send, wanted) = reg_a.diff_against(&reg_b.snapshot_digest());
        let sent_ids: Vec<_> = to_send.iter().map(|e| e.service_id.clone()).collect();
        assert!(sent_ids.contains(&ServiceId::new("both")));
        assert!(sent_ids.contains(&ServiceId::new("only_a")));
        assert_eq!(wanted, vec![ServiceId::new("only_b")]);
    }

    proptest! {
        /// Merging two replicas converges to the same entry regardless of
        /// arrival order, for every strategy.
        #[test]
        fn apply_remote_is_order_independent(
            version_a in 1u64..4,
            version_b in 1u64..4,
            ts_a in 0i64..4,
            ts_b in 0i64..4,
            origin_a in 1u128..4,
            origin_b in 1u128..4,
            tomb_a in proptest::bool::ANY,
            tomb_b in proptest::bool::ANY,
            strategy in prop_oneof![
                Just(ConflictStrategy::Timestamp),
                Just(ConflictStrategy::Composite),
                Just(ConflictStrategy::Priority),
            ],
        ) {
            let status_a = if tomb_a { ServiceStatus::Tombstoned } else { ServiceStatus::Alive };
            let status_b = if tomb_b { ServiceStatus::Tombstoned } else { ServiceStatus::Alive };
            let a = remote_instance(
                "svc", version_a, ts_a,
                NodeId::from_uuid(Uuid::from_u128(origin_a)), status_a,
            );
            let b = remote_instance(
                "svc", version_b, ts_b,
                NodeId::from_uuid(Uuid::from_u128(origin_b)), status_b,
            );

            let forward = registry_with(strategy, None);
            forward.apply_remote(a.clone());
            forward.apply_remote(b.clone());

            let reverse = registry_with(strategy, None);
            reverse.apply_remote(b);
            reverse.apply_remote(a);

            let f = forward.get(&ServiceId::new("svc")).unwrap();
            let r = reverse.get(&ServiceId::new("svc")).unwrap();
            prop_assert_eq!(f.version, r.version);
            prop_assert_eq!(f.origin_timestamp, r.origin_timestamp);
            prop_assert_eq!(f.origin_node_id, r.origin_node_id);
            prop_assert_eq!(f.status, r.status);
        }
    }
}
