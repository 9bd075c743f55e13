//! The anti-entropy reconciler.
//!
//! Random push gossip loses races: a node that was partitioned, or simply
//! unlucky in peer selection, can miss updates forever. Every
//! `anti_entropy_interval` the reconciler picks one healthy peer, swaps
//! registry digests, and transfers exactly the entries each side is
//! missing or holds a losing version of. One successful exchange leaves
//! both registries identical modulo entries neither side has learned yet.
//!
//! The same digest machinery doubles as the bootstrap join: with an empty
//! peer table the reconciler dials a configured bootstrap address, and
//! the response frames teach us the responder's identity.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::gossip::GossipEngine;
use crate::network::{Connection, GossipMessage, Payload};
use crate::peers::{PeerTable, PeerTarget};
use crate::registry::ServiceRegistry;
use crate::types::{NodeId, RegistryDigest, ServiceId, ServiceInstance};

/// Timing knobs for the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Deadline for one full exchange.
    pub reconciliation_timeout: Duration,
}

/// What one exchange moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Entries received and applied locally.
    pub pulled: usize,
    /// Entries sent to satisfy the peer's request.
    pub pushed: usize,
}

/// Background reconciler closing the gaps gossip missed.
pub struct Reconciler {
    settings: ReconcilerSettings,
    registry: Arc<ServiceRegistry>,
    peers: Arc<PeerTable>,
    engine: Arc<GossipEngine>,
    bootstrap: Vec<SocketAddr>,
}

impl Reconciler {
    pub fn new(
        settings: ReconcilerSettings,
        registry: Arc<ServiceRegistry>,
        peers: Arc<PeerTable>,
        engine: Arc<GossipEngine>,
        bootstrap: Vec<SocketAddr>,
    ) -> Self {
        Self {
            settings,
            registry,
            peers,
            engine,
            bootstrap,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Initiator side
    // ─────────────────────────────────────────────────────────────────────

    /// One reconciliation round: pick a random healthy peer and exchange.
    /// Falls back to a bootstrap address when no healthy peer is known.
    pub async fn run_round(&self) {
        if let Some(target) = self.peers.random_healthy() {
            self.exchange_with_peer(target).await;
        } else if let Some(addr) = self.random_bootstrap() {
            match self.exchange(addr).await {
                Ok(outcome) => {
                    tracing::info!(%addr, ?outcome, "bootstrap reconciliation complete")
                }
                Err(err) => {
                    tracing::debug!(%addr, error = %err, "bootstrap reconciliation failed")
                }
            }
        }
    }

    fn random_bootstrap(&self) -> Option<SocketAddr> {
        self.bootstrap.choose(&mut rand::thread_rng()).copied()
    }

    /// Run one immediate exchange against an explicit address. Used for
    /// `DiscoveryNode::join` and by tests healing a partition on demand.
    pub async fn sync_with(&self, addr: SocketAddr) -> DiscoveryResult<ReconcileOutcome> {
        tokio::time::timeout(self.settings.reconciliation_timeout, self.exchange(addr))
            .await
            .unwrap_or_else(|_| Err(DiscoveryError::transient(addr, "reconciliation timed out")))
    }

    async fn exchange_with_peer(&self, target: PeerTarget) {
        let address = target.address;
        let deadline = self.settings.reconciliation_timeout;
        let result = target
            .breaker
            .call(self.engine.retry(), || async move {
                tokio::time::timeout(deadline, self.exchange(address))
                    .await
                    .unwrap_or_else(|_| {
                        Err(DiscoveryError::transient(address, "reconciliation timed out"))
                    })
            })
            .await;

        match result {
            Ok(outcome) => {
                self.peers.record_success(target.node_id);
                if outcome != ReconcileOutcome::default() {
                    tracing::debug!(peer = %target.node_id, ?outcome, "anti-entropy exchange");
                }
            }
            Err(err) => {
                // Breaker open means an empty reconciliation this round;
                // either way the failure detector hears about it.
                tracing::debug!(peer = %target.node_id, error = %err, "anti-entropy failed");
                self.engine.note_peer_failure(target.node_id);
            }
        }
    }

    /// Run the initiator side of the digest protocol against `addr`.
    async fn exchange(&self, addr: SocketAddr) -> DiscoveryResult<ReconcileOutcome> {
        let node = self.registry.local_node();
        let sender_addr = self.engine.sender_addr();

        let mut conn = Connection::connect(addr).await?;
        let digest = GossipMessage::new(
            node,
            sender_addr,
            0,
            Payload::AntiEntropyDigest(self.registry.snapshot_digest()),
        );
        let response = conn.request(&digest).await?;

        match response.payload {
            Payload::AntiEntropyResponse { entries, wanted } => {
                self.peers.observe(response.sender, response.sender_addr);

                let mut pulled = 0;
                for instance in entries {
                    if self.registry.apply_remote(instance).changed() {
                        pulled += 1;
                    }
                }

                let mut pushed = 0;
                if !wanted.is_empty() {
                    let requested = self.registry.entries_for_ids(&wanted);
                    pushed = requested.len();
                    conn.send(&GossipMessage::new(
                        node,
                        sender_addr,
                        0,
                        Payload::AntiEntropyResponse {
                            entries: requested,
                            wanted: Vec::new(),
                        },
                    ))
                    .await?;
                }

                Ok(ReconcileOutcome { pulled, pushed })
            }
            other => Err(DiscoveryError::ProtocolDecode {
                peer: addr,
                detail: format!("expected anti-entropy response, got {:?}", other.kind()),
            }),
        }
    }

    /// Pull full entries for ids a heartbeat named but this node lacks.
    pub async fn pull_from(&self, peer: NodeId, addr: SocketAddr, ids: Vec<ServiceId>) {
        if ids.is_empty() {
            return;
        }
        let op = || {
            let ids = ids.clone();
            async move {
                tokio::time::timeout(self.settings.reconciliation_timeout, async {
                    let node = self.registry.local_node();
                    let sender_addr = self.engine.sender_addr();
                    let mut conn = Connection::connect(addr).await?;
                    let response = conn
                        .request(&GossipMessage::new(
                            node,
                            sender_addr,
                            0,
                            Payload::AntiEntropyRequest(ids),
                        ))
                        .await?;
                    match response.payload {
                        Payload::AntiEntropyResponse { entries, .. } => {
                            let mut pulled = 0;
                            for instance in entries {
                                if self.registry.apply_remote(instance).changed() {
                                    pulled += 1;
                                }
                            }
                            Ok(pulled)
                        }
                        other => Err(DiscoveryError::ProtocolDecode {
                            peer: addr,
                            detail: format!("expected pull response, got {:?}", other.kind()),
                        }),
                    }
                })
                .await
                .unwrap_or_else(|_| Err(DiscoveryError::transient(addr, "pull timed out")))
            }
        };

        let result = match self.peers.breaker_for(peer) {
            Some(breaker) => breaker.call(self.engine.retry(), op).await,
            None => op().await,
        };

        match result {
            Ok(pulled) => {
                self.peers.record_success(peer);
                tracing::debug!(%peer, pulled, "pulled heartbeat-named entries");
            }
            Err(err) => {
                tracing::debug!(%peer, error = %err, "heartbeat pull failed");
                self.engine.note_peer_failure(peer);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Responder side
    // ─────────────────────────────────────────────────────────────────────

    /// Answer an inbound digest: full entries the initiator needs, plus
    /// the ids we want back from it.
    pub fn handle_digest(&self, remote: &RegistryDigest) -> (Vec<ServiceInstance>, Vec<ServiceId>) {
        self.registry.diff_against(remote)
    }

    /// Apply an inbound response's entries; returns the follow-up entries
    /// if the sender asked for any.
    pub fn handle_response(
        &self,
        entries: Vec<ServiceInstance>,
        wanted: &[ServiceId],
    ) -> Option<Vec<ServiceInstance>> {
        for instance in entries {
            self.registry.apply_remote(instance);
        }
        if wanted.is_empty() {
            None
        } else {
            Some(self.registry.entries_for_ids(wanted))
        }
    }

    /// Full entries for an inbound pull request.
    pub fn handle_request(&self, ids: &[ServiceId]) -> Vec<ServiceInstance> {
        self.registry.entries_for_ids(ids)
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("bootstrap", &self.bootstrap)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerSettings, RetryPolicy};
    use crate::gossip::GossipSettings;
    use crate::peers::DetectorSettings;
    use crate::subscriptions::SubscriptionHub;
    use crate::types::{ConflictStrategy, ServiceStatus};
    use chrono::Utc;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::OnceLock;

    fn harness() -> (Reconciler, Arc<ServiceRegistry>) {
        let node = NodeId::new();
        let hub = Arc::new(SubscriptionHub::new());
        let registry = Arc::new(ServiceRegistry::new(
            node,
            ConflictStrategy::Composite,
            None,
            hub,
        ));
        let peers = Arc::new(PeerTable::new(
            node,
            DetectorSettings {
                suspect_threshold: 2,
                failed_threshold: 3,
            },
            BreakerSettings::new(5, 2, Duration::from_secs(30)),
        ));
        let engine = Arc::new(GossipEngine::new(
            GossipSettings {
                fanout: 3,
                message_ttl_hops: 3,
                message_max_age: Duration::from_secs(30),
                repair_sample_size: 0,
                network_timeout: Duration::from_millis(200),
                max_queue_size: 16,
                dedup_capacity: 16,
            },
            RetryPolicy::none(),
            Arc::clone(&registry),
            Arc::clone(&peers),
            Arc::new(OnceLock::new()),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        ));
        let reconciler = Reconciler::new(
            ReconcilerSettings {
                reconciliation_timeout: Duration::from_secs(1),
            },
            Arc::clone(&registry),
            peers,
            engine,
            Vec::new(),
        );
        (reconciler, registry)
    }

    fn instance(id: &str, version: u64, status: ServiceStatus) -> ServiceInstance {
        let now = Utc::now();
        ServiceInstance {
            service_type: "file-sharing".into(),
            service_id: ServiceId::new(id),
            origin_node_id: NodeId::new(),
            host: "10.0.0.1".into(),
            port: 9000,
            metadata: HashMap::new(),
            version,
            origin_timestamp: now,
            last_heard_at: now,
            status,
        }
    }

    /// Drive the digest protocol between two in-process registries, the
    /// way the wire would, and check both sides converge.
    #[test]
    fn digest_protocol_converges_both_sides() {
        let (initiator, reg_a) = harness();
        let (responder, reg_b) = harness();

        let only_a = instance("only_a", 1, ServiceStatus::Alive);
        let only_b = instance("only_b", 1, ServiceStatus::Alive);
        let tombstone = instance("gone", 2, ServiceStatus::Tombstoned);
        reg_a.apply_remote(only_a.clone());
        reg_b.apply_remote(only_b.clone());
        reg_b.apply_remote(tombstone.clone());

        // Initiator sends its digest; responder answers with entries and
        // a want-list.
        let digest_a = reg_a.snapshot_digest();
        let (entries, wanted) = responder.handle_digest(&digest_a);

        // Initiator applies and satisfies the want-list.
        let follow_up = initiator.handle_response(entries, &wanted);

        // Responder applies the follow-up.
        if let Some(follow_up) = follow_up {
            responder.handle_response(follow_up, &[]);
        }

        assert!(reg_a.is_healthy(&ServiceId::new("only_b")));
        assert!(reg_b.is_healthy(&ServiceId::new("only_a")));
        assert!(reg_a
            .get(&ServiceId::new("gone"))
            .unwrap()
            .status
            .is_tombstoned());

        // Registries now agree entry-for-entry.
        let digest_a = reg_a.snapshot_digest();
        let digest_b = reg_b.snapshot_digest();
        assert_eq!(digest_a.len(), digest_b.len());
        for (id, entry) in &digest_a.entries {
            let other = digest_b.entries.get(id).expect("missing id");
            assert_eq!(entry.ordering(), other.ordering());
            assert_eq!(entry.status, other.status);
        }
    }

    #[test]
    fn handle_request_returns_known_entries_only() {
        let (reconciler, registry) = harness();
        registry.apply_remote(instance("known", 1, ServiceStatus::Alive));

        let entries =
            reconciler.handle_request(&[ServiceId::new("known"), ServiceId::new("ghost")]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].service_id, ServiceId::new("known"));
    }
}
