//! The gossip engine: periodic push dissemination and inbound merging.
//!
//! Every `gossip_interval` the engine drains its outbound queue, tops the
//! batch up with a few random ALIVE entries for opportunistic repair, and
//! pushes the lot to `fanout` random peers together with a heartbeat
//! naming the locally originated services. Each push goes through the
//! target's circuit breaker; an open breaker simply skips the peer for
//! the round.
//!
//! Inbound messages are deduplicated by `message_id` and merged through
//! the registry's conflict resolution. REGISTER/DEREGISTER payloads with
//! hops left are re-enqueued for the next round, changed entries only.
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::breaker::RetryPolicy;
use crate::error::DiscoveryError;
use crate::network::{Connection, GossipMessage, Payload};
use crate::peers::{PeerState, PeerTable, PeerTarget};
use crate::registry::ServiceRegistry;
use crate::types::{ServiceId, ServiceInstance};

/// Bounded LRU set of recently seen message ids.
pub struct DedupCache {
    capacity: usize,
    seen: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Record an id. Returns `true` the first time it is seen.
    pub fn insert(&mut self, id: Uuid) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// One pending outbound update with its remaining relay budget.
#[derive(Debug, Clone)]
struct QueuedUpdate {
    instance: ServiceInstance,
    hops: u32,
}

/// Bounded multi-producer queue with same-key coalescing.
///
/// A newer version of a service replaces the queued one in place; when
/// the bound is still exceeded the oldest update is dropped.
struct OutboundQueue {
    capacity: usize,
    inner: Mutex<VecDeque<QueuedUpdate>>,
}

impl OutboundQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(VecDeque::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueuedUpdate>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn push(&self, update: QueuedUpdate) {
        let mut queue = self.lock();
        if let Some(existing) = queue
            .iter_mut()
            .find(|queued| queued.instance.service_id == update.instance.service_id)
        {
            let newer = (update.instance.version, update.instance.origin_timestamp)
                >= (existing.instance.version, existing.instance.origin_timestamp);
            if newer {
                *existing = update;
            }
            return;
        }
        queue.push_back(update);
        while queue.len() > self.capacity {
            if let Some(dropped) = queue.pop_front() {
                tracing::warn!(
                    service = %dropped.instance.service_id,
                    "outbound queue full, dropping oldest update"
                );
            }
        }
    }

    fn drain(&self) -> Vec<QueuedUpdate> {
        self.lock().drain(..).collect()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Tuning slice the engine needs from the node config.
#[derive(Debug, Clone)]
pub struct GossipSettings {
    pub fanout: usize,
    pub message_ttl_hops: u32,
    pub message_max_age: Duration,
    pub repair_sample_size: usize,
    pub network_timeout: Duration,
    pub max_queue_size: usize,
    pub dedup_capacity: usize,
}

/// The gossip engine shared by the outbound scheduler and the inbound
/// server.
pub struct GossipEngine {
    settings: GossipSettings,
    retry: RetryPolicy,
    registry: Arc<ServiceRegistry>,
    peers: Arc<PeerTable>,
    /// Advertised gossip endpoint; resolved once the listener binds.
    advertised: Arc<OnceLock<SocketAddr>>,
    fallback_addr: SocketAddr,
    queue: OutboundQueue,
    dedup: Mutex<DedupCache>,
}

impl GossipEngine {
    pub fn new(
        settings: GossipSettings,
        retry: RetryPolicy,
        registry: Arc<ServiceRegistry>,
        peers: Arc<PeerTable>,
        advertised: Arc<OnceLock<SocketAddr>>,
        fallback_addr: SocketAddr,
    ) -> Self {
        let queue = OutboundQueue::new(settings.max_queue_size);
        let dedup = Mutex::new(DedupCache::new(settings.dedup_capacity));
        Self {
            settings,
            retry,
            registry,
            peers,
            advertised,
            fallback_addr,
            queue,
            dedup,
        }
    }

    /// Identity of the local node.
    pub fn local_node(&self) -> crate::types::NodeId {
        self.registry.local_node()
    }

    /// The endpoint peers should reach us at.
    pub fn sender_addr(&self) -> SocketAddr {
        self.advertised
            .get()
            .copied()
            .unwrap_or(self.fallback_addr)
    }

    /// Enqueue a locally minted change with a fresh hop budget.
    pub fn enqueue_local(&self, instance: ServiceInstance) {
        self.queue.push(QueuedUpdate {
            instance,
            hops: self.settings.message_ttl_hops,
        });
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn dedup_len(&self) -> usize {
        match self.dedup.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Outbound
    // ─────────────────────────────────────────────────────────────────────

    /// One outbound round. Rounds are serialized by the scheduler; peers
    /// within a round are contacted in parallel.
    pub async fn run_round(self: &Arc<Self>) {
        let mut batch = self.queue.drain();

        // Opportunistic repair: re-gossip a few random live entries so
        // slow paths heal without waiting for anti-entropy.
        let queued_ids: HashSet<ServiceId> = batch
            .iter()
            .map(|update| update.instance.service_id.clone())
            .collect();
        for instance in self
            .registry
            .random_alive_sample(self.settings.repair_sample_size)
        {
            if !queued_ids.contains(&instance.service_id) {
                batch.push(QueuedUpdate {
                    instance,
                    hops: self.settings.message_ttl_hops,
                });
            }
        }

        let heartbeat_ids = self.registry.local_origin_ids();
        if batch.is_empty() && heartbeat_ids.is_empty() {
            return;
        }

        let targets = self.peers.select_gossip_targets(self.settings.fanout);
        if targets.is_empty() {
            // Nobody to talk to yet; keep the updates for a later round.
            for update in batch {
                self.queue.push(update);
            }
            return;
        }

        let messages = self.build_messages(batch, heartbeat_ids);
        if messages.is_empty() {
            return;
        }

        tracing::trace!(
            peers = targets.len(),
            frames = messages.len(),
            "gossip round"
        );

        let mut handles = Vec::with_capacity(targets.len());
        for target in targets {
            let engine = Arc::clone(self);
            let messages = messages.clone();
            handles.push(tokio::spawn(async move {
                engine.push_to(target, messages).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Group the batch into wire messages: registers and deregisters
    /// bucketed by remaining hops, plus one heartbeat frame.
    fn build_messages(
        &self,
        batch: Vec<QueuedUpdate>,
        heartbeat_ids: Vec<ServiceId>,
    ) -> Vec<GossipMessage> {
        let sender = self.registry.local_node();
        let sender_addr = self.sender_addr();

        let mut registers: Vec<(u32, Vec<ServiceInstance>)> = Vec::new();
        let mut deregisters: Vec<(u32, Vec<ServiceInstance>)> = Vec::new();
        for update in batch {
            let bucket = if update.instance.status.is_tombstoned() {
                &mut deregisters
            } else {
                &mut registers
            };
            match bucket.iter_mut().find(|(hops, _)| *hops == update.hops) {
                Some((_, entries)) => entries.push(update.instance),
                None => bucket.push((update.hops, vec![update.instance])),
            }
        }

        let mut messages = Vec::new();
        for (hops, entries) in registers {
            messages.push(GossipMessage::new(
                sender,
                sender_addr,
                hops,
                Payload::Register(entries),
            ));
        }
        for (hops, entries) in deregisters {
            messages.push(GossipMessage::new(
                sender,
                sender_addr,
                hops,
                Payload::Deregister(entries),
            ));
        }
        if !heartbeat_ids.is_empty() {
            messages.push(GossipMessage::new(
                sender,
                sender_addr,
                0,
                Payload::Heartbeat(heartbeat_ids),
            ));
        }
        messages
    }

    /// Push one round's frames to a single peer through its breaker.
    async fn push_to(&self, target: PeerTarget, messages: Vec<GossipMessage>) {
        let address = target.address;
        let timeout = self.settings.network_timeout;
        let result = target
            .breaker
            .call(&self.retry, || {
                let messages = messages.clone();
                async move {
                    tokio::time::timeout(timeout, async {
                        let mut conn = Connection::connect(address).await?;
                        for message in &messages {
                            conn.send(message).await?;
                        }
                        Ok(())
                    })
                    .await
                    .unwrap_or_else(|_| {
                        Err(DiscoveryError::transient(address, "gossip push timed out"))
                    })
                }
            })
            .await;

        match result {
            Ok(()) => self.peers.record_success(target.node_id),
            Err(err) => {
                // An open breaker is the fallback path: skip the peer
                // this round but still feed the failure detector.
                tracing::debug!(peer = %target.node_id, error = %err, "gossip push failed");
                self.note_peer_failure(target.node_id);
            }
        }
    }

    /// Feed a failure into the detector and demote the peer's services if
    /// it just transitioned to FAILED.
    pub fn note_peer_failure(&self, peer: crate::types::NodeId) {
        if self.peers.record_failure(peer) == Some(PeerState::Failed) {
            self.registry.demote_origin(peer);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Inbound
    // ─────────────────────────────────────────────────────────────────────

    /// Age and dedup gate for one inbound message. Accepted messages also
    /// teach us the sender as a peer.
    pub fn should_accept(&self, message: &GossipMessage) -> bool {
        if message.is_stale(Utc::now(), self.settings.message_max_age) {
            tracing::trace!(id = %message.message_id, "dropping stale message");
            return false;
        }
        let fresh = match self.dedup.lock() {
            Ok(mut guard) => guard.insert(message.message_id),
            Err(poisoned) => poisoned.into_inner().insert(message.message_id),
        };
        if !fresh {
            tracing::trace!(id = %message.message_id, "dropping duplicate message");
            return false;
        }
        self.peers.observe(message.sender, message.sender_addr);
        true
    }

    /// Merge a REGISTER/DEREGISTER payload. Changed entries are relayed
    /// with a decremented hop budget, and only after they were applied,
    /// so a relay never outruns this node's own tombstones.
    pub fn apply_batch(&self, entries: Vec<ServiceInstance>, hops_remaining: u32) -> usize {
        let mut changed = 0;
        for instance in entries {
            let relay = instance.clone();
            if self.registry.apply_remote(instance).changed() {
                changed += 1;
                if hops_remaining > 0 {
                    self.queue.push(QueuedUpdate {
                        instance: relay,
                        hops: hops_remaining - 1,
                    });
                }
            }
        }
        changed
    }

    /// Refresh liveness for heartbeat-named entries; returns the ids this
    /// node should pull in full from the sender.
    pub fn handle_heartbeat(&self, ids: Vec<ServiceId>) -> Vec<ServiceId> {
        self.registry.touch(&ids)
    }

    /// Retry policy shared with the reconciler.
    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }
}

impl std::fmt::Debug for GossipEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipEngine")
            .field("queue", &self.queue.len())
            .field("dedup", &self.dedup_len())
            .finish()
    }
}
