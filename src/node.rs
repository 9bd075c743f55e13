//! The discovery node: public API and task lifecycle.
//!
//! [`DiscoveryNode`] is the one explicitly-owned object collaborators
//! hold. It wires the registry, peer table, gossip engine, and
//! reconciler together, and owns the long-running tasks:
//!
//! - the inbound server accepting gossip connections,
//! - the outbound gossip scheduler,
//! - the anti-entropy scheduler,
//! - the eviction sweeper,
//! - the failed-peer prober,
//! - the subscription dispatcher.
//!
//! All of them stop on a shared shutdown broadcast; `stop()` waits up to
//! `shutdown_grace` and aborts stragglers. There are no process-wide
//! singletons: tests construct as many independent nodes as they like.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::anti_entropy::{Reconciler, ReconcilerSettings};
use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::gossip::{GossipEngine, GossipSettings};
use crate::network::{Connection, GossipMessage, Listener, Payload};
use crate::peers::{DetectorSettings, PeerStats, PeerTable, PeerView};
use crate::registry::{RegistryStats, ServiceRegistry};
use crate::subscriptions::{ServiceEvent, SubscriptionHandle, SubscriptionHub};
use crate::types::{NodeId, ServiceId, ServiceInstance};

/// Point-in-time observability snapshot of one node.
#[derive(Debug, Clone)]
pub struct NodeStats {
    pub node_id: NodeId,
    pub registry: RegistryStats,
    pub peers: PeerStats,
    pub outbound_queue: usize,
    pub dedup_entries: usize,
    pub running: bool,
}

/// One node of the discovery mesh.
pub struct DiscoveryNode {
    node_id: NodeId,
    config: DiscoveryConfig,
    registry: Arc<ServiceRegistry>,
    peers: Arc<PeerTable>,
    engine: Arc<GossipEngine>,
    reconciler: Arc<Reconciler>,
    hub: Arc<SubscriptionHub>,
    advertised: Arc<OnceLock<SocketAddr>>,
    shutdown_tx: broadcast::Sender<()>,
    running: AtomicBool,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryNode {
    /// Build a node from a configuration record. Nothing touches the
    /// network until [`start`](Self::start).
    pub fn new(config: DiscoveryConfig) -> Self {
        let node_id = NodeId::new();
        let hub = Arc::new(SubscriptionHub::new());
        let registry = Arc::new(ServiceRegistry::new(
            node_id,
            config.conflict_resolution,
            config.max_registry_entries,
            Arc::clone(&hub),
        ));
        let peers = Arc::new(PeerTable::new(
            node_id,
            DetectorSettings {
                suspect_threshold: config.suspect_threshold,
                failed_threshold: config.failed_threshold,
            },
            config.breaker_settings(),
        ));
        let advertised = Arc::new(OnceLock::new());
        let engine = Arc::new(GossipEngine::new(
            GossipSettings {
                fanout: config.fanout,
                message_ttl_hops: config.message_ttl_hops,
                message_max_age: config.message_max_age,
                repair_sample_size: config.repair_sample_size,
                network_timeout: config.network_timeout,
                max_queue_size: config.max_queue_size,
                dedup_capacity: config.dedup_capacity,
            },
            config.retry_policy(),
            Arc::clone(&registry),
            Arc::clone(&peers),
            Arc::clone(&advertised),
            config.bind_addr,
        ));
        let reconciler = Arc::new(Reconciler::new(
            ReconcilerSettings {
                reconciliation_timeout: config.reconciliation_timeout,
            },
            Arc::clone(&registry),
            Arc::clone(&peers),
            Arc::clone(&engine),
            config.bootstrap_peers.clone(),
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            node_id,
            config,
            registry,
            peers,
            engine,
            reconciler,
            hub,
            advertised,
            shutdown_tx,
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// This node's identity.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The bound gossip endpoint, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.advertised.get().copied()
    }

    /// Whether the node is started and not stopped.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> DiscoveryResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            Err(DiscoveryError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tasks.push(handle);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Bind the gossip port and start every background task. The first
    /// anti-entropy tick doubles as the bootstrap join.
    pub async fn start(&self) -> DiscoveryResult<()> {
        self.ensure_open()?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(DiscoveryError::invalid("node already started"));
        }

        let listener = match Listener::bind(self.config.bind_addr).await {
            Ok(listener) => listener,
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        let local_addr = listener.local_addr();
        let _ = self.advertised.set(local_addr);

        if let Some(handle) = self.hub.spawn_dispatcher(self.shutdown_tx.subscribe()) {
            self.track(handle);
        }

        // Inbound server.
        {
            let engine = Arc::clone(&self.engine);
            let reconciler = Arc::clone(&self.reconciler);
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            self.track(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        accepted = listener.accept() => match accepted {
                            Ok(conn) => {
                                let engine = Arc::clone(&engine);
                                let reconciler = Arc::clone(&reconciler);
                                tokio::spawn(async move {
                                    handle_connection(conn, engine, reconciler).await;
                                });
                            }
                            Err(err) => {
                                tracing::debug!(error = %err, "accept failed");
                            }
                        },
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }));
        }

        // Outbound gossip scheduler.
        {
            let engine = Arc::clone(&self.engine);
            let period = self.config.gossip_interval;
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            self.track(tokio::spawn(async move {
                let mut ticker = interval(period);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => engine.run_round().await,
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }));
        }

        // Anti-entropy scheduler.
        {
            let reconciler = Arc::clone(&self.reconciler);
            let period = self.config.anti_entropy_interval;
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            self.track(tokio::spawn(async move {
                let mut ticker = interval(period);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => reconciler.run_round().await,
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }));
        }

        // Eviction sweeper.
        {
            let registry = Arc::clone(&self.registry);
            let period = self.config.eviction_interval;
            let alive_ttl = self.config.entry_alive_ttl;
            let suspect_ttl = self.config.entry_suspect_ttl;
            let tombstone_ttl = self.config.tombstone_ttl;
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            self.track(tokio::spawn(async move {
                let mut ticker = interval(period);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            registry.sweep(alive_ttl, suspect_ttl, tombstone_ttl);
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }));
        }

        // Failed-peer prober.
        {
            let engine = Arc::clone(&self.engine);
            let peers = Arc::clone(&self.peers);
            let period = self.config.failed_probe_interval;
            let timeout = self.config.network_timeout;
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            self.track(tokio::spawn(async move {
                let mut ticker = interval(period);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            for target in peers.failed_targets() {
                                let engine = Arc::clone(&engine);
                                let peers = Arc::clone(&peers);
                                tokio::spawn(async move {
                                    probe_peer(engine, peers, target, timeout).await;
                                });
                            }
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }));
        }

        tracing::info!(node = %self.node_id, %local_addr, "discovery node started");
        Ok(())
    }

    /// Stop all background tasks cooperatively, aborting anything that
    /// outlives `shutdown_grace`. Idempotent.
    pub async fn stop(&self) -> DiscoveryResult<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = match self.tasks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            tasks.drain(..).collect()
        };

        let deadline = Instant::now() + self.config.shutdown_grace;
        for mut handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                handle.abort();
                tracing::warn!(node = %self.node_id, "task exceeded shutdown grace, aborted");
            }
        }

        tracing::info!(node = %self.node_id, "discovery node stopped");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Public discovery/registration API
    // ─────────────────────────────────────────────────────────────────────

    /// Advertise a service owned by this node. The change is enqueued for
    /// gossip before this returns, and an immediate `discover` on this
    /// node sees the new entry.
    pub fn register_service(
        &self,
        service_type: impl Into<String>,
        service_id: impl Into<ServiceId>,
        host: impl Into<String>,
        port: u16,
        metadata: HashMap<String, String>,
    ) -> DiscoveryResult<ServiceInstance> {
        self.ensure_open()?;
        let entry = self
            .registry
            .register(service_type, service_id.into(), host, port, metadata)?;
        self.engine.enqueue_local(entry.clone());
        Ok(entry)
    }

    /// Withdraw a service owned by this node. Returns `false` if it was
    /// already deregistered.
    pub fn deregister_service(&self, service_id: &ServiceId) -> DiscoveryResult<bool> {
        self.ensure_open()?;
        match self.registry.deregister(service_id)? {
            Some(tombstone) => {
                self.engine.enqueue_local(tombstone);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Snapshot of ALIVE services of one type. Never fails; an empty mesh
    /// yields an empty list.
    pub fn discover_services(&self, service_type: &str) -> Vec<ServiceInstance> {
        self.registry.discover(service_type, None)
    }

    /// Like [`discover_services`](Self::discover_services) with a
    /// metadata predicate.
    pub fn discover_services_where(
        &self,
        service_type: &str,
        predicate: impl Fn(&HashMap<String, String>) -> bool,
    ) -> Vec<ServiceInstance> {
        self.registry.discover(service_type, Some(&predicate))
    }

    /// Whether the service is known and currently ALIVE.
    pub fn is_service_healthy(&self, service_id: &ServiceId) -> bool {
        self.registry.is_healthy(service_id)
    }

    /// The full stored entry for a service id, tombstones included.
    pub fn service_entry(&self, service_id: &ServiceId) -> Option<ServiceInstance> {
        self.registry.get(service_id)
    }

    /// Subscribe to up/degraded/down transitions for one service type.
    /// The callback runs on the dispatcher task; drop the handle to
    /// unsubscribe.
    pub fn subscribe(
        &self,
        service_type: impl Into<String>,
        callback: impl Fn(ServiceEvent) + Send + Sync + 'static,
    ) -> DiscoveryResult<SubscriptionHandle> {
        self.ensure_open()?;
        Ok(self
            .hub
            .subscribe(Some(service_type.into()), Arc::new(callback)))
    }

    /// Reconcile immediately with an explicit peer address, learning it
    /// as a peer in the process. This is the programmatic join.
    pub async fn join(&self, addr: SocketAddr) -> DiscoveryResult<()> {
        self.ensure_open()?;
        self.reconciler.sync_with(addr).await.map(|_| ())
    }

    /// Snapshot of the peer table.
    pub fn peers(&self) -> Vec<PeerView> {
        self.peers.snapshot()
    }

    /// Observability snapshot.
    pub fn stats(&self) -> NodeStats {
        NodeStats {
            node_id: self.node_id,
            registry: self.registry.stats(),
            peers: self.peers.stats(),
            outbound_queue: self.engine.queue_len(),
            dedup_entries: self.engine.dedup_len(),
            running: self.is_running(),
        }
    }
}

impl std::fmt::Debug for DiscoveryNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryNode")
            .field("node_id", &self.node_id)
            .field("addr", &self.local_addr())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Serve one inbound connection until it closes or misbehaves.
async fn handle_connection(
    mut conn: Connection,
    engine: Arc<GossipEngine>,
    reconciler: Arc<Reconciler>,
) {
    let mut last_sender: Option<NodeId> = None;
    loop {
        let message = match conn.receive().await {
            Ok(message) => message,
            Err(err @ DiscoveryError::ProtocolDecode { .. }) => {
                tracing::warn!(peer = %conn.peer_addr(), error = %err, "closing connection");
                if let Some(sender) = last_sender {
                    engine.note_peer_failure(sender);
                }
                return;
            }
            // Clean close or I/O error; either way the exchange is over.
            Err(_) => return,
        };

        if !engine.should_accept(&message) {
            continue;
        }
        last_sender = Some(message.sender);
        let sender = message.sender;
        let sender_addr = message.sender_addr;
        let hops = message.hops_remaining;

        let reply = match message.payload {
            Payload::Register(entries) | Payload::Deregister(entries) => {
                engine.apply_batch(entries, hops);
                None
            }
            Payload::Heartbeat(ids) => {
                let unknown = engine.handle_heartbeat(ids);
                if !unknown.is_empty() {
                    let reconciler = Arc::clone(&reconciler);
                    tokio::spawn(async move {
                        reconciler.pull_from(sender, sender_addr, unknown).await;
                    });
                }
                None
            }
            Payload::AntiEntropyDigest(digest) => {
                let (entries, wanted) = reconciler.handle_digest(&digest);
                Some(Payload::AntiEntropyResponse { entries, wanted })
            }
            Payload::AntiEntropyRequest(ids) => Some(Payload::AntiEntropyResponse {
                entries: reconciler.handle_request(&ids),
                wanted: Vec::new(),
            }),
            Payload::AntiEntropyResponse { entries, wanted } => reconciler
                .handle_response(entries, &wanted)
                .map(|extra| Payload::AntiEntropyResponse {
                    entries: extra,
                    wanted: Vec::new(),
                }),
        };

        if let Some(payload) = reply {
            let frame =
                GossipMessage::new(engine.local_node(), engine.sender_addr(), 0, payload);
            if let Err(err) = conn.send(&frame).await {
                tracing::debug!(peer = %conn.peer_addr(), error = %err, "reply failed");
                return;
            }
        }
    }
}

/// Probe one FAILED peer with an empty heartbeat. A single success
/// restores it to HEALTHY and force-closes its breaker.
async fn probe_peer(
    engine: Arc<GossipEngine>,
    peers: Arc<PeerTable>,
    target: crate::peers::PeerTarget,
    timeout: std::time::Duration,
) {
    let probe = GossipMessage::new(
        engine.local_node(),
        engine.sender_addr(),
        0,
        Payload::Heartbeat(Vec::new()),
    );
    let attempt = tokio::time::timeout(timeout, async {
        let mut conn = Connection::connect(target.address).await?;
        conn.send(&probe).await
    })
    .await
    .unwrap_or_else(|_| {
        Err(DiscoveryError::transient(
            target.address,
            "probe timed out",
        ))
    });

    match attempt {
        Ok(()) => {
            target.breaker.reset();
            peers.record_success(target.node_id);
            tracing::info!(peer = %target.node_id, "failed peer responded to probe");
        }
        Err(err) => {
            tracing::trace!(peer = %target.node_id, error = %err, "probe failed");
        }
    }
}
