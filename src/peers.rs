//! Peer table and accrual-style failure detector.
//!
//! One [`PeerRecord`] exists per known remote node, created on first
//! contact (bootstrap or learned from gossip traffic) and never removed:
//! a dead peer is marked FAILED, not forgotten, because live service
//! entries may still reference it as their origin.
//!
//! The detector accumulates consecutive failures rather than trusting a
//! single timeout: `suspect_threshold` failures demote a peer to SUSPECT,
//! `failed_threshold` to FAILED, and one success restores HEALTHY.
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::seq::{IteratorRandom, SliceRandom};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::breaker::{BreakerSettings, CircuitBreaker};
use crate::types::NodeId;

/// Health classification of a remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Healthy,
    Suspect,
    Failed,
}

/// Failure-detector thresholds.
#[derive(Debug, Clone, Copy)]
pub struct DetectorSettings {
    /// Consecutive failures before SUSPECT.
    pub suspect_threshold: u32,
    /// Consecutive failures before FAILED.
    pub failed_threshold: u32,
}

struct PeerRecord {
    address: SocketAddr,
    state: PeerState,
    last_contact_at: DateTime<Utc>,
    consecutive_failures: u32,
    breaker: Arc<CircuitBreaker>,
}

/// Read-only snapshot of one peer record.
#[derive(Debug, Clone)]
pub struct PeerView {
    pub node_id: NodeId,
    pub address: SocketAddr,
    pub state: PeerState,
    pub last_contact_at: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub breaker: crate::breaker::BreakerState,
}

/// Addressing bundle for one outbound exchange.
#[derive(Clone)]
pub struct PeerTarget {
    pub node_id: NodeId,
    pub address: SocketAddr,
    pub breaker: Arc<CircuitBreaker>,
}

/// Per-state peer counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub total: usize,
    pub healthy: usize,
    pub suspect: usize,
    pub failed: usize,
}

/// The table of known remote peers.
pub struct PeerTable {
    local: NodeId,
    peers: DashMap<NodeId, PeerRecord>,
    detector: DetectorSettings,
    breaker_settings: BreakerSettings,
}

impl PeerTable {
    pub fn new(local: NodeId, detector: DetectorSettings, breaker_settings: BreakerSettings) -> Self {
        Self {
            local,
            peers: DashMap::new(),
            detector,
            breaker_settings,
        }
    }

    /// Record contact with a peer, creating its record on first sight.
    /// Returns `true` if the peer was new. The local node is never added.
    pub fn observe(&self, node_id: NodeId, address: SocketAddr) -> bool {
        if node_id == self.local {
            return false;
        }
        match self.peers.entry(node_id) {
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                tracing::info!(peer = %node_id, %address, "learned new peer");
                vacant.insert(PeerRecord {
                    address,
                    state: PeerState::Healthy,
                    last_contact_at: Utc::now(),
                    consecutive_failures: 0,
                    breaker: Arc::new(CircuitBreaker::new(
                        node_id,
                        self.breaker_settings.clone(),
                    )),
                });
                true
            }
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                // A peer may come back on a new port after a restart.
                if occupied.get().address != address {
                    occupied.get_mut().address = address;
                }
                false
            }
        }
    }

    /// A successful exchange: reset the failure streak, restore HEALTHY.
    pub fn record_success(&self, node_id: NodeId) {
        if let Some(mut record) = self.peers.get_mut(&node_id) {
            if record.state != PeerState::Healthy {
                tracing::info!(peer = %node_id, "peer recovered");
            }
            record.state = PeerState::Healthy;
            record.consecutive_failures = 0;
            record.last_contact_at = Utc::now();
        }
    }

    /// A failed exchange. Returns the new state when the failure caused a
    /// transition, so the caller can react (demote the peer's services).
    pub fn record_failure(&self, node_id: NodeId) -> Option<PeerState> {
        let mut record = self.peers.get_mut(&node_id)?;
        record.consecutive_failures += 1;

        let next = if record.consecutive_failures >= self.detector.failed_threshold {
            PeerState::Failed
        } else if record.consecutive_failures >= self.detector.suspect_threshold {
            PeerState::Suspect
        } else {
            record.state
        };

        if next != record.state {
            tracing::warn!(
                peer = %node_id,
                failures = record.consecutive_failures,
                ?next,
                "peer state transition"
            );
            record.state = next;
            Some(next)
        } else {
            None
        }
    }

    /// Pick up to `fanout` gossip targets uniformly at random from the
    /// HEALTHY peers, topping up from SUSPECT when there are not enough.
    pub fn select_gossip_targets(&self, fanout: usize) -> Vec<PeerTarget> {
        if fanout == 0 {
            return Vec::new();
        }
        let mut healthy = Vec::new();
        let mut suspect = Vec::new();
        for entry in self.peers.iter() {
            let target = PeerTarget {
                node_id: *entry.key(),
                address: entry.value().address,
                breaker: Arc::clone(&entry.value().breaker),
            };
            match entry.value().state {
                PeerState::Healthy => healthy.push(target),
                PeerState::Suspect => suspect.push(target),
                PeerState::Failed => {}
            }
        }

        let mut rng = rand::thread_rng();
        let mut selected: Vec<PeerTarget> = healthy
            .choose_multiple(&mut rng, fanout)
            .cloned()
            .collect();
        if selected.len() < fanout {
            selected.extend(
                suspect
                    .choose_multiple(&mut rng, fanout - selected.len())
                    .cloned(),
            );
        }
        selected
    }

    /// One random HEALTHY peer for an anti-entropy round.
    pub fn random_healthy(&self) -> Option<PeerTarget> {
        let mut rng = rand::thread_rng();
        self.peers
            .iter()
            .filter(|entry| entry.value().state == PeerState::Healthy)
            .choose(&mut rng)
            .map(|entry| PeerTarget {
                node_id: *entry.key(),
                address: entry.value().address,
                breaker: Arc::clone(&entry.value().breaker),
            })
    }

    /// All FAILED peers, for the reduced-rate prober.
    pub fn failed_targets(&self) -> Vec<PeerTarget> {
        self.peers
            .iter()
            .filter(|entry| entry.value().state == PeerState::Failed)
            .map(|entry| PeerTarget {
                node_id: *entry.key(),
                address: entry.value().address,
                breaker: Arc::clone(&entry.value().breaker),
            })
            .collect()
    }

    /// Current state of one peer.
    pub fn state_of(&self, node_id: NodeId) -> Option<PeerState> {
        self.peers.get(&node_id).map(|record| record.state)
    }

    /// Breaker handle of one peer.
    pub fn breaker_for(&self, node_id: NodeId) -> Option<Arc<CircuitBreaker>> {
        self.peers
            .get(&node_id)
            .map(|record| Arc::clone(&record.breaker))
    }

    /// Snapshot of every record.
    pub fn snapshot(&self) -> Vec<PeerView> {
        self.peers
            .iter()
            .map(|entry| PeerView {
                node_id: *entry.key(),
                address: entry.value().address,
                state: entry.value().state,
                last_contact_at: entry.value().last_contact_at,
                consecutive_failures: entry.value().consecutive_failures,
                breaker: entry.value().breaker.state(),
            })
            .collect()
    }

    pub fn stats(&self) -> PeerStats {
        let mut stats = PeerStats::default();
        for entry in self.peers.iter() {
            stats.total += 1;
            match entry.value().state {
                PeerState::Healthy => stats.healthy += 1,
                PeerState::Suspect => stats.suspect += 1,
                PeerState::Failed => stats.failed += 1,
            }
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl std::fmt::Debug for PeerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerTable")
            .field("local", &self.local)
            .field("peers", &self.peers.len())
            .finish()
    }
}
