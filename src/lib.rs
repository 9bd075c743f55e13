//! # shoal: decentralized service discovery for peer-to-peer file sharing
//!
//! Every node in a shoal mesh advertises the services it runs (file-sharing
//! endpoints, tracker instances, index servers) and discovers the services
//! run by everyone else, with no coordinator, no registry server, and no
//! single point of failure. The replicated registry converges through:
//!
//! - **Push gossip**: local changes fan out to a few random peers every
//!   round, relayed hop-by-hop with deduplication and a TTL.
//! - **Anti-entropy**: periodic digest exchanges with one random peer heal
//!   whatever gossip missed (partitions included).
//! - **Deterministic conflict resolution**: versioned entries with an
//!   explicit, order-independent merge; tombstones suppress resurrection.
//! - **Failure isolation**: an accrual failure detector plus a per-peer
//!   circuit breaker with jittered retry, so one dead peer never stalls
//!   the mesh.
//!
//! ## Quick Start
//!
//! ```ignore
//! use shoal::{DiscoveryConfig, DiscoveryNode};
//! use std::collections::HashMap;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     shoal::init_logging();
//!
//!     let node = DiscoveryNode::new(
//!         DiscoveryConfig::new()
//!             .bind_addr("0.0.0.0:7946".parse()?)
//!             .bootstrap(["10.0.0.1:7946".parse()?]),
//!     );
//!     node.start().await?;
//!
//!     let mut metadata = HashMap::new();
//!     metadata.insert("filename".into(), "album.flac".into());
//!     node.register_service("file-sharing", "share-1", "10.0.0.2", 9000, metadata)?;
//!
//!     for service in node.discover_services("tracker") {
//!         println!("tracker at {}", service.endpoint());
//!     }
//!
//!     node.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! One [`DiscoveryNode`] owns four cooperating subsystems, built bottom-up:
//!
//! 1. **Transport** (`network`): length-prefixed JSON frames over TCP.
//! 2. **Failure isolation** (`breaker`, `peers`): per-peer circuit
//!    breakers and the accrual failure detector.
//! 3. **Registry** (`registry`): the replicated service map with
//!    conflict resolution and TTL-driven eviction.
//! 4. **Dissemination** (`gossip`, `anti_entropy`): the push rounds and
//!    the digest reconciler.
//!
//! Everything is explicitly owned: construct as many independent nodes in
//! one process as you like (the tests do exactly that).

pub mod anti_entropy;
pub mod breaker;
pub mod config;
pub mod error;
pub mod gossip;
pub mod network;
pub mod node;
pub mod peers;
pub mod registry;
pub mod subscriptions;
pub mod types;

// Public API exports
pub use config::{DiscoveryConfig, DEFAULT_PORT};
pub use error::{DiscoveryError, DiscoveryResult};
pub use node::{DiscoveryNode, NodeStats};
pub use types::{
    ConflictStrategy, DigestEntry, NodeId, RegistryDigest, ServiceId, ServiceInstance,
    ServiceStatus,
};

pub use breaker::{BreakerSettings, BreakerState, CircuitBreaker, RetryPolicy};
pub use peers::{PeerState, PeerStats, PeerView};
pub use registry::{ApplyOutcome, RegistryStats, ServiceRegistry};
pub use subscriptions::{
    ServiceEvent, ServiceTransition, SubscriptionHandle, SubscriptionHub, SubscriptionId,
};

// Re-export commonly used external types for convenience
pub use chrono::{DateTime, Utc};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use shoal::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::DiscoveryConfig;
    pub use crate::error::{DiscoveryError, DiscoveryResult};
    pub use crate::node::{DiscoveryNode, NodeStats};
    pub use crate::subscriptions::{ServiceEvent, ServiceTransition};
    pub use crate::types::{
        ConflictStrategy, NodeId, ServiceId, ServiceInstance, ServiceStatus,
    };
}

// ============================================================================
// Logging and Observability
// ============================================================================

/// Initialize the logging system.
///
/// Call once at application startup. The log level is controlled via the
/// `SHOAL_LOG` environment variable (`error`, `warn`, `info`, `debug`,
/// `trace`); the default is `info`.
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("SHOAL_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Initialize logging with an explicit level, ignoring the environment.
pub fn init_logging_with_level(level: &str) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::registry()
        .with(EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
