//! Error types for shoal operations.
//!
//! A single flat enum covers every failure mode in the discovery core.
//! The retry and circuit-breaker layers dispatch on the variant rather
//! than on exception hierarchies: [`DiscoveryError::is_transient`] is the
//! default predicate for what counts against a breaker.
use std::net::SocketAddr;
use thiserror::Error;

use crate::types::{NodeId, ServiceId};

/// The main error type for discovery operations.
///
/// All fallible operations in shoal return `Result<T, DiscoveryError>`.
/// Only `RegistryFull`, `InvalidArgument`, and `ShuttingDown` ever reach
/// in-process callers; the network variants are contained inside the
/// gossip and anti-entropy loops.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// A transient network failure: timeout, refused or reset connection.
    /// Retryable, and counts against the peer's circuit breaker.
    #[error("transient network error talking to {peer}: {detail}")]
    Transient {
        /// Address of the remote that failed.
        peer: SocketAddr,
        /// Human-readable cause.
        detail: String,
    },

    /// The peer's circuit breaker is open; the call was not attempted.
    #[error("circuit open for peer {peer}")]
    CircuitOpen {
        /// The peer whose breaker rejected the call.
        peer: NodeId,
    },

    /// A malformed frame arrived from a peer. The connection is closed and
    /// the peer's failure count is incremented; the frame is not retried.
    #[error("protocol decode error from {peer}: {detail}")]
    ProtocolDecode { peer: SocketAddr, detail: String },

    /// The registry's hard capacity cap was breached on insert.
    #[error("registry full: {capacity} entries")]
    RegistryFull { capacity: usize },

    /// A caller violated the API contract (unknown service id, non-origin
    /// mutation, double start).
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// The node is shutting down; the operation had no side effects.
    #[error("node is shutting down")]
    ShuttingDown,
}

impl DiscoveryError {
    /// Whether this error counts as a failure for breaker accounting.
    ///
    /// Application-level errors are successes from the breaker's point of
    /// view but are still surfaced to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, DiscoveryError::Transient { .. })
    }

    /// Convenience constructor for transient I/O failures.
    pub fn transient(peer: SocketAddr, err: impl std::fmt::Display) -> Self {
        DiscoveryError::Transient {
            peer,
            detail: err.to_string(),
        }
    }

    /// Convenience constructor for invalid arguments.
    pub fn invalid(reason: impl Into<String>) -> Self {
        DiscoveryError::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for an unknown service id.
    pub fn unknown_service(id: &ServiceId) -> Self {
        DiscoveryError::InvalidArgument {
            reason: format!("unknown service id '{id}'"),
        }
    }
}

/// Result type alias for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7946)
    }

    #[test]
    fn transient_is_the_only_breaker_countable_kind() {
        assert!(DiscoveryError::transient(addr(), "connection refused").is_transient());
        assert!(!DiscoveryError::ShuttingDown.is_transient());
        assert!(!DiscoveryError::invalid("nope").is_transient());
        assert!(!DiscoveryError::ProtocolDecode {
            peer: addr(),
            detail: "bad frame".into(),
        }
        .is_transient());
    }

    #[test]
    fn error_messages_carry_context() {
        let err = DiscoveryError::transient(addr(), "timed out");
        assert!(err.to_string().contains("127.0.0.1:7946"));
        assert!(err.to_string().contains("timed out"));
    }
}
