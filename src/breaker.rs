//! Per-peer circuit breaker and retry policy.
//!
//! Every outbound network call (gossip push, anti-entropy exchange,
//! heartbeat pull) goes through the breaker owned by the target's peer
//! record. The breaker keeps one slow peer from stalling every round:
//! after `failure_threshold` consecutive transient failures it opens and
//! calls fail fast without touching the network, until `reset_timeout`
//! has passed and a half-open trial succeeds.
//!
//! Retries happen inside the breaker, for idempotent operations only
//! (gossip and anti-entropy are idempotent thanks to dedup and
//! versioning). Backoff is exponential with full jitter.
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::types::NodeId;

/// Decides which errors count as failures for breaker accounting.
pub type FailurePredicate = Arc<dyn Fn(&DiscoveryError) -> bool + Send + Sync>;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

enum Inner {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen { successes: u32, inflight: u32 },
}

/// Tuning for a [`CircuitBreaker`].
#[derive(Clone)]
pub struct BreakerSettings {
    /// Consecutive countable failures that open the breaker.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again.
    pub success_threshold: u32,
    /// How long the breaker stays open before allowing trials.
    pub reset_timeout: Duration,
    failure_predicate: FailurePredicate,
}

impl BreakerSettings {
    /// Settings with the default predicate (transient network errors).
    pub fn new(failure_threshold: u32, success_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            reset_timeout,
            failure_predicate: Arc::new(DiscoveryError::is_transient),
        }
    }

    /// Replace the predicate deciding which errors trip the breaker.
    /// Errors the predicate rejects still surface to the caller, but count
    /// as successes for breaker accounting.
    pub fn with_failure_predicate(
        mut self,
        predicate: impl Fn(&DiscoveryError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.failure_predicate = Arc::new(predicate);
        self
    }
}

impl std::fmt::Debug for BreakerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerSettings")
            .field("failure_threshold", &self.failure_threshold)
            .field("success_threshold", &self.success_threshold)
            .field("reset_timeout", &self.reset_timeout)
            .finish()
    }
}

/// Circuit breaker guarding calls to one remote peer.
pub struct CircuitBreaker {
    peer: NodeId,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// A closed breaker for the given peer.
    pub fn new(peer: NodeId, settings: BreakerSettings) -> Self {
        Self {
            peer,
            settings,
            inner: Mutex::new(Inner::Closed { failures: 0 }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Current state, for stats and tests.
    pub fn state(&self) -> BreakerState {
        match *self.lock() {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Admit or reject a call. An open breaker that has cooled down for
    /// `reset_timeout` flips to half-open and admits a bounded number of
    /// trial calls.
    pub fn try_acquire(&self) -> DiscoveryResult<()> {
        let mut inner = self.lock();
        match *inner {
            Inner::Closed { .. } => Ok(()),
            Inner::Open { since } => {
                if since.elapsed() >= self.settings.reset_timeout {
                    tracing::debug!(peer = %self.peer, "breaker half-open, admitting trial");
                    *inner = Inner::HalfOpen {
                        successes: 0,
                        inflight: 1,
                    };
                    Ok(())
                } else {
                    Err(DiscoveryError::CircuitOpen { peer: self.peer })
                }
            }
            Inner::HalfOpen {
                successes,
                inflight,
            } => {
                if successes + inflight < self.settings.success_threshold {
                    *inner = Inner::HalfOpen {
                        successes,
                        inflight: inflight + 1,
                    };
                    Ok(())
                } else {
                    Err(DiscoveryError::CircuitOpen { peer: self.peer })
                }
            }
        }
    }

    /// Record a successful (or non-countable) call outcome.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        match *inner {
            Inner::Closed { .. } => *inner = Inner::Closed { failures: 0 },
            Inner::HalfOpen {
                successes,
                inflight,
            } => {
                let successes = successes + 1;
                if successes >= self.settings.success_threshold {
                    tracing::info!(peer = %self.peer, "breaker closed");
                    *inner = Inner::Closed { failures: 0 };
                } else {
                    *inner = Inner::HalfOpen {
                        successes,
                        inflight: inflight.saturating_sub(1),
                    };
                }
            }
            // A success reported after the breaker opened is stale.
            Inner::Open { .. } => {}
        }
    }

    /// Record a countable failure.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        match *inner {
            Inner::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.settings.failure_threshold {
                    tracing::warn!(peer = %self.peer, failures, "breaker opened");
                    *inner = Inner::Open {
                        since: Instant::now(),
                    };
                } else {
                    *inner = Inner::Closed { failures };
                }
            }
            Inner::HalfOpen { .. } => {
                tracing::warn!(peer = %self.peer, "trial failed, breaker re-opened");
                *inner = Inner::Open {
                    since: Instant::now(),
                };
            }
            Inner::Open { .. } => {}
        }
    }

    /// Force the breaker closed. Used when an out-of-band probe proves the
    /// peer is reachable again.
    pub fn reset(&self) {
        *self.lock() = Inner::Closed { failures: 0 };
    }

    /// Run `op` through the breaker with retries.
    ///
    /// Each attempt first asks the breaker for admission; an open breaker
    /// fails fast with [`DiscoveryError::CircuitOpen`] without invoking
    /// `op`. Countable failures are retried up to `retry.max_retries`
    /// attempts with jittered exponential backoff. Non-countable errors
    /// return immediately and count as successes for the breaker.
    pub async fn call<T, F, Fut>(&self, retry: &RetryPolicy, op: F) -> DiscoveryResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = DiscoveryResult<T>>,
    {
        let attempts = retry.max_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.try_acquire()?;
            match op().await {
                Ok(value) => {
                    self.record_success();
                    return Ok(value);
                }
                Err(err) if (self.settings.failure_predicate)(&err) => {
                    self.record_failure();
                    if attempt >= attempts {
                        return Err(err);
                    }
                    let delay = retry.delay(attempt);
                    tracing::debug!(
                        peer = %self.peer,
                        attempt,
                        ?delay,
                        error = %err,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    self.record_success();
                    return Err(err);
                }
            }
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// Jittered exponential backoff schedule.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_retries: u32,
    /// Backoff base.
    pub initial_backoff: Duration,
    /// Cap on the deterministic part of the backoff.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Sleep before attempt `attempt + 1`: `min(b * 2^(k-1), b_max)` plus
    /// jitter uniform in `[0, b * 2^(k-1))`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let window = self.initial_backoff.saturating_mul(1u32 << exponent);
        let capped = window.min(self.max_backoff);
        let jitter = window.mul_f64(rand::thread_rng().gen::<f64>());
        capped.saturating_add(jitter)
    }
}
