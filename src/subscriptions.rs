//! Change notifications for service lifecycle transitions.
//!
//! Collaborators subscribe to a service type and get a callback whenever
//! an entry of that type transitions between up, degraded, and down.
//! Callbacks run on a dedicated dispatcher task, never on the mutating
//! path, so a slow subscriber cannot stall gossip.
//!
//! [`SubscriptionHandle`] unregisters its callback when dropped; there is
//! no global listener list to leak into.
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{broadcast, mpsc};

use crate::types::ServiceInstance;

/// Subscriber-facing lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceTransition {
    /// The service became discoverable (registered or recovered).
    Up,
    /// Evidence went stale; the service is suspect.
    Degraded,
    /// The service is gone (deregistered, evicted, or origin failed).
    Down,
}

/// One lifecycle notification.
#[derive(Debug, Clone)]
pub struct ServiceEvent {
    /// Snapshot of the entry at transition time.
    pub service: ServiceInstance,
    pub transition: ServiceTransition,
    /// Local wall-clock of the transition.
    pub at: DateTime<Utc>,
}

impl ServiceEvent {
    pub fn new(service: ServiceInstance, transition: ServiceTransition) -> Self {
        Self {
            service,
            transition,
            at: Utc::now(),
        }
    }
}

/// Callback invoked asynchronously for each matching event.
pub type EventCallback = Arc<dyn Fn(ServiceEvent) + Send + Sync>;

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Subscriber {
    /// `None` matches every service type.
    service_type: Option<String>,
    callback: EventCallback,
}

/// Registry of subscribers plus the event channel feeding the dispatcher.
pub struct SubscriptionHub {
    subscribers: DashMap<SubscriptionId, Subscriber>,
    next_id: AtomicU64,
    tx: mpsc::UnboundedSender<ServiceEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<ServiceEvent>>>,
}

impl SubscriptionHub {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Register a callback for one service type (`None` = all types).
    pub fn subscribe(
        self: &Arc<Self>,
        service_type: Option<String>,
        callback: EventCallback,
    ) -> SubscriptionHandle {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.insert(
            id,
            Subscriber {
                service_type,
                callback,
            },
        );
        SubscriptionHandle {
            id,
            hub: Arc::downgrade(self),
        }
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    /// Number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Queue an event for asynchronous delivery. Cheap and non-blocking;
    /// safe to call from registry mutation paths.
    pub fn publish(&self, event: ServiceEvent) {
        if !self.subscribers.is_empty() {
            let _ = self.tx.send(event);
        }
    }

    /// Spawn the dispatcher task that drains the event channel and invokes
    /// matching callbacks. Returns `None` if a dispatcher already ran.
    pub fn spawn_dispatcher(
        self: &Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let mut rx = {
            let mut slot = match self.rx.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.take()?
        };

        // Weak reference so a dropped hub ends the loop instead of the
        // dispatcher keeping the hub alive forever.
        let hub = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => {
                        let Some(event) = event else { break };
                        let Some(hub) = hub.upgrade() else { break };
                        hub.dispatch(event);
                    }
                    _ = shutdown.recv() => break,
                }
            }
        }))
    }

    fn dispatch(&self, event: ServiceEvent) {
        // Collect callbacks first so no shard lock is held while user code
        // runs.
        let callbacks: Vec<EventCallback> = self
            .subscribers
            .iter()
            .filter(|entry| match &entry.value().service_type {
                Some(ty) => ty == &event.service.service_type,
                None => true,
            })
            .map(|entry| Arc::clone(&entry.value().callback))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}

impl Default for SubscriptionHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned from `subscribe`. Dropping it unregisters the callback.
pub struct SubscriptionHandle {
    id: SubscriptionId,
    hub: Weak<SubscriptionHub>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.id);
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .finish()
    }
}
