use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::clock::Clock;

/// Named signals published by the session core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionEventKind {
    /// A bundle was stored after a credential exchange
    #[serde(rename = "auth:session-started")]
    SessionStarted,
    /// The monitor's own proactive refresh succeeded
    #[serde(rename = "auth:token-refreshed")]
    TokenRefreshed,
    /// Some other refresh path succeeded and replaced the bundle
    #[serde(rename = "auth:external-refresh")]
    ExternalRefresh,
    /// A refresh attempt failed; the session is still alive
    #[serde(rename = "auth:refresh-failed")]
    RefreshFailed,
    /// The session ran out with no successful refresh
    #[serde(rename = "auth:token-expired")]
    TokenExpired,
    /// The user signed out
    #[serde(rename = "auth:logout")]
    Logout,
}

impl SessionEventKind {
    /// Wire name of the signal
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStarted => "auth:session-started",
            Self::TokenRefreshed => "auth:token-refreshed",
            Self::ExternalRefresh => "auth:external-refresh",
            Self::RefreshFailed => "auth:refresh-failed",
            Self::TokenExpired => "auth:token-expired",
            Self::Logout => "auth:logout",
        }
    }

    /// Whether the session holds a fresh bundle after this event
    pub fn is_refresh(&self) -> bool {
        matches!(self, Self::TokenRefreshed | Self::ExternalRefresh)
    }

    /// Whether the session is gone after this event
    pub fn ends_session(&self) -> bool {
        matches!(self, Self::TokenExpired | Self::Logout)
    }
}

impl fmt::Display for SessionEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome message broadcast to session observers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    /// Unique event ID
    pub id: Uuid,
    /// What happened
    pub kind: SessionEventKind,
    /// Component that produced the event (e.g. "monitor", "logout")
    pub source: String,
    /// When the event was created
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Extra details, e.g. the new expiry or the failure reason
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl SessionEvent {
    /// Create a new event stamped with the system time
    pub fn new(kind: SessionEventKind, source: &str) -> Self {
        Self::at(kind, source, chrono::Utc::now())
    }

    /// Create a new event stamped by `clock`
    pub fn from_clock(kind: SessionEventKind, source: &str, clock: &dyn Clock) -> Self {
        Self::at(kind, source, clock.now())
    }

    fn at(kind: SessionEventKind, source: &str, timestamp: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            source: source.to_string(),
            timestamp,
            payload: serde_json::Value::Null,
        }
    }

    /// Attach a payload
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Statistics about event bus activity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventBusStats {
    /// Number of events published
    pub events_published: u64,
    /// Number of events nobody was listening for
    pub events_dropped: u64,
    /// Number of handler invocations that panicked
    pub handler_failures: u64,
    /// Count of events by source
    pub source_counts: HashMap<String, u64>,
    /// Count of events by kind
    pub kind_counts: HashMap<String, u64>,
}

type Handler = dyn Fn(&SessionEvent) + Send + Sync;
type HandlerMap = DashMap<Uuid, Arc<Handler>>;

/// Handle for a callback registered with `EventBus::subscribe`.
///
/// Dropping the handle unsubscribes; call `detach` to keep the callback for
/// the lifetime of the bus.
#[must_use = "dropping a Subscription unsubscribes the handler"]
pub struct Subscription {
    id: Uuid,
    handlers: Weak<HandlerMap>,
    active: bool,
}

impl Subscription {
    /// Identifier of this subscription
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Remove the handler now
    pub fn unsubscribe(mut self) {
        self.remove();
    }

    /// Keep the handler registered after this handle is dropped
    pub fn detach(mut self) {
        self.active = false;
    }

    fn remove(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(handlers) = self.handlers.upgrade() {
            if handlers.remove(&self.id).is_some() {
                trace!(subscription_id = %self.id, "Handler unsubscribed");
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}

/// Process-wide publish/subscribe channel for session outcomes.
///
/// Callback subscribers are invoked synchronously inside `publish`, each
/// exactly once per event they were registered for. Async consumers can
/// take a broadcast receiver instead. Nothing is persisted or replayed.
#[derive(Clone)]
pub struct EventBus {
    /// The broadcast channel sender
    sender: broadcast::Sender<SessionEvent>,
    /// Synchronous callback subscribers
    handlers: Arc<HandlerMap>,
    /// Configured capacity of the channel
    capacity: usize,
    /// Statistics about event bus activity
    stats: Arc<RwLock<EventBusStats>>,
}

impl EventBus {
    /// Create a new event bus with the specified capacity
    pub fn new(capacity: usize) -> Self {
        info!(capacity, "Creating new session event bus");
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            handlers: Arc::new(DashMap::new()),
            capacity,
            stats: Arc::new(RwLock::new(EventBusStats::default())),
        }
    }

    /// Register a callback invoked for every event published from now on
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.handlers.insert(id, Arc::new(handler));
        trace!(subscription_id = %id, "New handler subscribed to session events");
        Subscription {
            id,
            handlers: Arc::downgrade(&self.handlers),
            active: true,
        }
    }

    /// Get a receiver for async consumption
    pub fn receiver(&self) -> broadcast::Receiver<SessionEvent> {
        trace!("New receiver registered to session event bus");
        self.sender.subscribe()
    }

    /// Publish an event to everyone subscribed at this moment.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, event: SessionEvent) -> usize {
        trace!(
            kind = %event.kind,
            source = %event.source,
            "Publishing session event"
        );

        // Snapshot first so handlers may subscribe, unsubscribe or publish
        let handlers: Vec<(Uuid, Arc<Handler>)> = self
            .handlers
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        let mut delivered = 0;
        let mut failures = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    failures += 1;
                    warn!(
                        subscription_id = %id,
                        kind = %event.kind,
                        "Session event handler panicked"
                    );
                }
            }
        }

        let kind = event.kind.as_str().to_string();
        let source = event.source.clone();
        delivered += self.sender.send(event).unwrap_or(0);

        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        stats.events_published += 1;
        stats.handler_failures += failures;
        if delivered == 0 {
            stats.events_dropped += 1;
            debug!(kind = %kind, "No subscribers for session event");
        }
        *stats.source_counts.entry(source).or_insert(0) += 1;
        *stats.kind_counts.entry(kind).or_insert(0) += 1;

        delivered
    }

    /// Get current event bus statistics
    pub fn get_stats(&self) -> EventBusStats {
        self.stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reset all statistics counters
    pub fn reset_stats(&self) {
        debug!("Resetting session event bus statistics");
        *self.stats.write().unwrap_or_else(PoisonError::into_inner) = EventBusStats::default();
    }

    /// Get the configured capacity of the broadcast channel
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of callback subscribers plus broadcast receivers
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len() + self.sender.receiver_count()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
