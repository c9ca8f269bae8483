//! Normalized session events and the bus that fans them out
//!
//! Every subscriber gets its own unbounded queue, so emission never blocks
//! and a slow consumer never delays or starves another one. There is no
//! replay: a subscriber only sees events emitted after it registered.

use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Event emitted by the session manager
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// The transport reached the connected state
    Connect,
    /// A decoded inbound message
    Message { topic: String, payload: Value },
    /// A subscribe call for `topic` was issued on the transport
    Subscribed { topic: String },
    /// The session or transport closed
    Close,
    /// Something failed; the connection is not necessarily affected
    Error { detail: String },
    /// The transport is retrying the connection
    Reconnect,
    /// The transport lost the connection
    Offline,
}

impl Event {
    /// Stable name of the variant, as used in serialized form
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Connect => "connect",
            Event::Message { .. } => "message",
            Event::Subscribed { .. } => "subscribed",
            Event::Close => "close",
            Event::Error { .. } => "error",
            Event::Reconnect => "reconnect",
            Event::Offline => "offline",
        }
    }
}

/// Identifies one registration on the bus
pub type SubscriberId = u64;

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::UnboundedSender<Event>,
}

/// Multicast, replay-free event stream
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    emit_count: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            emit_count: AtomicU64::new(0),
        }
    }

    /// Register a subscriber. It receives every event emitted from now on.
    pub fn subscribe(&self) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock_subscribers().push(Subscriber { id, tx });
        EventSubscription { id, rx }
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.lock_subscribers();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Deliver an event to every live subscriber. Non-blocking.
    ///
    /// Returns the number of subscribers that received it. Subscribers whose
    /// receiving half was dropped are pruned here.
    pub fn emit(&self, event: Event) -> usize {
        self.emit_count.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.lock_subscribers();
        subscribers.retain(|s| s.tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.lock_subscribers();
        subscribers.retain(|s| !s.tx.is_closed());
        subscribers.len()
    }

    /// Total number of events emitted, delivered or not
    pub fn emit_count(&self) -> u64 {
        self.emit_count.load(Ordering::Relaxed)
    }

    // Emission happens under this lock so all subscribers observe one order
    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of one bus registration
///
/// Dropping it unregisters implicitly.
#[derive(Debug)]
pub struct EventSubscription {
    id: SubscriberId,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventSubscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event, or `None` once the bus is gone or this registration
    /// was removed and drained
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Next already-delivered event, if any
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Drain every event delivered so far
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}
