//! Event kinds, payload decoding, and the listener registry.
//!
//! Listener callbacks have no inherent identity in Rust, so every
//! registration returns a [`ListenerId`] that stands in for the callback when
//! removing it. Listeners for a kind fire exactly once per emission, in
//! registration order.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde_json::Value;

/// The event kinds a [`crate::ConnectionManager`] emits.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The transport opened (initial connect or reconnect)
    Open,
    /// An inbound payload arrived
    Message,
    /// The transport reported an error
    Error,
    /// The transport closed
    Close,
}

/// An inbound payload, decoded opportunistically.
///
/// Wire payloads are text. Payloads that parse as JSON are delivered
/// structured; anything else is delivered verbatim.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// The payload parsed as JSON
    Json(Value),
    /// The payload as raw text
    Text(String),
}

impl Payload {
    pub(crate) fn decode(text: String) -> Self {
        match serde_json::from_str(&text) {
            Ok(value) => Self::Json(value),
            Err(_) => Self::Text(text),
        }
    }

    /// The decoded JSON value, if the payload parsed as JSON.
    #[must_use]
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Text(_) => None,
        }
    }

    /// The raw text, if the payload did not parse as JSON.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Json(_) => None,
            Self::Text(text) => Some(text),
        }
    }
}

/// A notification delivered to registered listeners.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Event {
    /// The transport opened
    Open,
    /// An inbound payload arrived
    Message {
        /// The decoded payload
        payload: Payload,
    },
    /// The transport reported an error
    Error {
        /// Human-readable error description
        message: String,
    },
    /// The transport closed
    Close {
        /// Close code supplied by the peer, if any
        code: Option<u16>,
        /// Close reason supplied by the peer, if any
        reason: Option<String>,
    },
}

impl Event {
    /// The [`EventKind`] this event is delivered under.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Open => EventKind::Open,
            Self::Message { .. } => EventKind::Message,
            Self::Error { .. } => EventKind::Error,
            Self::Close { .. } => EventKind::Close,
        }
    }
}

/// Handle identifying one listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Per-kind collection of callbacks awaiting notification.
pub(crate) struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: DashMap<EventKind, Vec<(ListenerId, Listener)>>,
}

impl ListenerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            listeners: DashMap::new(),
        }
    }

    pub(crate) fn add<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    pub(crate) fn remove(&self, kind: EventKind, id: ListenerId) -> bool {
        let Some(mut entry) = self.listeners.get_mut(&kind) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|(listener_id, _)| *listener_id != id);
        entry.len() != before
    }

    pub(crate) fn clear(&self) {
        self.listeners.clear();
    }

    /// Invoke all listeners registered for the event's kind, in registration
    /// order. A panicking listener is contained and the remaining listeners
    /// still run.
    pub(crate) fn emit(&self, event: &Event) {
        // Snapshot outside the shard lock so a listener may re-enter the
        // registry without deadlocking.
        let snapshot: Vec<Listener> = self
            .listeners
            .get(&event.kind())
            .map(|entry| entry.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                #[cfg(feature = "tracing")]
                tracing::error!(kind = ?event.kind(), "Listener panicked during event dispatch");
            }
        }
    }
}
