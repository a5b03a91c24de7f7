//! Extension notification bus.
//!
//! The bus provides a lightweight publish/subscribe mechanism built on top of
//! [`tokio::sync::broadcast`].  Every lifecycle transition is published as an
//! [`Event`] so that UI layers and other observers can follow what the engine
//! does without polling.
//!
//! Events are wrapped in [`Arc`] so that broadcasting to multiple subscribers
//! does not require cloning the payload.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use exthost_kernel::ipc::{Event, EventBus, EventKind};
//! # async fn example() {
//! let bus = EventBus::new(256);
//! let mut rx = bus.subscribe();
//!
//! bus.publish(Event::new(EventKind::Starting, "acme.tools"));
//!
//! let event = rx.recv().await.unwrap();
//! assert_eq!(event.kind.name(), "extension-starting");
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// What happened to an extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// The unit returned to `unloaded` (for example because it is disabled).
    Unloaded,
    /// Activation has begun.
    Starting,
    /// Activation completed successfully.
    Started,
    /// Activation or loading failed; the event carries the error.
    Failed,
    /// Deactivation has begun.
    Stopping,
    /// Deactivation completed.
    Stopped,
    /// The unit was removed from the tracked set.
    Removed,
}

impl EventKind {
    /// The notification name published to collaborators.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unloaded => "extension-unloaded",
            Self::Starting => "extension-starting",
            Self::Started => "extension-started",
            Self::Failed => "extension-failed",
            Self::Stopping => "extension-stopping",
            Self::Stopped => "extension-stopped",
            Self::Removed => "extension-removed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A notification that flows through the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// What happened.
    pub kind: EventKind,
    /// The extension the event is about.
    pub extension_id: String,
    /// Failure detail, present for [`EventKind::Failed`].
    pub error: Option<String>,
    /// When the event was produced.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Build an event stamped with the current time.
    pub fn new(kind: EventKind, extension_id: impl Into<String>) -> Self {
        Self {
            kind,
            extension_id: extension_id.into(),
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach a failure detail.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Event bus
// ---------------------------------------------------------------------------

/// Publish/subscribe notification bus backed by [`tokio::sync::broadcast`].
///
/// The bus is cheaply cloneable (`Arc`-backed) and `Send + Sync`.  Subscribers
/// receive [`Arc<Event>`] references, avoiding per-subscriber cloning of the
/// event payload.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

struct EventBusInner {
    sender: broadcast::Sender<Arc<Event>>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// If a subscriber falls behind by more than `capacity` events, it will
    /// receive a [`broadcast::error::RecvError::Lagged`] error indicating how
    /// many events were missed.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(EventBusInner { sender }),
        }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Returns the number of receivers that will observe this event.  With no
    /// subscribers the event is dropped; that is normal during startup.
    pub fn publish(&self, event: Event) -> usize {
        let kind = event.kind;
        match self.inner.sender.send(Arc::new(event)) {
            Ok(n) => {
                tracing::trace!(receivers = n, event = %kind, "event published");
                n
            }
            Err(_) => {
                tracing::trace!(event = %kind, "event published but no active receivers");
                0
            }
        }
    }

    /// Create a new subscriber that will receive all future events.
    ///
    /// Events published *before* this call are **not** replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Event>> {
        self.inner.sender.subscribe()
    }

    /// Return the current number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let receivers = bus.publish(Event::new(EventKind::Started, "acme.tools"));
        assert_eq!(receivers, 1);

        let received = rx.recv().await.expect("should receive event");
        assert_eq!(received.kind, EventKind::Started);
        assert_eq!(received.extension_id, "acme.tools");
        assert!(received.error.is_none());
    }

    #[tokio::test]
    async fn multiple_subscribers_share_payload() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(Event::new(EventKind::Removed, "acme.tools"));

        let e1 = rx1.recv().await.expect("rx1");
        let e2 = rx2.recv().await.expect("rx2");
        assert!(Arc::ptr_eq(&e1, &e2));
    }

    #[test]
    fn publish_with_no_subscribers_is_ok() {
        let bus = EventBus::new(16);
        assert_eq!(bus.publish(Event::new(EventKind::Stopped, "x.y")), 0);
    }

    #[test]
    fn subscriber_count() {
        let bus = EventBus::new(16);
        assert_eq!(bus.subscriber_count(), 0);

        let rx1 = bus.subscribe();
        let _rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(rx1);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn event_names() {
        assert_eq!(EventKind::Starting.name(), "extension-starting");
        assert_eq!(EventKind::Started.name(), "extension-started");
        assert_eq!(EventKind::Stopping.name(), "extension-stopping");
        assert_eq!(EventKind::Stopped.name(), "extension-stopped");
        assert_eq!(EventKind::Removed.name(), "extension-removed");
    }

    #[test]
    fn failed_event_carries_error() {
        let event = Event::new(EventKind::Failed, "a.b").with_error("boom");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "failed");
        assert_eq!(json["error"], "boom");
    }
}
