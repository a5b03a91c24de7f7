//! Lifecycle state tracker.
//!
//! The tracker records the current [`ExtensionState`] and the last error of
//! every extension known to the engine, and keeps the set of extensions the
//! user disabled.  Every accepted transition is published on the
//! [`EventBus`] so observers see the exact sequence the engine went through.
//!
//! Internally the tracker is backed by [`DashMap`] which provides lock-free
//! concurrent reads and fine-grained write locking, making it safe to share
//! across tasks without a global `RwLock`.
//!
//! # State machine
//!
//! ```text
//! unloaded --> starting --> started --> stopping --> stopped
//!     |            \                                    |
//!     |             \-> failed <------------------------/
//!     \------------------^
//! ```
//!
//! `stopped` and `failed` units may start again; any non-running unit may fall
//! back to `unloaded` (for example when it gets disabled).
//!
//! # Example
//!
//! ```rust
//! # use exthost_kernel::ipc::EventBus;
//! # use exthost_kernel::lifecycle::{ExtensionState, LifecycleTracker};
//! let tracker = LifecycleTracker::new(EventBus::default());
//! tracker.track("acme.tools");
//!
//! tracker.transition("acme.tools", ExtensionState::Starting).unwrap();
//! tracker.fail("acme.tools", "entry point threw").unwrap();
//! assert_eq!(tracker.state("acme.tools"), Some(ExtensionState::Failed));
//! assert_eq!(tracker.error("acme.tools").as_deref(), Some("entry point threw"));
//! ```

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};
use crate::ipc::{Event, EventBus, EventKind};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Lifecycle state of an extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionState {
    /// Known to the engine but never activated (or disabled).
    Unloaded,
    /// Analysis, dependency resolution, or activation failed.
    Failed,
    /// The entry point's activation is running.
    Starting,
    /// Activation succeeded; the unit is in the active set.
    Started,
    /// Deactivation is running.
    Stopping,
    /// Deactivation completed.
    Stopped,
}

impl ExtensionState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: ExtensionState) -> bool {
        use ExtensionState::*;
        matches!(
            (self, next),
            (Unloaded | Stopped | Failed, Starting)
                | (Unloaded | Stopped | Failed, Failed)
                | (Unloaded | Stopped | Failed, Unloaded)
                | (Starting, Started | Failed)
                | (Started, Stopping)
                | (Stopping, Stopped)
        )
    }

    /// The notification published when a unit enters this state.
    pub fn event_kind(self) -> EventKind {
        match self {
            Self::Unloaded => EventKind::Unloaded,
            Self::Failed => EventKind::Failed,
            Self::Starting => EventKind::Starting,
            Self::Started => EventKind::Started,
            Self::Stopping => EventKind::Stopping,
            Self::Stopped => EventKind::Stopped,
        }
    }
}

impl fmt::Display for ExtensionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unloaded => "unloaded",
            Self::Failed => "failed",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Snapshot of one extension's lifecycle bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEntry {
    /// Extension id (`publisher.name`).
    pub id: String,
    /// Current state.
    pub state: ExtensionState,
    /// If `state == Failed`, the captured failure detail.
    pub last_error: Option<String>,
    /// When the state last changed.
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Concurrent lifecycle tracker backed by [`DashMap`].
///
/// The tracker is cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct LifecycleTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    entries: DashMap<String, LifecycleEntry>,
    disabled: DashSet<String>,
    bus: EventBus,
}

impl LifecycleTracker {
    /// Create an empty tracker publishing on `bus`.
    #[must_use]
    pub fn new(bus: EventBus) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                entries: DashMap::new(),
                disabled: DashSet::new(),
                bus,
            }),
        }
    }

    /// The bus transitions are published on.
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Start tracking an extension in the `unloaded` state.
    ///
    /// Tracking an id twice keeps the existing entry.
    pub fn track(&self, id: impl Into<String>) {
        let id = id.into();
        self.inner.entries.entry(id.clone()).or_insert_with(|| {
            tracing::debug!(extension_id = %id, "extension tracked");
            LifecycleEntry {
                id,
                state: ExtensionState::Unloaded,
                last_error: None,
                updated_at: Utc::now(),
            }
        });
    }

    /// Stop tracking an extension and publish `extension-removed`.
    ///
    /// Returns the removed entry if it existed.
    pub fn untrack(&self, id: &str) -> Option<LifecycleEntry> {
        let removed = self.inner.entries.remove(id).map(|(_, entry)| entry);
        if removed.is_some() {
            tracing::info!(extension_id = %id, "extension untracked");
            self.inner.bus.publish(Event::new(EventKind::Removed, id));
        }
        removed
    }

    /// Whether the id is tracked.
    pub fn is_tracked(&self, id: &str) -> bool {
        self.inner.entries.contains_key(id)
    }

    /// Current state of a tracked extension.
    pub fn state(&self, id: &str) -> Option<ExtensionState> {
        self.inner.entries.get(id).map(|e| e.state)
    }

    /// Last recorded error of a tracked extension.
    pub fn error(&self, id: &str) -> Option<String> {
        self.inner.entries.get(id).and_then(|e| e.last_error.clone())
    }

    /// Retrieve a snapshot of an extension's entry.
    pub fn get(&self, id: &str) -> Result<LifecycleEntry> {
        self.inner
            .entries
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| KernelError::ExtensionNotTracked {
                extension_id: id.to_string(),
            })
    }

    /// Move an extension to `next`, publishing the matching event.
    ///
    /// Any transition other than into `failed` clears the last error.
    /// Returns the previous state.
    pub fn transition(&self, id: &str, next: ExtensionState) -> Result<ExtensionState> {
        self.apply(id, next, None)
    }

    /// Move an extension to `failed` and record `error`.
    pub fn fail(&self, id: &str, error: impl Into<String>) -> Result<()> {
        self.apply(id, ExtensionState::Failed, Some(error.into()))
            .map(|_| ())
    }

    fn apply(&self, id: &str, next: ExtensionState, error: Option<String>) -> Result<ExtensionState> {
        let previous = {
            let mut entry =
                self.inner
                    .entries
                    .get_mut(id)
                    .ok_or_else(|| KernelError::ExtensionNotTracked {
                        extension_id: id.to_string(),
                    })?;

            let previous = entry.state;
            if !previous.can_transition_to(next) {
                return Err(KernelError::InvalidTransition {
                    extension_id: id.to_string(),
                    from: previous,
                    to: next,
                });
            }

            entry.state = next;
            entry.last_error = error.clone();
            entry.updated_at = Utc::now();
            previous
        };

        match &error {
            Some(err) => tracing::warn!(
                extension_id = %id,
                from = %previous,
                error = %err,
                "extension entered failed state"
            ),
            None => tracing::debug!(
                extension_id = %id,
                from = %previous,
                to = %next,
                "extension state changed"
            ),
        }

        let mut event = Event::new(next.event_kind(), id);
        event.error = error;
        self.inner.bus.publish(event);

        Ok(previous)
    }

    // -- Disabled set -------------------------------------------------------

    /// Replace the disabled set, typically with ids read from persisted
    /// configuration.
    pub fn load_disabled<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.disabled.clear();
        for id in ids {
            self.inner.disabled.insert(id.into());
        }
    }

    /// Add or remove an id from the disabled set.
    ///
    /// Returns `true` if the set changed.
    pub fn set_disabled(&self, id: &str, disabled: bool) -> bool {
        let changed = if disabled {
            self.inner.disabled.insert(id.to_string())
        } else {
            self.inner.disabled.remove(id).is_some()
        };
        if changed {
            tracing::info!(extension_id = %id, disabled, "disabled set updated");
        }
        changed
    }

    /// Whether the id is in the disabled set.
    pub fn is_disabled(&self, id: &str) -> bool {
        self.inner.disabled.contains(id)
    }

    /// The disabled ids, sorted for stable persistence.
    pub fn disabled_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.disabled.iter().map(|id| id.clone()).collect();
        ids.sort();
        ids
    }

    // -- Queries ------------------------------------------------------------

    /// Return a snapshot of all tracked extensions.
    pub fn list_all(&self) -> Vec<LifecycleEntry> {
        self.inner.entries.iter().map(|e| e.value().clone()).collect()
    }

    /// Return only extensions in the given state.
    pub fn list_by_state(&self, state: ExtensionState) -> Vec<LifecycleEntry> {
        self.inner
            .entries
            .iter()
            .filter(|e| e.value().state == state)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Number of tracked extensions.
    pub fn count(&self) -> usize {
        self.inner.entries.len()
    }
}

impl Default for LifecycleTracker {
    fn default() -> Self {
        Self::new(EventBus::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
