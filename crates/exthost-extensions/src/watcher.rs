//! Reload watcher.
//!
//! Started extensions get a recursive file-system watch on their package
//! root.  Relevant changes are forwarded as extension ids over an unbounded
//! channel; the manager's reload listener debounces them into reloads.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::error::Result;

/// Per-extension file-system watches.
pub struct ReloadWatcher {
    watchers: Mutex<HashMap<String, RecommendedWatcher>>,
    tx: mpsc::UnboundedSender<String>,
}

impl ReloadWatcher {
    /// Create a watcher set that reports changed extension ids on `tx`.
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            watchers: Mutex::new(HashMap::new()),
            tx,
        }
    }

    /// Watch `root` on behalf of `extension_id`.
    ///
    /// Returns `false` if the extension was already watched.
    pub fn watch(&self, extension_id: &str, root: &Path) -> Result<bool> {
        let mut watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
        if watchers.contains_key(extension_id) {
            return Ok(false);
        }

        let tx = self.tx.clone();
        let id = extension_id.to_string();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if is_relevant(&event) => {
                tracing::trace!(extension_id = %id, paths = ?event.paths, "extension files changed");
                let _ = tx.send(id.clone());
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(extension_id = %id, error = %e, "file watcher error"),
        })?;
        watcher.watch(root, RecursiveMode::Recursive)?;

        watchers.insert(extension_id.to_string(), watcher);
        tracing::debug!(extension_id = %extension_id, root = %root.display(), "watching extension");
        Ok(true)
    }

    /// Stop watching `extension_id`.  Returns `true` if a watch was removed.
    pub fn unwatch(&self, extension_id: &str) -> bool {
        let removed = self
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(extension_id)
            .is_some();
        if removed {
            tracing::debug!(extension_id = %extension_id, "stopped watching extension");
        }
        removed
    }

    /// Stop every watch.
    pub fn unwatch_all(&self) {
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn is_watching(&self, extension_id: &str) -> bool {
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(extension_id)
    }

    pub fn len(&self) -> usize {
        self.watchers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ReloadWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadWatcher").field("watched", &self.len()).finish()
    }
}

fn is_relevant(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
