//! Disposal registry.
//!
//! Every resource an extension acquires (a subscription, a watcher, a handle
//! handed out by the capability surface) is recorded as a [`Disposable`] in
//! the extension's [`DisposableStore`].  Teardown drains the store: each
//! disposable is invoked exactly once, in reverse registration order, and a
//! failing or panicking disposable is logged without aborting the rest of the
//! drain.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// A resource-release handle invoked exactly once during teardown.
///
/// Any `FnOnce() -> Result<(), String> + Send` closure is a disposable.
pub trait Disposable: Send {
    /// Release the resource.
    fn dispose(self: Box<Self>) -> Result<(), String>;
}

impl<F> Disposable for F
where
    F: FnOnce() -> Result<(), String> + Send,
{
    fn dispose(self: Box<Self>) -> Result<(), String> {
        (*self)()
    }
}

/// Ordered list of resources owned by one extension.
#[derive(Default)]
pub struct DisposableStore {
    items: Vec<Box<dyn Disposable>>,
}

impl DisposableStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a resource for later release.
    pub fn push(&mut self, disposable: impl Disposable + 'static) {
        self.items.push(Box::new(disposable));
    }

    /// Record an already boxed resource.
    pub fn push_boxed(&mut self, disposable: Box<dyn Disposable>) {
        self.items.push(disposable);
    }

    /// Number of resources awaiting release.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if nothing is awaiting release.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Move every recorded resource out, leaving the store empty.
    ///
    /// Lets callers release a lock on the store before running the
    /// (possibly slow) disposal itself via [`DisposableStore::dispose_all`].
    pub fn take(&mut self) -> DisposableStore {
        std::mem::take(self)
    }

    /// Release every resource, newest first.
    ///
    /// Individual failures and panics are logged and collected; the drain
    /// always runs to completion.  Returns the collected failure messages.
    pub fn dispose_all(&mut self, extension_id: &str) -> Vec<String> {
        let mut failures = Vec::new();
        let total = self.items.len();

        while let Some(item) = self.items.pop() {
            let result = catch_unwind(AssertUnwindSafe(|| item.dispose()))
                .unwrap_or_else(|payload| Err(panic_message("disposable", payload.as_ref())));
            if let Err(err) = result {
                tracing::warn!(
                    extension_id = %extension_id,
                    error = %err,
                    "failed to dispose resource"
                );
                failures.push(err);
            }
        }

        if total > 0 {
            tracing::debug!(
                extension_id = %extension_id,
                disposed = total,
                failed = failures.len(),
                "disposables drained"
            );
        }
        failures
    }
}

/// Describe a caught panic payload.
///
/// Panics raised with a string literal or a formatted message keep their
/// text; any other payload is reported generically.
pub fn panic_message(what: &str, payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned());
    match detail {
        Some(detail) => format!("{what} panicked: {detail}"),
        None => format!("{what} panicked"),
    }
}

impl fmt::Debug for DisposableStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisposableStore")
            .field("len", &self.items.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder(
        log: &Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
    ) -> impl Disposable + 'static {
        let log = Arc::clone(log);
        move || -> Result<(), String> {
            log.lock().unwrap().push(name);
            Ok(())
        }
    }

    #[test]
    fn drains_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut store = DisposableStore::new();
        store.push(recorder(&log, "first"));
        store.push(recorder(&log, "second"));
        store.push(recorder(&log, "third"));
        assert_eq!(store.len(), 3);

        let failures = store.dispose_all("a.b");
        assert!(failures.is_empty());
        assert!(store.is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["third", "second", "first"]);
    }

    #[test]
    fn failure_does_not_abort_drain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut store = DisposableStore::new();
        store.push(recorder(&log, "kept"));
        store.push(|| -> Result<(), String> {
            Err("handle already closed".to_string())
        });
        store.push(recorder(&log, "last"));

        let failures = store.dispose_all("a.b");
        assert_eq!(failures, vec!["handle already closed".to_string()]);
        assert_eq!(*log.lock().unwrap(), vec!["last", "kept"]);
    }

    #[test]
    fn panicking_disposable_is_collected_and_drain_continues() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut store = DisposableStore::new();
        store.push(recorder(&log, "kept"));
        store.push(|| -> Result<(), String> { panic!("socket vanished") });
        store.push(recorder(&log, "last"));

        let failures = store.dispose_all("a.b");
        assert_eq!(failures, vec!["disposable panicked: socket vanished".to_string()]);
        assert_eq!(*log.lock().unwrap(), vec!["last", "kept"]);
        assert!(store.is_empty());
    }

    #[test]
    fn panic_message_keeps_string_payloads() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("index 3 out of range"));
        assert_eq!(
            panic_message("hook", owned.as_ref()),
            "hook panicked: index 3 out of range"
        );
        let opaque: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message("hook", opaque.as_ref()), "hook panicked");
    }

    #[test]
    fn disposing_twice_runs_each_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut store = DisposableStore::new();
        store.push(recorder(&log, "only"));

        store.dispose_all("a.b");
        store.dispose_all("a.b");
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn take_empties_the_source() {
        let mut store = DisposableStore::new();
        store.push(|| -> Result<(), String> { Ok(()) });
        store.push_boxed(Box::new(|| -> Result<(), String> { Ok(()) }));

        let mut taken = store.take();
        assert!(store.is_empty());
        assert_eq!(taken.len(), 2);
        assert!(taken.dispose_all("a.b").is_empty());
    }
}
