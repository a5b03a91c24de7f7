//! Activation context.
//!
//! The [`ExtensionContext`] is the only thing an extension's `activate` entry
//! point receives from the host.  Its `subscriptions` share storage with the
//! engine's disposal store for that extension, so anything the extension
//! registers there is released on deactivation.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use exthost_kernel::{Disposable, DisposableStore};

use crate::surface::CapabilitySurface;

/// URI scheme of extension resource URIs.
pub const EXTENSION_URI_SCHEME: &str = "extension";

/// A disposal store shared between the engine and the extension.
#[derive(Clone, Default)]
pub struct SharedDisposables {
    inner: Arc<Mutex<DisposableStore>>,
}

impl SharedDisposables {
    /// Share an existing store.
    pub fn new(store: DisposableStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    /// Register a resource for release on teardown.
    pub fn push(&self, disposable: impl Disposable + 'static) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(disposable);
    }

    /// Number of resources awaiting release.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns `true` if nothing is awaiting release.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release everything registered so far, newest first.
    ///
    /// The lock is released before any disposable runs.
    pub fn drain(&self, extension_id: &str) -> Vec<String> {
        let mut taken = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        taken.dispose_all(extension_id)
    }
}

impl std::fmt::Debug for SharedDisposables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDisposables")
            .field("len", &self.len())
            .finish()
    }
}

/// Per-extension secret storage backed by a host-wide map.
///
/// Keys are namespaced by extension id, so extensions cannot read each
/// other's secrets.
#[derive(Debug, Clone)]
pub struct SecretStore {
    extension_id: String,
    secrets: Arc<DashMap<String, String>>,
}

impl SecretStore {
    /// Scope the host-wide `secrets` map to `extension_id`.
    pub fn new(extension_id: &str, secrets: Arc<DashMap<String, String>>) -> Self {
        Self {
            extension_id: extension_id.to_string(),
            secrets,
        }
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}/{key}", self.extension_id)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.secrets.get(&self.scoped(key)).map(|v| v.clone())
    }

    pub fn store(&self, key: &str, value: impl Into<String>) {
        self.secrets.insert(self.scoped(key), value.into());
    }

    pub fn delete(&self, key: &str) -> bool {
        self.secrets.remove(&self.scoped(key)).is_some()
    }
}

/// Everything an extension receives at activation.
#[derive(Clone)]
pub struct ExtensionContext {
    pub extension_id: String,
    /// Canonical package root.
    pub extension_path: PathBuf,
    /// `extension://<id>`.
    pub extension_uri: String,
    /// Private storage directory; created by the extension on demand.
    pub storage_path: PathBuf,
    pub subscriptions: SharedDisposables,
    pub secrets: SecretStore,
    pub surface: CapabilitySurface,
}

impl ExtensionContext {
    /// Downcast the capability surface to its concrete type.
    pub fn surface<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.surface).downcast::<T>().ok()
    }
}

impl std::fmt::Debug for ExtensionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionContext")
            .field("extension_id", &self.extension_id)
            .field("extension_path", &self.extension_path)
            .field("storage_path", &self.storage_path)
            .finish_non_exhaustive()
    }
}

/// Build the resource URI of an extension.
pub fn extension_uri(extension_id: &str) -> String {
    format!("{EXTENSION_URI_SCHEME}://{extension_id}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
