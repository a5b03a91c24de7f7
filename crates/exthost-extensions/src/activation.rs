//! Entry-point loading and activation contracts.
//!
//! A [`ModuleLoader`] turns an extension's entry point into an
//! [`Activatable`], going through the host's module cache so a reload sees
//! fresh code.  Activation yields an [`Activation`]: the extension's exports
//! plus an optional deactivate hook run at teardown.

use std::any::Any;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use exthost_kernel::ModuleCache;
use futures::future::BoxFuture;

use crate::context::ExtensionContext;

/// What the module cache stores per module.
pub type ModuleExports = Arc<dyn Any + Send + Sync>;

/// Teardown hook returned by an extension's activation.
pub type DeactivateHook = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// A successful activation.
pub struct Activation {
    /// Public API the extension exposes to others.
    pub exports: serde_json::Value,
    pub deactivate: Option<DeactivateHook>,
}

impl Activation {
    /// An activation with no deactivate hook.
    pub fn new(exports: serde_json::Value) -> Self {
        Self {
            exports,
            deactivate: None,
        }
    }

    /// Attach a deactivate hook.
    #[must_use]
    pub fn with_deactivate<F, Fut>(mut self, hook: F) -> Self
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), String>> + Send + 'static,
    {
        self.deactivate = Some(Box::new(move || -> BoxFuture<'static, Result<(), String>> {
            Box::pin(hook())
        }));
        self
    }
}

impl fmt::Debug for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activation")
            .field("exports", &self.exports)
            .field("deactivate", &self.deactivate.is_some())
            .finish()
    }
}

/// A loaded entry point.
#[async_trait]
pub trait Activatable: Send + Sync {
    /// Run the extension's activation.  Errors are extension-authored text.
    async fn activate(&self, ctx: ExtensionContext) -> Result<Activation, String>;
}

/// Loads entry points through the module cache.
pub trait ModuleLoader: Send + Sync {
    /// Load the entry point at `entry`.
    ///
    /// Implementations resolve modules with [`ModuleCache::require`] so that
    /// a swept cache forces a fresh read from disk.
    fn load(
        &self,
        entry: &Path,
        cache: &mut ModuleCache<ModuleExports>,
    ) -> Result<Arc<dyn Activatable>, String>;
}

/// Activation of a package that declares no entry point.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeclarativeOnly;

#[async_trait]
impl Activatable for DeclarativeOnly {
    async fn activate(&self, _ctx: ExtensionContext) -> Result<Activation, String> {
        Ok(Activation::new(serde_json::Value::Null))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
