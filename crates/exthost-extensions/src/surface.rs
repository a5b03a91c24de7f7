//! Capability surface factory.
//!
//! Each extension receives a per-extension capability surface: the host API
//! object it calls into.  The engine treats the surface as opaque and only
//! needs the factory to register anything it allocates with the extension's
//! disposal store, so teardown releases it.

use std::any::Any;
use std::sync::Arc;

use exthost_kernel::DisposableStore;

use crate::manifest::ExtensionManifest;

/// Opaque per-extension host API handle.
pub type CapabilitySurface = Arc<dyn Any + Send + Sync>;

/// Builds the capability surface handed to an extension at activation.
pub trait CapabilitySurfaceFactory: Send + Sync {
    /// Build the surface for `extension_id`.
    ///
    /// Resources the surface owns must be pushed onto `disposables`.
    fn build(
        &self,
        extension_id: &str,
        manifest: &ExtensionManifest,
        disposables: &mut DisposableStore,
    ) -> CapabilitySurface;
}

/// A factory whose surface is the unit value and allocates nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSurfaceFactory;

impl CapabilitySurfaceFactory for NoopSurfaceFactory {
    fn build(
        &self,
        _extension_id: &str,
        _manifest: &ExtensionManifest,
        _disposables: &mut DisposableStore,
    ) -> CapabilitySurface {
        Arc::new(())
    }
}
