//! Extension lifecycle engine for exthost.
//!
//! This crate turns a set of on-disk extension packages into a correctly
//! ordered, supervised set of running units:
//!
//! - **Manifest analyzer** ([`manifest`]) -- reads `package.json` from a
//!   package root and produces an immutable analysis, or an error stub that
//!   isolates one bad package from the rest.
//!
//! - **Activation supervisor** ([`supervisor`]) -- runs an entry point's
//!   activation raced against a configurable timeout.
//!
//! - **Reload watcher** ([`watcher`]) -- file-system watches that feed a
//!   debounced, re-entrancy-guarded deactivate/reload cycle.
//!
//! - **Extension manager** ([`manager`]) -- the engine itself: `load_all`,
//!   `start_extension`, `stop_extension`, `remove_extension`,
//!   `list_extensions`, and hot reload.
//!
//! Collaborators the engine only knows through narrow contracts live in
//! [`config`] (configuration source), [`surface`] (capability surface
//! factory), [`telemetry`] (telemetry sink), and [`activation`] (entry-point
//! loading and activation).
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use exthost_extensions::{ExtensionManager, MemoryConfigSource, discover_extensions};
//! # use exthost_extensions::activation::ModuleLoader;
//! # async fn example(loader: Arc<dyn ModuleLoader>) -> exthost_extensions::Result<()> {
//! let manager = ExtensionManager::builder(Arc::new(MemoryConfigSource::default()), loader).build();
//!
//! let roots = discover_extensions(Path::new("extensions")).await?;
//! let records = manager.analyze_all(roots.into_iter().map(|root| (root, true))).await;
//! manager.load_all(records).await;
//!
//! for summary in manager.list_extensions() {
//!     println!("{} {}", summary.id, summary.state);
//! }
//! # Ok(())
//! # }
//! ```

pub mod activation;
pub mod config;
pub mod context;
pub mod error;
pub mod manager;
pub mod manifest;
pub mod record;
pub mod supervisor;
pub mod surface;
pub mod telemetry;
pub mod watcher;

pub use activation::{Activatable, Activation, DeactivateHook, ModuleExports, ModuleLoader};
pub use config::{ConfigSource, FileConfigSource, HostConfig, MemoryConfigSource};
pub use context::{ExtensionContext, SecretStore, SharedDisposables};
pub use error::{ExtensionError, Result};
pub use manager::{ExtensionManager, ExtensionManagerBuilder, LoadReport, discover_extensions};
pub use manifest::{ExtensionAnalysis, ExtensionManifest, MANIFEST_FILE, analyze};
pub use record::{ActivatedUnit, ExtensionRecord, ExtensionSummary};
pub use supervisor::{ActivationOutcome, ActivationSupervisor};
pub use surface::{CapabilitySurface, CapabilitySurfaceFactory, NoopSurfaceFactory};
pub use telemetry::{TelemetrySink, TracingTelemetry};
pub use watcher::ReloadWatcher;

pub use exthost_kernel::{EventKind, ExtensionState};
