//! exthost engine kernel.
//!
//! This crate provides the I/O-free building blocks that the extension engine
//! composes into a full load/activate/reload pipeline:
//!
//! - **[`graph`]** -- Dependency graph builder (missing and circular
//!   dependencies) and the depth-first topological scheduler.
//! - **[`cache`]** -- Module cache keyed by canonical path, with per-unit
//!   eviction so a unit's code can be loaded fresh without restarting.
//! - **[`disposable`]** -- The [`Disposable`] capability and the ordered
//!   [`DisposableStore`] drained on teardown.
//! - **[`lifecycle`]** -- Per-extension state and last-error bookkeeping plus
//!   the disabled set, backed by [`DashMap`](dashmap::DashMap).
//! - **[`ipc`]** -- Publish/subscribe notification bus backed by
//!   [`tokio::sync::broadcast`].
//! - **[`error`]** -- Unified kernel error types via [`thiserror`].
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod cache;
pub mod disposable;
pub mod error;
pub mod graph;
pub mod ipc;
pub mod lifecycle;

// Re-export the most commonly used types at the crate root for convenience.
pub use cache::{CachedModule, Invalidation, ModuleCache, is_native_module};
pub use disposable::{Disposable, DisposableStore, panic_message};
pub use error::{KernelError, Result};
pub use graph::{
    DependencyReport, GraphNode, direct_cycles, find_cycles, missing_dependencies,
    topological_order,
};
pub use ipc::{Event, EventBus, EventKind};
pub use lifecycle::{ExtensionState, LifecycleEntry, LifecycleTracker};
