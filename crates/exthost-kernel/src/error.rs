//! Kernel error types.
//!
//! All kernel subsystems surface errors through [`KernelError`], which is the
//! single error type returned by every public API in this crate.  Each variant
//! carries enough context for callers to decide how to handle the failure
//! without inspecting opaque strings.

use std::path::PathBuf;

use crate::lifecycle::ExtensionState;

/// Unified error type for the exthost kernel.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    // -- Lifecycle errors ---------------------------------------------------
    /// The referenced extension is not tracked.
    #[error("extension not tracked: {extension_id}")]
    ExtensionNotTracked {
        /// The id that was looked up.
        extension_id: String,
    },

    /// The requested state change is not part of the lifecycle state machine.
    #[error("invalid state transition for {extension_id}: {from} -> {to}")]
    InvalidTransition {
        extension_id: String,
        from: ExtensionState,
        to: ExtensionState,
    },

    // -- Module cache errors ------------------------------------------------
    /// A module could not be loaded into the cache.
    #[error("failed to load module `{}`: {reason}", path.display())]
    ModuleLoad { path: PathBuf, reason: String },

    // -- Generic ------------------------------------------------------------
    /// Catch-all for unexpected internal errors that don't fit a specific
    /// variant.  Prefer a typed variant whenever possible.
    #[error("internal kernel error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;
