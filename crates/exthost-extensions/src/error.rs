//! Error types for the extension engine.

use std::path::PathBuf;
use std::time::Duration;

use exthost_kernel::KernelError;

/// Extension engine errors.
///
/// Errors raised by extension-authored code (activation, deactivation,
/// disposables) cross into this type as plain strings.
#[derive(Debug, thiserror::Error)]
pub enum ExtensionError {
    #[error("failed to analyze extension at `{}`: {reason}", path.display())]
    Analysis { path: PathBuf, reason: String },

    #[error("extension `{id}` has missing dependencies: {}", missing.join(", "))]
    MissingDependency { id: String, missing: Vec<String> },

    #[error("extension `{id}` has circular dependencies: {}", cycle.join(", "))]
    CircularDependency { id: String, cycle: Vec<String> },

    #[error("extension `{id}` did not activate within {timeout:?}")]
    ActivationTimeout { id: String, timeout: Duration },

    #[error("extension `{id}` failed to activate: {reason}")]
    Activation { id: String, reason: String },

    #[error("extension `{id}` failed to deactivate: {reason}")]
    Deactivation { id: String, reason: String },

    #[error("cannot remove extension `{id}`: {reason}")]
    Removal { id: String, reason: String },

    #[error("extension not found: `{0}`")]
    NotFound(String),

    #[error("extension `{0}` is disabled")]
    Disabled(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("file watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Kernel(#[from] KernelError),
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, ExtensionError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
