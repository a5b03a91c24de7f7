//! Sandbox error types.
//!
//! Every sandbox subsystem surfaces errors through [`SandboxError`].  At the
//! engine boundary they are flattened to strings, like any other
//! extension-authored failure.

/// Unified error type for the WebAssembly sandbox.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Wasm module failed to compile (e.g. invalid bytecode).
    #[error("wasm compilation error: {0}")]
    Compilation(String),

    /// Wasm module could not be instantiated (e.g. missing imports).
    #[error("wasm instantiation error: {0}")]
    Instantiation(String),

    /// A guest export had an unexpected shape.
    #[error("wasm execution error: {0}")]
    Execution(String),

    /// A Wasm trap was raised during execution, including fuel exhaustion
    /// and memory-limit violations.
    #[error("wasm trap: {0}")]
    Trap(String),

    /// A guest lifecycle export reported failure.
    #[error("`{export}` returned non-zero code {code}")]
    ExitCode { export: String, code: i32 },

    /// An I/O error occurred (e.g. reading a `.wasm` file from disk).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the sandbox crate.
pub type Result<T> = std::result::Result<T, SandboxError>;
