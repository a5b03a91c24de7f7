//! exthost WebAssembly entry-point loader.
//!
//! Extensions whose `main` points at a WebAssembly module (binary `.wasm` or
//! text `.wat`) are compiled by [`WasmModuleLoader`] and activated inside a
//! fuel- and memory-limited wasmtime store.
//!
//! - **[`config`]** -- [`SandboxConfig`] controls memory and fuel limits.
//! - **[`error`]** -- [`SandboxError`] enumerates every failure mode.
//! - **[`runtime`]** -- [`SandboxRuntime`] owns the wasmtime engine and
//!   instantiates modules with the host functions linked in.
//! - **[`loader`]** -- [`WasmModuleLoader`] compiles entry points through the
//!   engine's module cache.
//! - **[`extension`]** -- [`WasmExtension`] drives a module's `activate` and
//!   `deactivate` exports.
//!
//! # Guest contract
//!
//! A module may export `activate: () -> i32` and `deactivate: () -> i32`;
//! zero means success.  It may import `env.host_log(level, ptr, len)` to emit
//! tracing events.  Exported globals and functions are reported as the
//! extension's exports.

pub mod config;
pub mod error;
pub mod extension;
pub mod loader;
pub mod runtime;

pub use config::SandboxConfig;
pub use error::{Result, SandboxError};
pub use extension::WasmExtension;
pub use loader::WasmModuleLoader;
pub use runtime::{SandboxInstance, SandboxRuntime};
