//! Entry-point loader.
//!
//! [`WasmModuleLoader`] implements the engine's [`ModuleLoader`] contract.
//! Compiled modules are stored in the engine's module cache keyed by the
//! entry path, so a unit whose cache entries were swept for a reload is
//! recompiled from the bytes currently on disk, while other units keep
//! their compiled code.

use std::path::Path;
use std::sync::Arc;

use exthost_extensions::{Activatable, ModuleExports, ModuleLoader};
use exthost_kernel::ModuleCache;
use wasmtime::Module;

use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};
use crate::extension::WasmExtension;
use crate::runtime::SandboxRuntime;

/// Compiles WebAssembly entry points through the module cache.
#[derive(Clone)]
pub struct WasmModuleLoader {
    runtime: Arc<SandboxRuntime>,
}

impl WasmModuleLoader {
    /// Create a loader with a fresh runtime.
    pub fn new(config: SandboxConfig) -> Result<Self> {
        Ok(Self::with_runtime(Arc::new(SandboxRuntime::new(config)?)))
    }

    /// Create a loader sharing an existing runtime.
    pub fn with_runtime(runtime: Arc<SandboxRuntime>) -> Self {
        Self { runtime }
    }

    /// Return a clone of the shared runtime handle.
    pub fn runtime(&self) -> Arc<SandboxRuntime> {
        Arc::clone(&self.runtime)
    }

    fn compile_file(&self, path: &Path) -> Result<ModuleExports> {
        let bytes = std::fs::read(path)?;
        let module = self.runtime.compile(&bytes)?;
        tracing::debug!(
            path = %path.display(),
            size_bytes = bytes.len(),
            "compiled wasm entry point"
        );
        Ok(Arc::new(module))
    }
}

impl ModuleLoader for WasmModuleLoader {
    fn load(
        &self,
        entry: &Path,
        cache: &mut ModuleCache<ModuleExports>,
    ) -> std::result::Result<Arc<dyn Activatable>, String> {
        let exports = cache
            .require(entry, None, |path| self.compile_file(path))
            .map_err(|e| format!("failed to load {}: {e}", entry.display()))?;

        let module = exports
            .downcast::<Module>()
            .map_err(|_| {
                SandboxError::Compilation(format!(
                    "cached module for {} is not WebAssembly",
                    entry.display()
                ))
                .to_string()
            })?;

        Ok(Arc::new(WasmExtension::new(
            Arc::clone(&self.runtime),
            Module::clone(&module),
            entry.to_path_buf(),
        )))
    }
}
