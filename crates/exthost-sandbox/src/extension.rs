//! WebAssembly-backed extensions.
//!
//! [`WasmExtension`] adapts a compiled module to the engine's
//! [`Activatable`] contract.  Each activation gets its own instance, which
//! lives until the matching deactivate hook runs, so guest state written in
//! `activate` is still there in `deactivate`.  Guest calls are synchronous
//! and run on the blocking pool.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use exthost_extensions::{Activatable, Activation, ExtensionContext};
use wasmtime::Module;

use crate::error::{Result, SandboxError};
use crate::runtime::{SandboxInstance, SandboxRuntime};

const ACTIVATE_EXPORT: &str = "activate";
const DEACTIVATE_EXPORT: &str = "deactivate";

/// A compiled extension entry point.
pub struct WasmExtension {
    runtime: Arc<SandboxRuntime>,
    module: Module,
    entry: PathBuf,
}

impl WasmExtension {
    pub fn new(runtime: Arc<SandboxRuntime>, module: Module, entry: PathBuf) -> Self {
        Self {
            runtime,
            module,
            entry,
        }
    }
}

/// Run a blocking guest operation off the async runtime.
async fn blocking<T, F>(f: F) -> std::result::Result<T, String>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(join_err) => Err(format!("guest call aborted: {join_err}")),
    }
}

#[async_trait]
impl Activatable for WasmExtension {
    async fn activate(&self, ctx: ExtensionContext) -> std::result::Result<Activation, String> {
        let runtime = Arc::clone(&self.runtime);
        let module = self.module.clone();
        let id = ctx.extension_id.clone();

        let (instance, exports, has_deactivate) = blocking(move || {
            let mut instance = runtime.instantiate(&module, &id)?;
            if instance.has_function(ACTIVATE_EXPORT) {
                instance.call_lifecycle(ACTIVATE_EXPORT)?;
            }
            let exports = instance.export_names();
            let has_deactivate = instance.has_function(DEACTIVATE_EXPORT);
            Ok::<_, SandboxError>((instance, exports, has_deactivate))
        })
        .await?;

        tracing::debug!(
            extension_id = %ctx.extension_id,
            entry = %self.entry.display(),
            exports = exports.len(),
            "wasm extension activated"
        );

        let activation = Activation::new(serde_json::json!({
            "entry": self.entry.display().to_string(),
            "exports": exports,
        }));
        if !has_deactivate {
            return Ok(activation);
        }

        let instance: Arc<Mutex<SandboxInstance>> = Arc::new(Mutex::new(instance));
        Ok(activation.with_deactivate(move || async move {
            blocking(move || {
                instance
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .call_lifecycle(DEACTIVATE_EXPORT)
            })
            .await
        }))
    }
}
