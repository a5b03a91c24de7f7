//! Sandbox runtime.
//!
//! [`SandboxRuntime`] owns the wasmtime [`Engine`] and the
//! [`SandboxConfig`] limits.  It compiles modules and instantiates them into
//! [`SandboxInstance`]s, each with its own [`Store`], fuel budget, memory
//! limiter, and the host functions linked in.

use wasmtime::{
    Caller, Engine, Extern, Instance, Linker, Module, Store, StoreLimits, StoreLimitsBuilder,
};

use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};

/// Per-instance state stored in the wasmtime [`Store`].
struct HostState {
    /// Extension the instance belongs to; tags guest log output.
    extension_id: String,
    limits: StoreLimits,
}

/// The WebAssembly sandbox runtime.
pub struct SandboxRuntime {
    engine: Engine,
    config: SandboxConfig,
}

impl SandboxRuntime {
    /// Create a new sandbox runtime with the given configuration.
    pub fn new(config: SandboxConfig) -> Result<Self> {
        let mut wasm_config = wasmtime::Config::new();
        wasm_config.consume_fuel(true);
        wasm_config.wasm_memory64(false);

        let engine = Engine::new(&wasm_config)
            .map_err(|e| SandboxError::Compilation(format!("failed to create wasm engine: {e}")))?;

        tracing::info!(
            max_memory = config.max_memory,
            max_fuel = config.max_fuel,
            "sandbox runtime initialized"
        );

        Ok(Self { engine, config })
    }

    /// Create a runtime with default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(SandboxConfig::default())
    }

    /// Return a reference to the wasmtime [`Engine`].
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Return a reference to the current [`SandboxConfig`].
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Compile a module from binary or text WebAssembly.
    pub fn compile(&self, bytes: &[u8]) -> Result<Module> {
        Module::new(&self.engine, bytes).map_err(|e| SandboxError::Compilation(e.to_string()))
    }

    /// Instantiate `module` for `extension_id`.
    ///
    /// The module's start function, if any, runs here under the fuel budget.
    pub fn instantiate(&self, module: &Module, extension_id: &str) -> Result<SandboxInstance> {
        let state = HostState {
            extension_id: extension_id.to_string(),
            limits: StoreLimitsBuilder::new()
                .memory_size(self.config.max_memory)
                .build(),
        };
        let mut store = Store::new(&self.engine, state);
        store.limiter(|state| &mut state.limits);
        store
            .set_fuel(self.config.max_fuel)
            .map_err(|e| SandboxError::Execution(e.to_string()))?;

        let mut linker: Linker<HostState> = Linker::new(&self.engine);
        Self::define_host_functions(&mut linker)?;

        let instance = linker
            .instantiate(&mut store, module)
            .map_err(|e| SandboxError::Instantiation(format!("{e:#}")))?;

        tracing::debug!(extension_id = %extension_id, "wasm instance created");
        Ok(SandboxInstance {
            store,
            instance,
            fuel: self.config.max_fuel,
        })
    }

    /// Define the host functions guests can import.
    fn define_host_functions(linker: &mut Linker<HostState>) -> Result<()> {
        // host_log(level, ptr, len): emit a tracing event tagged with the
        // extension id.  Level 0 is error, 4 and above is trace.
        linker
            .func_wrap(
                "env",
                "host_log",
                |mut caller: Caller<'_, HostState>, level: i32, ptr: i32, len: i32| {
                    let Some(Extern::Memory(memory)) = caller.get_export("memory") else {
                        return;
                    };
                    let data = memory.data(&caller);
                    let start = ptr as u32 as usize;
                    let Some(end) = start.checked_add(len as u32 as usize) else {
                        return;
                    };
                    let Some(bytes) = data.get(start..end) else {
                        return;
                    };
                    let msg = String::from_utf8_lossy(bytes).into_owned();
                    let id = caller.data().extension_id.as_str();
                    match level {
                        0 => tracing::error!(extension_id = %id, guest_msg = %msg),
                        1 => tracing::warn!(extension_id = %id, guest_msg = %msg),
                        2 => tracing::info!(extension_id = %id, guest_msg = %msg),
                        3 => tracing::debug!(extension_id = %id, guest_msg = %msg),
                        _ => tracing::trace!(extension_id = %id, guest_msg = %msg),
                    }
                },
            )
            .map_err(|e| SandboxError::Instantiation(e.to_string()))?;

        Ok(())
    }
}

/// A live module instance bound to one extension.
pub struct SandboxInstance {
    store: Store<HostState>,
    instance: Instance,
    fuel: u64,
}

impl SandboxInstance {
    /// The extension this instance belongs to.
    pub fn extension_id(&self) -> &str {
        &self.store.data().extension_id
    }

    /// Whether the module exports a function called `name`.
    pub fn has_function(&mut self, name: &str) -> bool {
        self.instance.get_func(&mut self.store, name).is_some()
    }

    /// Names of every export, in declaration order.
    pub fn export_names(&mut self) -> Vec<String> {
        self.instance
            .exports(&mut self.store)
            .map(|export| export.name().to_string())
            .collect()
    }

    /// Call a `() -> i32` export with a fresh fuel budget.
    pub fn call(&mut self, name: &str) -> Result<i32> {
        self.store
            .set_fuel(self.fuel)
            .map_err(|e| SandboxError::Execution(e.to_string()))?;

        let func = self
            .instance
            .get_typed_func::<(), i32>(&mut self.store, name)
            .map_err(|e| SandboxError::Execution(format!("bad `{name}` export: {e}")))?;

        func.call(&mut self.store, ())
            .map_err(|e| SandboxError::Trap(format!("{e:#}")))
    }

    /// Call a lifecycle export, treating a non-zero result as failure.
    pub fn call_lifecycle(&mut self, name: &str) -> Result<()> {
        match self.call(name)? {
            0 => Ok(()),
            code => Err(SandboxError::ExitCode {
                export: name.to_string(),
                code,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COUNTER: &str = r#"
        (module
          (import "env" "host_log" (func $log (param i32 i32 i32)))
          (memory (export "memory") 1)
          (data (i32.const 0) "ready")
          (global $hits (mut i32) (i32.const 0))
          (func (export "activate") (result i32)
            (call $log (i32.const 2) (i32.const 0) (i32.const 5))
            (global.set $hits (i32.add (global.get $hits) (i32.const 1)))
            (i32.const 0))
          (func (export "hits") (result i32)
            (global.get $hits)))
    "#;

    const SPIN: &str = r#"
        (module
          (func (export "activate") (result i32)
            (loop $forever (br $forever))
            (i32.const 0)))
    "#;

    #[test]
    fn create_runtime_with_defaults() {
        let rt = SandboxRuntime::with_defaults().unwrap();
        assert_eq!(rt.config().max_fuel, 10_000_000);
        let _engine = rt.engine();
    }

    #[test]
    fn compile_rejects_garbage() {
        let rt = SandboxRuntime::with_defaults().unwrap();
        let err = rt.compile(b"garbage bytes").unwrap_err();
        assert!(matches!(err, SandboxError::Compilation(_)));
    }

    #[test]
    fn instance_state_survives_between_calls() {
        let rt = SandboxRuntime::with_defaults().unwrap();
        let module = rt.compile(COUNTER.as_bytes()).unwrap();
        let mut instance = rt.instantiate(&module, "acme.counter").unwrap();

        assert_eq!(instance.extension_id(), "acme.counter");
        assert!(instance.has_function("activate"));
        assert!(!instance.has_function("deactivate"));
        assert_eq!(instance.export_names(), vec!["memory", "activate", "hits"]);

        instance.call_lifecycle("activate").unwrap();
        instance.call_lifecycle("activate").unwrap();
        assert_eq!(instance.call("hits").unwrap(), 2);
    }

    #[test]
    fn non_zero_lifecycle_result_is_an_error() {
        let rt = SandboxRuntime::with_defaults().unwrap();
        let module = rt.compile(COUNTER.as_bytes()).unwrap();
        let mut instance = rt.instantiate(&module, "acme.counter").unwrap();

        instance.call_lifecycle("activate").unwrap();
        let err = instance.call_lifecycle("hits").unwrap_err();
        assert!(matches!(err, SandboxError::ExitCode { code: 1, .. }));
    }

    #[test]
    fn runaway_guest_runs_out_of_fuel() {
        let rt = SandboxRuntime::new(SandboxConfig::new().with_max_fuel(10_000)).unwrap();
        let module = rt.compile(SPIN.as_bytes()).unwrap();
        let mut instance = rt.instantiate(&module, "acme.spin").unwrap();

        let err = instance.call("activate").unwrap_err();
        assert!(matches!(err, SandboxError::Trap(_)), "{err}");
    }

    #[test]
    fn missing_export_is_an_execution_error() {
        let rt = SandboxRuntime::with_defaults().unwrap();
        let module = rt.compile(SPIN.as_bytes()).unwrap();
        let mut instance = rt.instantiate(&module, "acme.spin").unwrap();

        let err = instance.call("deactivate").unwrap_err();
        assert!(matches!(err, SandboxError::Execution(_)));
    }

    #[test]
    fn memory_limit_blocks_large_modules() {
        let rt = SandboxRuntime::new(SandboxConfig::new().with_max_memory(64 * 1024)).unwrap();
        let module = rt.compile(br#"(module (memory 4))"#).unwrap();
        let err = rt.instantiate(&module, "acme.big").err().unwrap();
        assert!(matches!(err, SandboxError::Instantiation(_)));
    }
}
