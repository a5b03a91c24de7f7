//! Sandbox configuration.
//!
//! [`SandboxConfig`] controls the resource limits applied to every
//! extension instance.  Defaults come from the [`Default`] implementation;
//! the builder-style setters customise individual fields.

/// Resource limits for WebAssembly extension instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    /// Maximum linear memory an instance may allocate, in bytes.
    ///
    /// Default: **16 MiB**.
    pub max_memory: usize,

    /// Fuel (abstract instruction count) granted to each guest call.
    ///
    /// Fuel bounds CPU usage deterministically, independent of wall-clock
    /// time; the engine's activation timeout bounds the rest.
    ///
    /// Default: **10 000 000**.
    pub max_fuel: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_memory: 16 * 1024 * 1024,
            max_fuel: 10_000_000,
        }
    }
}

impl SandboxConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum memory limit (in bytes).
    pub fn with_max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self
    }

    /// Set the fuel granted per guest call.
    pub fn with_max_fuel(mut self, fuel: u64) -> Self {
        self.max_fuel = fuel;
        self
    }
}
