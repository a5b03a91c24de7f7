//! Host configuration.
//!
//! [`HostConfig`] holds the tunables the engine reads at run time.  The
//! engine never owns its configuration storage; it talks to a
//! [`ConfigSource`], of which two implementations ship here:
//!
//! - [`MemoryConfigSource`] -- process-local, used by tests and embedders.
//! - [`FileConfigSource`] -- a TOML (or JSON, by extension) file that the
//!   disabled set is persisted back into.

use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ExtensionError, Result};

/// Lower bound of the activation timeout, in seconds.
pub const MIN_ACTIVATION_SECONDS: u64 = 1;

/// Upper bound of the activation timeout, in seconds.
pub const MAX_ACTIVATION_SECONDS: u64 = 100;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "EXTHOST_CONFIG";

/// Environment variable naming the extensions directory.
pub const EXTENSIONS_DIR_ENV: &str = "EXTHOST_EXTENSIONS_DIR";

/// Engine tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Activation timeout in seconds, clamped to
    /// [`MIN_ACTIVATION_SECONDS`]..=[`MAX_ACTIVATION_SECONDS`].
    ///
    /// Default: **5**.
    pub max_activation_seconds: u64,

    /// Ids that must not be activated.
    pub disabled: Vec<String>,

    /// Parent directory of every extension's private storage.
    ///
    /// Default: **`data/extensions`**.
    pub storage_dir: PathBuf,

    /// Quiet period before a file change triggers a reload, in milliseconds.
    ///
    /// Default: **1 000**.
    pub reload_debounce_ms: u64,

    /// Whether started extensions are watched for changes.
    ///
    /// Default: **true**.
    pub watch: bool,

    /// Report every dependency cycle (strongly connected components) rather
    /// than only direct two-node cycles.
    ///
    /// Default: **true**.
    pub strict_cycle_detection: bool,

    /// Abort the activation task when it times out instead of leaving it
    /// running in the background.
    ///
    /// Default: **true**.
    pub abort_on_timeout: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_activation_seconds: 5,
            disabled: Vec::new(),
            storage_dir: PathBuf::from("data/extensions"),
            reload_debounce_ms: 1_000,
            watch: true,
            strict_cycle_detection: true,
            abort_on_timeout: true,
        }
    }
}

impl HostConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the activation timeout in seconds.
    #[must_use]
    pub fn with_max_activation_seconds(mut self, seconds: u64) -> Self {
        self.max_activation_seconds = seconds;
        self
    }

    /// Set the disabled ids.
    #[must_use]
    pub fn with_disabled<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.disabled = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Set the storage directory.
    #[must_use]
    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = dir.into();
        self
    }

    /// Set the reload debounce in milliseconds.
    #[must_use]
    pub fn with_reload_debounce_ms(mut self, ms: u64) -> Self {
        self.reload_debounce_ms = ms;
        self
    }

    /// Enable or disable file watching.
    #[must_use]
    pub fn with_watch(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }

    /// Select strict (SCC) or direct-only cycle detection.
    #[must_use]
    pub fn with_strict_cycle_detection(mut self, strict: bool) -> Self {
        self.strict_cycle_detection = strict;
        self
    }

    /// Abort or detach timed-out activations.
    #[must_use]
    pub fn with_abort_on_timeout(mut self, abort: bool) -> Self {
        self.abort_on_timeout = abort;
        self
    }

    /// The reload debounce as a [`Duration`].
    pub fn reload_debounce(&self) -> Duration {
        Duration::from_millis(self.reload_debounce_ms)
    }
}

/// Clamp an activation timeout into the accepted range.
pub fn clamp_activation_seconds(seconds: u64) -> u64 {
    seconds.clamp(MIN_ACTIVATION_SECONDS, MAX_ACTIVATION_SECONDS)
}

// ---------------------------------------------------------------------------
// ConfigSource
// ---------------------------------------------------------------------------

/// Where the engine reads its configuration and persists the disabled set.
pub trait ConfigSource: Send + Sync {
    /// Snapshot of the current configuration.
    fn host_config(&self) -> HostConfig;

    /// Replace the persisted disabled set.
    fn set_disabled_ids(&self, ids: Vec<String>) -> Result<()>;

    /// The clamped activation timeout in seconds.
    fn max_activation_seconds(&self) -> u64 {
        clamp_activation_seconds(self.host_config().max_activation_seconds)
    }

    /// The persisted disabled set.
    fn disabled_ids(&self) -> Vec<String> {
        self.host_config().disabled
    }
}

/// A configuration held in memory only.
#[derive(Debug, Default)]
pub struct MemoryConfigSource {
    config: RwLock<HostConfig>,
}

impl MemoryConfigSource {
    /// Wrap `config`.
    pub fn new(config: HostConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }
}

impl ConfigSource for MemoryConfigSource {
    fn host_config(&self) -> HostConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_disabled_ids(&self, ids: Vec<String>) -> Result<()> {
        self.config
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .disabled = ids;
        Ok(())
    }
}

/// A configuration backed by a TOML or JSON file.
///
/// The format follows the file extension: `.json` is JSON, anything else is
/// TOML.
#[derive(Debug)]
pub struct FileConfigSource {
    path: PathBuf,
    config: RwLock<HostConfig>,
}

impl FileConfigSource {
    /// Load the configuration at `path`.
    ///
    /// A missing file yields the defaults; it is created on the first write.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let config = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| {
                ExtensionError::Config(format!("failed to read {}: {e}", path.display()))
            })?;
            let config = parse(&path, &content)?;
            tracing::info!(path = %path.display(), "configuration loaded");
            config
        } else {
            tracing::warn!(path = %path.display(), "configuration file does not exist, using defaults");
            HostConfig::default()
        };

        Ok(Self {
            path,
            config: RwLock::new(config),
        })
    }

    /// The backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, config: &HostConfig) -> Result<()> {
        let content = if is_json(&self.path) {
            serde_json::to_string_pretty(config)
                .map_err(|e| ExtensionError::Config(format!("failed to serialize config as JSON: {e}")))?
        } else {
            toml::to_string_pretty(config)
                .map_err(|e| ExtensionError::Config(format!("failed to serialize config as TOML: {e}")))?
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, content).map_err(|e| {
            ExtensionError::Config(format!("failed to write {}: {e}", self.path.display()))
        })?;

        tracing::debug!(path = %self.path.display(), "configuration saved");
        Ok(())
    }
}

impl ConfigSource for FileConfigSource {
    fn host_config(&self) -> HostConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_disabled_ids(&self, ids: Vec<String>) -> Result<()> {
        let snapshot = {
            let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
            config.disabled = ids;
            config.clone()
        };
        self.save(&snapshot)
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("json")
}

fn parse(path: &Path, content: &str) -> Result<HostConfig> {
    if is_json(path) {
        serde_json::from_str(content)
            .map_err(|e| ExtensionError::Config(format!("failed to parse JSON config: {e}")))
    } else {
        toml::from_str(content)
            .map_err(|e| ExtensionError::Config(format!("failed to parse TOML config: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
