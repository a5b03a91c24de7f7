//! Per-extension bookkeeping.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use exthost_kernel::{ExtensionState, GraphNode};
use serde::Serialize;

use crate::activation::DeactivateHook;
use crate::context::SharedDisposables;
use crate::manifest::{ExtensionAnalysis, ExtensionManifest};
use crate::surface::CapabilitySurface;

/// Everything the engine knows about one installed extension.
///
/// Lifecycle state and the last error live in the lifecycle tracker; a
/// record only holds what analysis and dependency resolution produced.
#[derive(Debug)]
pub struct ExtensionRecord {
    pub id: String,
    pub path: PathBuf,
    pub manifest: ExtensionManifest,
    pub removable: bool,
    pub analysis_error: Option<String>,
    pub missing_dependencies: Vec<String>,
    pub circular_dependencies: Vec<String>,
    pub disposables: SharedDisposables,
    pub surface: CapabilitySurface,
    pub activation_time: Option<Duration>,
    pub(crate) reload_pending: bool,
    pub(crate) reload_in_flight: bool,
}

impl ExtensionRecord {
    pub(crate) fn new(
        analysis: ExtensionAnalysis,
        disposables: SharedDisposables,
        surface: CapabilitySurface,
    ) -> Self {
        Self {
            id: analysis.id,
            path: analysis.path,
            manifest: analysis.manifest,
            removable: analysis.removable,
            analysis_error: analysis.error,
            missing_dependencies: Vec::new(),
            circular_dependencies: Vec::new(),
            disposables,
            surface,
            activation_time: None,
            reload_pending: false,
            reload_in_flight: false,
        }
    }
}

impl GraphNode for ExtensionRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn dependencies(&self) -> &[String] {
        &self.manifest.extension_dependencies
    }
}

/// A started extension.
pub struct ActivatedUnit {
    pub id: String,
    pub exports: serde_json::Value,
    pub deactivate: Option<DeactivateHook>,
    pub activated_at: DateTime<Utc>,
}

impl std::fmt::Debug for ActivatedUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivatedUnit")
            .field("id", &self.id)
            .field("exports", &self.exports)
            .field("activated_at", &self.activated_at)
            .finish_non_exhaustive()
    }
}

/// User-facing view of an extension.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtensionSummary {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub version: String,
    pub publisher: String,
    pub description: String,
    pub path: PathBuf,
    pub removable: bool,
    pub state: ExtensionState,
    pub error: Option<String>,
    pub disabled: bool,
    pub missing_dependencies: Vec<String>,
    pub circular_dependencies: Vec<String>,
    pub activation_ms: Option<u64>,
}

impl ExtensionSummary {
    pub(crate) fn from_record(
        record: &ExtensionRecord,
        state: ExtensionState,
        error: Option<String>,
        disabled: bool,
    ) -> Self {
        let manifest = &record.manifest;
        Self {
            id: record.id.clone(),
            name: manifest.name.clone(),
            display_name: manifest.display_name.clone(),
            version: manifest.version.clone(),
            publisher: manifest.publisher.clone(),
            description: manifest.description.clone(),
            path: record.path.clone(),
            removable: record.removable,
            state,
            error,
            disabled,
            missing_dependencies: record.missing_dependencies.clone(),
            circular_dependencies: record.circular_dependencies.clone(),
            activation_ms: record
                .activation_time
                .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)),
        }
    }
}
