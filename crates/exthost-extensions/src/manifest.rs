//! Manifest analyzer.
//!
//! Every extension package is a directory with a `package.json` manifest at
//! its root.  [`analyze`] reads that manifest and produces an
//! [`ExtensionAnalysis`].  Analysis never fails outright: a package whose
//! manifest is absent or malformed yields a stub analysis carrying an error,
//! so one broken package cannot prevent the others from loading.

use std::path::{Component, Path, PathBuf};

use exthost_kernel::GraphNode;
use serde::{Deserialize, Serialize};

/// File name of the manifest at every package root.
pub const MANIFEST_FILE: &str = "package.json";

/// Error recorded when the package root has no manifest.
pub const MISSING_MANIFEST: &str = "missing-manifest";

/// Declarative metadata read from `package.json`.
///
/// Unknown fields are ignored; every field defaults when absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExtensionManifest {
    pub name: String,
    pub display_name: String,
    pub version: String,
    pub publisher: String,
    pub description: String,
    /// Entry point relative to the package root.  Packages without one only
    /// contribute declarative content.
    pub main: Option<String>,
    /// Ids (`publisher.name`) this extension needs started first.
    pub extension_dependencies: Vec<String>,
    pub contributes: serde_json::Value,
}

impl ExtensionManifest {
    /// The extension id, `publisher.name`.
    pub fn id(&self) -> String {
        format!("{}.{}", self.publisher, self.name)
    }

    /// Required fields that are empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        [
            ("name", &self.name),
            ("displayName", &self.display_name),
            ("version", &self.version),
            ("publisher", &self.publisher),
            ("description", &self.description),
        ]
        .into_iter()
        .filter(|(_, value)| value.is_empty())
        .map(|(field, _)| field)
        .collect()
    }

    /// Whether `main` stays inside the package root.
    ///
    /// Only plain relative paths qualify; absolute paths and `..` segments
    /// are rejected so every module an extension loads lives under its root
    /// and is swept with it.
    pub fn entry_point_is_contained(&self) -> bool {
        self.main.as_deref().is_none_or(|main| {
            Path::new(main)
                .components()
                .all(|part| matches!(part, Component::Normal(_) | Component::CurDir))
        })
    }

    /// Resolve the entry point against the package root.
    pub fn entry_point(&self, root: &Path) -> Option<PathBuf> {
        self.main
            .as_deref()
            .filter(|main| !main.is_empty())
            .map(|main| root.join(main))
    }
}

/// The outcome of reading one package root.
#[derive(Debug, Clone)]
pub struct ExtensionAnalysis {
    /// `publisher.name`, or the package path when analysis failed.
    pub id: String,
    /// Canonical package root.
    pub path: PathBuf,
    pub manifest: ExtensionManifest,
    /// Whether the user may delete the package.
    pub removable: bool,
    /// Set when the manifest could not be read.
    pub error: Option<String>,
}

impl ExtensionAnalysis {
    /// An analysis for a package whose manifest could not be used.
    ///
    /// The id is the package path, which no `publisher.name` id can collide
    /// with, so one broken package never shadows another.
    fn stub(path: PathBuf, removable: bool, error: String) -> Self {
        Self {
            id: path.display().to_string(),
            path,
            manifest: ExtensionManifest::default(),
            removable,
            error: Some(error),
        }
    }
}

impl GraphNode for ExtensionAnalysis {
    fn id(&self) -> &str {
        &self.id
    }

    fn dependencies(&self) -> &[String] {
        &self.manifest.extension_dependencies
    }
}

/// Analyze the package rooted at `root`.
///
/// The root is canonicalized first so cache sweeps and watches agree on one
/// spelling of the path.  Missing required manifest fields are logged but do
/// not fail the analysis.
pub async fn analyze(root: &Path, removable: bool) -> ExtensionAnalysis {
    let path = match tokio::fs::canonicalize(root).await {
        Ok(path) => path,
        Err(e) => {
            tracing::warn!(path = %root.display(), error = %e, "extension root not found");
            return ExtensionAnalysis::stub(root.to_path_buf(), removable, MISSING_MANIFEST.into());
        }
    };

    let manifest_path = path.join(MANIFEST_FILE);
    let content = match tokio::fs::read_to_string(&manifest_path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "extension has no manifest");
            return ExtensionAnalysis::stub(path, removable, MISSING_MANIFEST.into());
        }
        Err(e) => {
            tracing::warn!(path = %manifest_path.display(), error = %e, "failed to read manifest");
            return ExtensionAnalysis::stub(path, removable, format!("unreadable manifest: {e}"));
        }
    };

    let manifest: ExtensionManifest = match serde_json::from_str(&content) {
        Ok(manifest) => manifest,
        Err(e) => {
            tracing::warn!(path = %manifest_path.display(), error = %e, "malformed manifest");
            return ExtensionAnalysis::stub(path, removable, format!("malformed manifest: {e}"));
        }
    };

    let missing = manifest.missing_fields();
    if !missing.is_empty() {
        tracing::warn!(
            path = %path.display(),
            fields = ?missing,
            "manifest is missing required fields"
        );
    }

    let id = manifest.id();
    if !manifest.entry_point_is_contained() {
        let main = manifest.main.clone().unwrap_or_default();
        tracing::warn!(extension_id = %id, main = %main, "entry point escapes the package root");
        return ExtensionAnalysis {
            id,
            path,
            manifest,
            removable,
            error: Some(format!("entry point `{main}` is outside the package root")),
        };
    }

    tracing::debug!(
        extension_id = %id,
        version = %manifest.version,
        dependencies = manifest.extension_dependencies.len(),
        "manifest analyzed"
    );

    ExtensionAnalysis {
        id,
        path,
        manifest,
        removable,
        error: None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
