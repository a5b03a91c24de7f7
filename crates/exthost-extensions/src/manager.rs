//! Extension manager.
//!
//! [`ExtensionManager`] is the engine's public face.  It owns the extension
//! records, the lifecycle tracker, the module cache, and the reload
//! watchers, and it drives every lifecycle operation:
//!
//! - `load_all` -- analysis errors, dependency resolution, then sequential
//!   activation in topological order.  One unit's failure never stops the
//!   pass.
//! - `start_extension` / `stop_extension` -- user-facing enable/disable with
//!   the disabled set persisted through the [`ConfigSource`].
//! - `remove_extension` -- full teardown plus deletion from disk.
//! - `reload_extension` / `request_reload` -- hot reload of a single unit,
//!   guarded against overlap and debounced for file-system events.
//!
//! The manager is cheap to clone; every clone shares the same state.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::one::Ref;
use exthost_kernel::{
    DependencyReport, DisposableStore, Event, EventBus, ExtensionState, GraphNode,
    LifecycleTracker, ModuleCache, panic_message,
};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::activation::{Activatable, DeclarativeOnly, ModuleExports, ModuleLoader};
use crate::config::ConfigSource;
use crate::context::{ExtensionContext, SecretStore, SharedDisposables, extension_uri};
use crate::error::{ExtensionError, Result};
use crate::manifest;
use crate::record::{ActivatedUnit, ExtensionRecord, ExtensionSummary};
use crate::supervisor::{ActivationOutcome, ActivationSupervisor};
use crate::surface::{CapabilitySurface, CapabilitySurfaceFactory, NoopSurfaceFactory};
use crate::telemetry::{
    ACTIVATE_EVENT, DEACTIVATE_EVENT, REMOVE_EVENT, TelemetrySink, TracingTelemetry,
    record_best_effort,
};
use crate::watcher::ReloadWatcher;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// What one `load_all` pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Ids attempted, in activation order.
    pub order: Vec<String>,
    pub started: Vec<String>,
    pub failed: Vec<String>,
    /// Disabled ids left unloaded.
    pub skipped: Vec<String>,
}

/// Builder for [`ExtensionManager`].
pub struct ExtensionManagerBuilder {
    config: Arc<dyn ConfigSource>,
    loader: Arc<dyn ModuleLoader>,
    surfaces: Arc<dyn CapabilitySurfaceFactory>,
    telemetry: Arc<dyn TelemetrySink>,
    bus: EventBus,
}

impl ExtensionManagerBuilder {
    /// Use `factory` to build capability surfaces.
    #[must_use]
    pub fn surface_factory(mut self, factory: Arc<dyn CapabilitySurfaceFactory>) -> Self {
        self.surfaces = factory;
        self
    }

    /// Send telemetry to `sink`.
    #[must_use]
    pub fn telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }

    /// Publish lifecycle events on `bus`.
    #[must_use]
    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn build(self) -> ExtensionManager {
        let (tx, rx) = mpsc::unbounded_channel();
        let lifecycle = LifecycleTracker::new(self.bus);
        lifecycle.load_disabled(self.config.disabled_ids());

        ExtensionManager {
            inner: Arc::new(ManagerInner {
                config: self.config,
                loader: self.loader,
                surfaces: self.surfaces,
                telemetry: self.telemetry,
                lifecycle,
                records: DashMap::new(),
                active: DashMap::new(),
                installed: Mutex::new(Vec::new()),
                activation_order: Mutex::new(Vec::new()),
                cache: Mutex::new(ModuleCache::new()),
                secrets: Arc::new(DashMap::new()),
                watcher: ReloadWatcher::new(tx),
                reload_rx: Mutex::new(Some(rx)),
            }),
        }
    }
}

/// The extension lifecycle engine.
#[derive(Clone)]
pub struct ExtensionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: Arc<dyn ConfigSource>,
    loader: Arc<dyn ModuleLoader>,
    surfaces: Arc<dyn CapabilitySurfaceFactory>,
    telemetry: Arc<dyn TelemetrySink>,
    lifecycle: LifecycleTracker,
    records: DashMap<String, ExtensionRecord>,
    /// Present exactly while the extension is `started`.
    active: DashMap<String, ActivatedUnit>,
    /// Ids in the order they were handed to `load_all`.
    installed: Mutex<Vec<String>>,
    /// Started ids, oldest first.
    activation_order: Mutex<Vec<String>>,
    cache: Mutex<ModuleCache<ModuleExports>>,
    secrets: Arc<DashMap<String, String>>,
    watcher: ReloadWatcher,
    reload_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

/// Lightweight graph node built from a record snapshot.
struct DependencyNode {
    id: String,
    dependencies: Vec<String>,
}

impl GraphNode for DependencyNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// List the package roots under `dir`, sorted by path.
///
/// A missing directory yields an empty list.
pub async fn discover_extensions(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %dir.display(), "extensions directory does not exist");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut roots = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            roots.push(entry.path());
        }
    }
    roots.sort();

    tracing::debug!(path = %dir.display(), count = roots.len(), "extensions discovered");
    Ok(roots)
}

// ---------------------------------------------------------------------------
// ExtensionManager
// ---------------------------------------------------------------------------

impl ExtensionManager {
    /// Start building a manager around `config` and `loader`.
    pub fn builder(
        config: Arc<dyn ConfigSource>,
        loader: Arc<dyn ModuleLoader>,
    ) -> ExtensionManagerBuilder {
        ExtensionManagerBuilder {
            config,
            loader,
            surfaces: Arc::new(NoopSurfaceFactory),
            telemetry: Arc::new(TracingTelemetry),
            bus: EventBus::default(),
        }
    }

    // -- Queries ------------------------------------------------------------

    /// The lifecycle tracker.
    pub fn lifecycle(&self) -> &LifecycleTracker {
        &self.inner.lifecycle
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Event>> {
        self.inner.lifecycle.bus().subscribe()
    }

    pub fn state(&self, id: &str) -> Option<ExtensionState> {
        self.inner.lifecycle.state(id)
    }

    pub fn error(&self, id: &str) -> Option<String> {
        self.inner.lifecycle.error(id)
    }

    /// Exports of a started extension.
    pub fn exports(&self, id: &str) -> Option<serde_json::Value> {
        self.inner.active.get(id).map(|unit| unit.exports.clone())
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.inner.active.contains_key(id)
    }

    pub fn is_watching(&self, id: &str) -> bool {
        self.inner.watcher.is_watching(id)
    }

    /// Keys currently held by the module cache.
    pub fn cached_modules(&self) -> Vec<PathBuf> {
        self.inner
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
    }

    /// User-facing summaries, in installation order.
    pub fn list_extensions(&self) -> Vec<ExtensionSummary> {
        let lifecycle = &self.inner.lifecycle;
        self.installed_ids()
            .iter()
            .filter_map(|id| {
                let record = self.inner.records.get(id)?;
                Some(ExtensionSummary::from_record(
                    &record,
                    lifecycle.state(id).unwrap_or(ExtensionState::Unloaded),
                    lifecycle.error(id),
                    lifecycle.is_disabled(id),
                ))
            })
            .collect()
    }

    // -- Analysis -----------------------------------------------------------

    /// Analyze one package root and build its record.
    ///
    /// The capability surface is built here, so its resources are tracked
    /// even if activation never runs.
    pub async fn analyze_extension(&self, root: &Path, removable: bool) -> ExtensionRecord {
        let analysis = manifest::analyze(root, removable).await;
        let mut store = DisposableStore::new();
        let surface: CapabilitySurface = if analysis.error.is_none() {
            self.inner
                .surfaces
                .build(&analysis.id, &analysis.manifest, &mut store)
        } else {
            Arc::new(())
        };
        ExtensionRecord::new(analysis, SharedDisposables::new(store), surface)
    }

    /// Analyze several package roots, in order.
    pub async fn analyze_all<I>(&self, roots: I) -> Vec<ExtensionRecord>
    where
        I: IntoIterator<Item = (PathBuf, bool)>,
    {
        let mut records = Vec::new();
        for (root, removable) in roots {
            records.push(self.analyze_extension(&root, removable).await);
        }
        records
    }

    // -- Loading ------------------------------------------------------------

    /// Track `records` and activate them in dependency order.
    ///
    /// Records with analysis errors fail immediately.  Disabled units stay
    /// `unloaded`.  Units with missing dependencies fail.  Circular
    /// dependencies are only warned about.  Activations run one at a time,
    /// so a unit's dependencies have settled before it starts.
    pub async fn load_all(&self, records: Vec<ExtensionRecord>) -> LoadReport {
        let mut report = LoadReport::default();
        let mut batch: HashSet<String> = HashSet::new();

        for record in records {
            let id = record.id.clone();
            if self.inner.records.contains_key(&id) || batch.contains(&id) {
                tracing::warn!(
                    extension_id = %id,
                    path = %record.path.display(),
                    "duplicate extension id, skipping"
                );
                record.disposables.drain(&id);
                continue;
            }

            let analysis_error = record.analysis_error.clone().map(|reason| {
                ExtensionError::Analysis {
                    path: record.path.clone(),
                    reason,
                }
            });

            self.inner.lifecycle.track(id.clone());
            self.inner.records.insert(id.clone(), record);
            self.lock_installed().push(id.clone());

            match analysis_error {
                Some(err) => {
                    self.record_failure(&id, &err);
                    report.failed.push(id);
                }
                None => {
                    batch.insert(id);
                }
            }
        }

        let graph = self.resolve_dependencies();
        report.order = graph
            .order
            .into_iter()
            .filter(|id| batch.contains(id))
            .collect();

        tracing::info!(
            count = report.order.len(),
            order = ?report.order,
            "loading extensions"
        );

        for id in &report.order {
            match self.load_one(id).await {
                Ok(true) => report.started.push(id.clone()),
                Ok(false) => report.skipped.push(id.clone()),
                Err(e) => {
                    tracing::debug!(extension_id = %id, error = %e, "extension did not start");
                    report.failed.push(id.clone());
                }
            }
        }

        tracing::info!(
            started = report.started.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "extensions loaded"
        );
        report
    }

    /// Re-run the dependency passes over every analyzable record and store
    /// the results on the records.
    fn resolve_dependencies(&self) -> DependencyReport {
        let nodes: Vec<DependencyNode> = self
            .installed_ids()
            .into_iter()
            .filter_map(|id| {
                let record = self.inner.records.get(&id)?;
                if record.analysis_error.is_some() {
                    return None;
                }
                Some(DependencyNode {
                    dependencies: record.dependencies().to_vec(),
                    id,
                })
            })
            .collect();

        let strict = self.inner.config.host_config().strict_cycle_detection;
        let graph = DependencyReport::build(&nodes, strict);

        for node in &nodes {
            if let Some(mut record) = self.inner.records.get_mut(&node.id) {
                record.missing_dependencies = graph.missing_for(&node.id).to_vec();
                record.circular_dependencies = graph.circular_for(&node.id).to_vec();
            }
        }
        graph
    }

    /// Activate one unit unless it is disabled.
    ///
    /// Returns `Ok(false)` when the unit was skipped.
    async fn load_one(&self, id: &str) -> Result<bool> {
        if self.inner.lifecycle.is_disabled(id) {
            tracing::info!(extension_id = %id, "extension is disabled, leaving unloaded");
            return Ok(false);
        }

        let circular = self.record(id)?.circular_dependencies.clone();
        if !circular.is_empty() {
            let warning = ExtensionError::CircularDependency {
                id: id.to_string(),
                cycle: circular,
            };
            tracing::warn!(extension_id = %id, error = %warning, "activating despite dependency cycle");
        }

        self.activate(id).await.map(|()| true)
    }

    /// Activate one unit under the activation timeout.
    ///
    /// A no-op if the unit is already starting or started.  On failure the
    /// unit's disposables are drained, the unit is marked `failed`, and the
    /// error is returned.
    pub async fn activate(&self, id: &str) -> Result<()> {
        let (path, entry, subscriptions, surface, missing, analysis_error) = {
            let record = self.record(id)?;
            (
                record.path.clone(),
                record.manifest.entry_point(&record.path),
                record.disposables.clone(),
                Arc::clone(&record.surface),
                record.missing_dependencies.clone(),
                record.analysis_error.clone(),
            )
        };

        if let Some(reason) = analysis_error {
            return Err(ExtensionError::Analysis { path, reason });
        }
        if matches!(
            self.inner.lifecycle.state(id),
            Some(ExtensionState::Starting | ExtensionState::Started)
        ) {
            tracing::debug!(extension_id = %id, "extension already active");
            return Ok(());
        }
        if self.inner.lifecycle.is_disabled(id) {
            return Err(ExtensionError::Disabled(id.to_string()));
        }
        if !missing.is_empty() {
            let err = ExtensionError::MissingDependency {
                id: id.to_string(),
                missing,
            };
            self.record_failure(id, &err);
            return Err(err);
        }

        self.inner.lifecycle.transition(id, ExtensionState::Starting)?;
        tracing::info!(extension_id = %id, "activating extension");

        let unit = match self.load_entry_point(&path, entry.as_deref()) {
            Ok(unit) => unit,
            Err(reason) => {
                let err = ExtensionError::Activation {
                    id: id.to_string(),
                    reason,
                };
                return Err(self.abort_activation(id, &subscriptions, err));
            }
        };

        let config = self.inner.config.host_config();
        let ctx = ExtensionContext {
            extension_id: id.to_string(),
            extension_path: path.clone(),
            extension_uri: extension_uri(id),
            storage_path: config.storage_dir.join(id),
            subscriptions: subscriptions.clone(),
            secrets: SecretStore::new(id, Arc::clone(&self.inner.secrets)),
            surface,
        };
        let timeout = Duration::from_secs(self.inner.config.max_activation_seconds());

        let outcome = ActivationSupervisor::new(config.abort_on_timeout)
            .run(id, unit, ctx, timeout)
            .await;

        let (activation, elapsed) = match outcome {
            ActivationOutcome::Activated {
                activation,
                elapsed,
            } => (activation, elapsed),
            ActivationOutcome::Failed { reason } => {
                let err = ExtensionError::Activation {
                    id: id.to_string(),
                    reason,
                };
                return Err(self.abort_activation(id, &subscriptions, err));
            }
            ActivationOutcome::TimedOut { timeout } => {
                let err = ExtensionError::ActivationTimeout {
                    id: id.to_string(),
                    timeout,
                };
                return Err(self.abort_activation(id, &subscriptions, err));
            }
        };

        self.inner.active.insert(
            id.to_string(),
            ActivatedUnit {
                id: id.to_string(),
                exports: activation.exports,
                deactivate: activation.deactivate,
                activated_at: Utc::now(),
            },
        );
        if let Some(mut record) = self.inner.records.get_mut(id) {
            record.activation_time = Some(elapsed);
        }
        self.inner.lifecycle.transition(id, ExtensionState::Started)?;
        self.lock_activation_order().push(id.to_string());

        record_best_effort(
            self.inner.telemetry.as_ref(),
            ACTIVATE_EVENT,
            json!({
                "extensionId": id,
                "durationMs": u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            }),
        );

        if config.watch {
            if let Err(e) = self.inner.watcher.watch(id, &path) {
                tracing::warn!(extension_id = %id, error = %e, "failed to watch extension");
            }
        }

        tracing::info!(extension_id = %id, elapsed = ?elapsed, "extension activated");
        Ok(())
    }

    /// Sweep the unit's modules out of the cache, then load its entry point.
    fn load_entry_point(
        &self,
        root: &Path,
        entry: Option<&Path>,
    ) -> std::result::Result<Arc<dyn Activatable>, String> {
        let mut cache = self.inner.cache.lock().unwrap_or_else(PoisonError::into_inner);

        let sweep = cache.invalidate_unit(root);
        if !sweep.evicted.is_empty() || !sweep.cleared.is_empty() {
            tracing::debug!(
                root = %root.display(),
                evicted = sweep.evicted.len(),
                cleared = sweep.cleared.len(),
                skipped_native = sweep.skipped_native,
                "module cache swept"
            );
        }

        match entry {
            Some(entry) => self.inner.loader.load(entry, &mut cache),
            None => Ok(Arc::new(DeclarativeOnly)),
        }
    }

    fn abort_activation(
        &self,
        id: &str,
        subscriptions: &SharedDisposables,
        err: ExtensionError,
    ) -> ExtensionError {
        tracing::error!(extension_id = %id, error = %err, "extension activation failed");
        subscriptions.drain(id);
        self.record_failure(id, &err);
        record_best_effort(
            self.inner.telemetry.as_ref(),
            ACTIVATE_EVENT,
            json!({ "extensionId": id, "error": err.to_string() }),
        );
        err
    }

    // -- Teardown -----------------------------------------------------------

    /// Deactivate a started unit.
    ///
    /// The deactivate hook runs first, then every disposable, newest first.
    /// A failing hook is logged and the unit still ends `stopped`.  Units
    /// that are not started are left alone.
    pub async fn deactivate(&self, id: &str) -> Result<()> {
        if self.inner.lifecycle.state(id) != Some(ExtensionState::Started) {
            return Ok(());
        }

        self.inner.lifecycle.transition(id, ExtensionState::Stopping)?;
        self.inner.watcher.unwatch(id);
        self.lock_activation_order().retain(|active| active != id);
        let unit = self.inner.active.remove(id).map(|(_, unit)| unit);

        let mut hook_error = None;
        if let Some(hook) = unit.and_then(|unit| unit.deactivate) {
            // The hook runs on its own task so a panic cannot strand the unit
            // in `stopping`.
            let outcome = match tokio::spawn(async move { hook().await }).await {
                Ok(result) => result,
                Err(join_err) if join_err.is_panic() => {
                    Err(panic_message("deactivate hook", join_err.into_panic().as_ref()))
                }
                Err(join_err) => Err(join_err.to_string()),
            };
            if let Err(reason) = outcome {
                let err = ExtensionError::Deactivation {
                    id: id.to_string(),
                    reason,
                };
                tracing::warn!(extension_id = %id, error = %err, "deactivate hook failed");
                hook_error = Some(err.to_string());
            }
        }

        let subscriptions = self.inner.records.get(id).map(|r| r.disposables.clone());
        let dispose_failures = subscriptions
            .map(|subscriptions| subscriptions.drain(id))
            .unwrap_or_default();

        self.inner.lifecycle.transition(id, ExtensionState::Stopped)?;

        record_best_effort(
            self.inner.telemetry.as_ref(),
            DEACTIVATE_EVENT,
            json!({
                "extensionId": id,
                "error": hook_error,
                "disposeFailures": dispose_failures.len(),
            }),
        );
        tracing::info!(extension_id = %id, "extension deactivated");
        Ok(())
    }

    /// Deactivate every started unit, newest first, and drop all watches.
    pub async fn deactivate_all(&self) {
        let order: Vec<String> = self.lock_activation_order().iter().rev().cloned().collect();
        for id in order {
            if let Err(e) = self.deactivate(&id).await {
                tracing::warn!(extension_id = %id, error = %e, "failed to deactivate extension");
            }
        }
        self.inner.watcher.unwatch_all();
    }

    // -- User operations ----------------------------------------------------

    /// Enable a unit and activate it.
    pub async fn start_extension(&self, id: &str) -> Result<()> {
        self.enable_extension(id).await
    }

    /// Deactivate a unit and persist it as disabled.
    pub async fn stop_extension(&self, id: &str) -> Result<()> {
        self.disable_extension(id).await
    }

    /// Remove `id` from the disabled set, persist, and activate it.
    pub async fn enable_extension(&self, id: &str) -> Result<()> {
        self.record(id)?;
        if self.inner.lifecycle.set_disabled(id, false) {
            self.persist_disabled()?;
        }
        self.resolve_dependencies();
        self.load_one(id).await.map(|_| ())
    }

    /// Deactivate `id`, add it to the disabled set, and persist.
    pub async fn disable_extension(&self, id: &str) -> Result<()> {
        self.record(id)?;
        self.deactivate(id).await?;
        if self.inner.lifecycle.set_disabled(id, true) {
            self.persist_disabled()?;
        }
        Ok(())
    }

    /// Tear down `id` and delete its package from disk.
    ///
    /// Fails without changing anything if the unit is not removable.
    pub async fn remove_extension(&self, id: &str) -> Result<()> {
        let (removable, path, subscriptions) = {
            let record = self.record(id)?;
            (
                record.removable,
                record.path.clone(),
                record.disposables.clone(),
            )
        };
        if !removable {
            return Err(ExtensionError::Removal {
                id: id.to_string(),
                reason: "extension is not removable".into(),
            });
        }

        self.deactivate(id).await?;
        self.inner.watcher.unwatch(id);
        subscriptions.drain(id);
        self.inner
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .invalidate_unit(&path);

        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ExtensionError::Removal {
                    id: id.to_string(),
                    reason: e.to_string(),
                });
            }
        }

        self.inner.records.remove(id);
        self.lock_installed().retain(|installed| installed != id);
        self.inner.lifecycle.untrack(id);
        if self.inner.lifecycle.set_disabled(id, false) {
            self.persist_disabled()?;
        }
        self.resolve_dependencies();

        record_best_effort(
            self.inner.telemetry.as_ref(),
            REMOVE_EVENT,
            json!({ "extensionId": id }),
        );
        tracing::info!(extension_id = %id, path = %path.display(), "extension removed");
        Ok(())
    }

    // -- Reload -------------------------------------------------------------

    /// Deactivate, re-analyze, and re-activate one unit.
    ///
    /// A call made while a reload of the same unit is running is dropped.
    /// Other units are not touched.
    pub async fn reload_extension(&self, id: &str) -> Result<()> {
        {
            let mut record = self
                .inner
                .records
                .get_mut(id)
                .ok_or_else(|| ExtensionError::NotFound(id.to_string()))?;
            if record.reload_in_flight {
                tracing::debug!(extension_id = %id, "reload already in progress, dropping request");
                return Ok(());
            }
            record.reload_in_flight = true;
        }

        let result = self.reload_unit(id).await;

        if let Some(mut record) = self.inner.records.get_mut(id) {
            record.reload_in_flight = false;
        }
        if let Err(e) = &result {
            tracing::warn!(extension_id = %id, error = %e, "reload failed");
        }
        result
    }

    async fn reload_unit(&self, id: &str) -> Result<()> {
        tracing::info!(extension_id = %id, "reloading extension");
        self.deactivate(id).await?;

        let (path, removable, previous) = {
            let record = self.record(id)?;
            (record.path.clone(), record.removable, record.disposables.clone())
        };

        let fresh = self.analyze_extension(&path, removable).await;
        let rejection = match &fresh.analysis_error {
            Some(reason) => Some(reason.clone()),
            None if fresh.id != id => Some(format!(
                "extension id changed from {id} to {}; reinstall required",
                fresh.id
            )),
            None => None,
        };
        if let Some(reason) = rejection {
            fresh.disposables.drain(&fresh.id);
            let err = ExtensionError::Analysis { path, reason };
            self.record_failure(id, &err);
            return Err(err);
        }

        previous.drain(id);
        if let Some(mut record) = self.inner.records.get_mut(id) {
            record.manifest = fresh.manifest;
            record.disposables = fresh.disposables;
            record.surface = fresh.surface;
            record.activation_time = None;
        }

        self.resolve_dependencies();
        self.load_one(id).await.map(|_| ())
    }

    /// Schedule a reload of `id` after the debounce window.
    ///
    /// Requests that arrive while one is pending or running are dropped.
    /// Must be called from within a Tokio runtime.
    pub fn request_reload(&self, id: &str) {
        {
            let Some(mut record) = self.inner.records.get_mut(id) else {
                tracing::debug!(extension_id = %id, "reload requested for unknown extension");
                return;
            };
            if record.reload_pending || record.reload_in_flight {
                tracing::trace!(extension_id = %id, "reload already scheduled, dropping request");
                return;
            }
            record.reload_pending = true;
        }

        let debounce = self.inner.config.host_config().reload_debounce();
        let manager = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Some(mut record) = manager.inner.records.get_mut(&id) {
                record.reload_pending = false;
            }
            // Failures are logged by reload_extension.
            let _ = manager.reload_extension(&id).await;
        });
    }

    /// Forward watcher notifications into [`ExtensionManager::request_reload`].
    ///
    /// Returns `None` if the listener was already spawned.  The task ends
    /// once every manager clone is dropped.
    pub fn spawn_reload_listener(&self) -> Option<JoinHandle<()>> {
        let mut rx = self
            .inner
            .reload_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);

        Some(tokio::spawn(async move {
            while let Some(id) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                ExtensionManager { inner }.request_reload(&id);
            }
            tracing::debug!("reload listener stopped");
        }))
    }

    // -- Helpers ------------------------------------------------------------

    fn record(&self, id: &str) -> Result<Ref<'_, String, ExtensionRecord>> {
        self.inner
            .records
            .get(id)
            .ok_or_else(|| ExtensionError::NotFound(id.to_string()))
    }

    fn record_failure(&self, id: &str, err: &ExtensionError) {
        if let Err(e) = self.inner.lifecycle.fail(id, err.to_string()) {
            tracing::warn!(extension_id = %id, error = %e, "could not record failure");
        }
    }

    fn persist_disabled(&self) -> Result<()> {
        self.inner
            .config
            .set_disabled_ids(self.inner.lifecycle.disabled_ids())
    }

    fn installed_ids(&self) -> Vec<String> {
        self.lock_installed().clone()
    }

    fn lock_installed(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.inner
            .installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_activation_order(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.inner
            .activation_order
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ExtensionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionManager")
            .field("extensions", &self.inner.records.len())
            .field("active", &self.inner.active.len())
            .field("watcher", &self.inner.watcher)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
