//! Integration tests for the extension engine.
//!
//! Extensions here are real package directories on disk.  Their entry point
//! is a one-line script read through the module cache by `ScriptLoader`:
//!
//! - `ok...`      -- activate, register a subscription, export the source
//! - `fail:<msg>` -- reject activation with `<msg>`
//! - `sleep:<s>`  -- sleep `<s>` seconds, then activate
//! - `fail-deactivate:<msg>` -- activate, but reject deactivation with `<msg>`
//! - `panic-deactivate` -- activate, but panic during deactivation

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use exthost_extensions::{
    Activatable, Activation, CapabilitySurface, CapabilitySurfaceFactory, ConfigSource,
    EventKind, ExtensionContext, ExtensionError, ExtensionManager, ExtensionManifest,
    ExtensionState, HostConfig, MemoryConfigSource, ModuleExports, ModuleLoader, TelemetrySink,
    discover_extensions,
};
use exthost_kernel::{DisposableStore, ModuleCache};
use serde_json::{Value, json};
use tempfile::TempDir;

type Log = Arc<Mutex<Vec<String>>>;

fn entries(log: &Log, prefix: &str) -> Vec<String> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|line| line.starts_with(prefix))
        .cloned()
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════
//  Test collaborators
// ═══════════════════════════════════════════════════════════════════════

struct ScriptLoader {
    log: Log,
    reads: AtomicUsize,
}

impl ModuleLoader for ScriptLoader {
    fn load(
        &self,
        entry: &Path,
        cache: &mut ModuleCache<ModuleExports>,
    ) -> Result<Arc<dyn Activatable>, String> {
        let exports = cache.require(entry, None, |path| {
            self.reads.fetch_add(1, Ordering::SeqCst);
            std::fs::read_to_string(path)
                .map(|source| Arc::new(source.trim().to_string()) as ModuleExports)
                .map_err(|e| e.to_string())
        })?;
        let source = exports
            .downcast_ref::<String>()
            .cloned()
            .ok_or("cached module is not a script")?;

        Ok(Arc::new(Script {
            source,
            log: Arc::clone(&self.log),
        }))
    }
}

struct Script {
    source: String,
    log: Log,
}

#[async_trait]
impl Activatable for Script {
    async fn activate(&self, ctx: ExtensionContext) -> Result<Activation, String> {
        let id = ctx.extension_id.clone();
        self.log.lock().unwrap().push(format!("activate:{id}"));

        if let Some(reason) = self.source.strip_prefix("fail:") {
            return Err(reason.to_string());
        }
        if let Some(secs) = self.source.strip_prefix("sleep:") {
            let secs: u64 = secs.parse().map_err(|_| "bad sleep".to_string())?;
            tokio::time::sleep(Duration::from_secs(secs)).await;
        }

        let log = Arc::clone(&self.log);
        let sub_id = id.clone();
        ctx.subscriptions.push(move || -> Result<(), String> {
            log.lock().unwrap().push(format!("dispose:{sub_id}"));
            Ok(())
        });

        let log = Arc::clone(&self.log);
        let source = self.source.clone();
        Ok(
            Activation::new(json!({ "source": self.source })).with_deactivate(move || async move {
                log.lock().unwrap().push(format!("deactivate:{id}"));
                if let Some(reason) = source.strip_prefix("fail-deactivate:") {
                    return Err(reason.to_string());
                }
                if source == "panic-deactivate" {
                    panic!("hook exploded");
                }
                Ok(())
            }),
        )
    }
}

/// Allocates one handle per extension and logs its release.
struct RecordingSurfaces {
    log: Log,
}

impl CapabilitySurfaceFactory for RecordingSurfaces {
    fn build(
        &self,
        extension_id: &str,
        _manifest: &ExtensionManifest,
        disposables: &mut DisposableStore,
    ) -> CapabilitySurface {
        let log = Arc::clone(&self.log);
        let id = extension_id.to_string();
        disposables.push(move || -> Result<(), String> {
            log.lock().unwrap().push(format!("surface:{id}"));
            Ok(())
        });
        Arc::new(extension_id.to_string())
    }
}

#[derive(Default)]
struct RecordingTelemetry {
    events: Mutex<Vec<(String, Value)>>,
}

impl TelemetrySink for RecordingTelemetry {
    fn record(&self, event: &str, attributes: &Value) -> Result<(), String> {
        self.events
            .lock()
            .unwrap()
            .push((event.to_string(), attributes.clone()));
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Harness
// ═══════════════════════════════════════════════════════════════════════

struct Harness {
    _tmp: TempDir,
    dir: PathBuf,
    config: Arc<MemoryConfigSource>,
    loader: Arc<ScriptLoader>,
    telemetry: Arc<RecordingTelemetry>,
    log: Log,
    manager: ExtensionManager,
}

impl Harness {
    fn new(config: HostConfig) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("extensions");
        std::fs::create_dir_all(&dir).unwrap();

        let config = Arc::new(MemoryConfigSource::new(
            config.with_storage_dir(tmp.path().join("storage")),
        ));
        let log: Log = Arc::default();
        let loader = Arc::new(ScriptLoader {
            log: Arc::clone(&log),
            reads: AtomicUsize::new(0),
        });
        let telemetry = Arc::new(RecordingTelemetry::default());

        let manager = ExtensionManager::builder(
            Arc::clone(&config) as Arc<dyn ConfigSource>,
            Arc::clone(&loader) as Arc<dyn ModuleLoader>,
        )
        .surface_factory(Arc::new(RecordingSurfaces {
            log: Arc::clone(&log),
        }))
        .telemetry(Arc::clone(&telemetry) as Arc<dyn TelemetrySink>)
        .build();

        Self {
            _tmp: tmp,
            dir,
            config,
            loader,
            telemetry,
            log,
            manager,
        }
    }

    fn quiet() -> Self {
        Self::new(HostConfig::new().with_watch(false))
    }

    fn add(&self, name: &str, deps: &[&str], source: &str) -> PathBuf {
        let root = self.dir.join(name);
        std::fs::create_dir_all(&root).unwrap();
        let manifest = json!({
            "name": name,
            "displayName": name,
            "version": "1.0.0",
            "publisher": "acme",
            "description": "fixture",
            "main": "main.txt",
            "extensionDependencies": deps,
        });
        std::fs::write(root.join("package.json"), manifest.to_string()).unwrap();
        std::fs::write(root.join("main.txt"), source).unwrap();
        root
    }

    async fn load(&self, removable: bool) -> exthost_extensions::LoadReport {
        let roots = discover_extensions(&self.dir).await.unwrap();
        let records = self
            .manager
            .analyze_all(roots.into_iter().map(|root| (root, removable)))
            .await;
        self.manager.load_all(records).await
    }

    fn reads(&self) -> usize {
        self.loader.reads.load(Ordering::SeqCst)
    }

    fn telemetry_events(&self) -> Vec<String> {
        self.telemetry
            .events
            .lock()
            .unwrap()
            .iter()
            .map(|(event, _)| event.clone())
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Load pass
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn dependencies_start_before_dependents() {
    let h = Harness::quiet();
    h.add("app", &["acme.lib"], "ok");
    h.add("lib", &["acme.base"], "ok");
    h.add("base", &[], "ok");

    let report = h.load(true).await;

    assert_eq!(report.order, vec!["acme.base", "acme.lib", "acme.app"]);
    assert_eq!(report.started, report.order);
    assert_eq!(
        entries(&h.log, "activate:"),
        vec!["activate:acme.base", "activate:acme.lib", "activate:acme.app"]
    );
    for id in &report.order {
        assert_eq!(h.manager.state(id), Some(ExtensionState::Started));
        assert!(h.manager.is_active(id));
    }
}

#[tokio::test]
async fn missing_dependency_fails_only_that_unit() {
    let h = Harness::quiet();
    h.add("good", &[], "ok");
    h.add("needy", &["acme.absent"], "ok");

    let report = h.load(true).await;

    assert_eq!(report.started, vec!["acme.good"]);
    assert_eq!(report.failed, vec!["acme.needy"]);
    assert_eq!(h.manager.state("acme.needy"), Some(ExtensionState::Failed));
    assert!(h.manager.error("acme.needy").unwrap().contains("acme.absent"));
    assert!(!h.manager.is_active("acme.needy"));
    assert!(entries(&h.log, "activate:acme.needy").is_empty());

    let summary = h
        .manager
        .list_extensions()
        .into_iter()
        .find(|s| s.id == "acme.needy")
        .unwrap();
    assert_eq!(summary.missing_dependencies, vec!["acme.absent"]);
}

#[tokio::test]
async fn mutual_dependencies_are_reported_but_start() {
    let h = Harness::quiet();
    h.add("x", &["acme.y"], "ok");
    h.add("y", &["acme.x"], "ok");

    let report = h.load(true).await;

    assert_eq!(report.started.len(), 2);
    for summary in h.manager.list_extensions() {
        assert_eq!(summary.state, ExtensionState::Started);
        assert_eq!(summary.circular_dependencies.len(), 1);
    }
}

#[tokio::test]
async fn broken_manifest_is_isolated() {
    let h = Harness::quiet();
    h.add("good", &[], "ok");
    let orphan = h.dir.join("orphan");
    std::fs::create_dir_all(&orphan).unwrap();
    let orphan_id = orphan.canonicalize().unwrap().display().to_string();

    let report = h.load(true).await;

    assert_eq!(report.started, vec!["acme.good"]);
    assert_eq!(report.failed, vec![orphan_id.clone()]);
    assert_eq!(h.manager.state(&orphan_id), Some(ExtensionState::Failed));
    assert!(h.manager.error(&orphan_id).unwrap().contains("missing-manifest"));
}

#[tokio::test]
async fn broken_packages_do_not_shadow_other_packages() {
    let h = Harness::quiet();
    // Sorts before `tools/`, whose manifest declares `acme.tools`.
    std::fs::create_dir_all(h.dir.join("acme.tools")).unwrap();
    h.add("tools", &[], "ok");
    let other = tempfile::tempdir().unwrap();
    for root in [h.dir.join("theme"), other.path().join("theme")] {
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("package.json"), "{ broken").unwrap();
    }

    let mut roots = discover_extensions(&h.dir).await.unwrap();
    roots.push(other.path().join("theme"));
    let records = h
        .manager
        .analyze_all(roots.into_iter().map(|root| (root, true)))
        .await;
    let report = h.manager.load_all(records).await;

    assert_eq!(report.started, vec!["acme.tools"]);
    assert_eq!(report.failed.len(), 3);
    assert_eq!(h.manager.list_extensions().len(), 4);
}

#[tokio::test]
async fn disabled_units_stay_unloaded_without_error() {
    let h = Harness::new(
        HostConfig::new()
            .with_watch(false)
            .with_disabled(["acme.off"]),
    );
    h.add("off", &[], "ok");
    h.add("on", &[], "ok");

    let report = h.load(true).await;

    assert_eq!(report.skipped, vec!["acme.off"]);
    assert_eq!(h.manager.state("acme.off"), Some(ExtensionState::Unloaded));
    assert_eq!(h.manager.error("acme.off"), None);
    assert!(entries(&h.log, "activate:acme.off").is_empty());

    let summary = h
        .manager
        .list_extensions()
        .into_iter()
        .find(|s| s.id == "acme.off")
        .unwrap();
    assert!(summary.disabled);
}

#[tokio::test]
async fn lifecycle_events_follow_each_transition() {
    let h = Harness::quiet();
    h.add("solo", &[], "ok");
    let mut rx = h.manager.subscribe();

    h.load(true).await;

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if event.extension_id == "acme.solo" {
            kinds.push(event.kind);
        }
    }
    assert_eq!(kinds, vec![EventKind::Starting, EventKind::Started]);
}

// ═══════════════════════════════════════════════════════════════════════
//  Activation failures
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn failed_activation_releases_surface_resources() {
    let h = Harness::quiet();
    h.add("bad", &[], "fail:no workspace");

    h.load(true).await;

    assert_eq!(h.manager.state("acme.bad"), Some(ExtensionState::Failed));
    assert!(h.manager.error("acme.bad").unwrap().contains("no workspace"));
    assert!(!h.manager.is_active("acme.bad"));
    assert_eq!(entries(&h.log, "surface:"), vec!["surface:acme.bad"]);
}

#[tokio::test]
async fn slow_activation_times_out() {
    let h = Harness::new(
        HostConfig::new()
            .with_watch(false)
            .with_max_activation_seconds(1),
    );
    h.add("slow", &[], "sleep:30");
    h.add("fast", &[], "ok");

    let started = Instant::now();
    let report = h.load(true).await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(report.failed, vec!["acme.slow"]);
    assert_eq!(report.started, vec!["acme.fast"]);
    let error = h.manager.error("acme.slow").unwrap();
    assert!(error.contains("did not activate within 1s"), "{error}");
    assert!(!h.manager.is_active("acme.slow"));
}

#[tokio::test]
async fn zero_activation_timeout_is_clamped_to_one_second() {
    let h = Harness::new(
        HostConfig::new()
            .with_watch(false)
            .with_max_activation_seconds(0),
    );
    h.add("slow", &[], "sleep:30");

    let report = h.load(true).await;

    assert_eq!(report.failed, vec!["acme.slow"]);
    let error = h.manager.error("acme.slow").unwrap();
    assert!(error.contains("did not activate within 1s"), "{error}");
}

// ═══════════════════════════════════════════════════════════════════════
//  User operations
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn stop_persists_disabled_and_start_reenables() {
    let h = Harness::quiet();
    h.add("tool", &[], "ok");
    h.load(true).await;

    h.manager.stop_extension("acme.tool").await.unwrap();

    assert_eq!(h.manager.state("acme.tool"), Some(ExtensionState::Stopped));
    assert!(!h.manager.is_active("acme.tool"));
    assert_eq!(h.config.disabled_ids(), vec!["acme.tool"]);
    // Hook first, then disposables newest first.
    let teardown: Vec<String> = h
        .log
        .lock()
        .unwrap()
        .iter()
        .filter(|l| !l.starts_with("activate:"))
        .cloned()
        .collect();
    assert_eq!(
        teardown,
        vec!["deactivate:acme.tool", "dispose:acme.tool", "surface:acme.tool"]
    );

    h.manager.start_extension("acme.tool").await.unwrap();

    assert_eq!(h.manager.state("acme.tool"), Some(ExtensionState::Started));
    assert!(h.config.disabled_ids().is_empty());
    assert_eq!(entries(&h.log, "activate:acme.tool").len(), 2);
}

#[tokio::test]
async fn failing_deactivate_hook_still_stops_the_unit() {
    let h = Harness::quiet();
    h.add("stubborn", &[], "fail-deactivate:port still bound");
    h.load(true).await;

    h.manager.stop_extension("acme.stubborn").await.unwrap();

    assert_eq!(h.manager.state("acme.stubborn"), Some(ExtensionState::Stopped));
    assert!(!h.manager.is_active("acme.stubborn"));
    assert_eq!(entries(&h.log, "dispose:"), vec!["dispose:acme.stubborn"]);
    assert_eq!(entries(&h.log, "surface:"), vec!["surface:acme.stubborn"]);

    let events = h.telemetry.events.lock().unwrap().clone();
    let (_, attributes) = events
        .iter()
        .find(|(event, _)| event == "deactivateExtension")
        .expect("deactivation was reported");
    let error = attributes["error"].as_str().unwrap();
    assert!(error.contains("port still bound"), "{error}");
}

#[tokio::test]
async fn panicking_deactivate_hook_still_stops_the_unit() {
    let h = Harness::quiet();
    h.add("volatile", &[], "panic-deactivate");
    h.load(true).await;

    // Run the stop on its own task: the host task must survive the panic.
    let manager = h.manager.clone();
    let stop = tokio::spawn(async move { manager.stop_extension("acme.volatile").await })
        .await
        .unwrap();

    assert!(stop.is_ok());
    assert_eq!(h.manager.state("acme.volatile"), Some(ExtensionState::Stopped));
    assert!(!h.manager.is_active("acme.volatile"));
    assert_eq!(entries(&h.log, "dispose:"), vec!["dispose:acme.volatile"]);
    assert_eq!(entries(&h.log, "surface:"), vec!["surface:acme.volatile"]);

    let events = h.telemetry.events.lock().unwrap().clone();
    let (_, attributes) = events
        .iter()
        .find(|(event, _)| event == "deactivateExtension")
        .expect("deactivation was reported");
    let error = attributes["error"].as_str().unwrap();
    assert!(error.contains("deactivate hook panicked: hook exploded"), "{error}");

    // The unit is not stranded and can be started again.
    h.manager.start_extension("acme.volatile").await.unwrap();
    assert_eq!(h.manager.state("acme.volatile"), Some(ExtensionState::Started));
}

#[tokio::test]
async fn removing_a_builtin_is_rejected_without_side_effects() {
    let h = Harness::quiet();
    let root = h.add("builtin", &[], "ok");
    h.load(false).await;

    let err = h.manager.remove_extension("acme.builtin").await.unwrap_err();

    assert!(matches!(err, ExtensionError::Removal { .. }));
    assert_eq!(h.manager.state("acme.builtin"), Some(ExtensionState::Started));
    assert!(h.manager.is_active("acme.builtin"));
    assert!(root.exists());
}

#[tokio::test]
async fn remove_tears_down_and_deletes_the_package() {
    let h = Harness::quiet();
    let root = h.add("gone", &[], "ok");
    h.load(true).await;
    assert_eq!(h.manager.cached_modules().len(), 1);

    h.manager.remove_extension("acme.gone").await.unwrap();

    assert!(!root.exists());
    assert_eq!(h.manager.state("acme.gone"), None);
    assert!(h.manager.list_extensions().is_empty());
    assert!(h.manager.cached_modules().is_empty());
    assert_eq!(entries(&h.log, "deactivate:").len(), 1);
    assert!(h.telemetry_events().contains(&"removeExtension".to_string()));
}

#[tokio::test]
async fn deactivate_all_runs_newest_first() {
    let h = Harness::quiet();
    h.add("app", &["acme.core"], "ok");
    h.add("core", &[], "ok");
    h.load(true).await;

    h.manager.deactivate_all().await;

    assert_eq!(
        entries(&h.log, "deactivate:"),
        vec!["deactivate:acme.app", "deactivate:acme.core"]
    );
    assert_eq!(h.manager.state("acme.core"), Some(ExtensionState::Stopped));
    assert_eq!(h.manager.state("acme.app"), Some(ExtensionState::Stopped));
}

#[tokio::test]
async fn telemetry_reports_activation_and_deactivation() {
    let h = Harness::quiet();
    h.add("metered", &[], "ok");
    h.load(true).await;
    h.manager.stop_extension("acme.metered").await.unwrap();

    assert_eq!(
        h.telemetry_events(),
        vec!["activateExtension", "deactivateExtension"]
    );
}

// ═══════════════════════════════════════════════════════════════════════
//  Hot reload
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn reload_picks_up_new_code() {
    let h = Harness::quiet();
    let root = h.add("live", &[], "ok-v1");
    h.add("bystander", &[], "ok");
    h.load(true).await;
    assert_eq!(h.reads(), 2);

    std::fs::write(root.join("main.txt"), "ok-v2").unwrap();
    h.manager.reload_extension("acme.live").await.unwrap();

    assert_eq!(h.reads(), 3);
    assert_eq!(
        h.manager.exports("acme.live"),
        Some(json!({ "source": "ok-v2" }))
    );
    assert_eq!(h.manager.state("acme.live"), Some(ExtensionState::Started));
    // Other units keep running untouched.
    assert_eq!(entries(&h.log, "activate:acme.bystander").len(), 1);
    assert!(entries(&h.log, "deactivate:acme.bystander").is_empty());
}

#[tokio::test]
async fn reload_with_broken_manifest_fails_the_unit() {
    let h = Harness::quiet();
    let root = h.add("fragile", &[], "ok");
    h.load(true).await;

    std::fs::write(root.join("package.json"), "{ truncated").unwrap();
    let err = h.manager.reload_extension("acme.fragile").await.unwrap_err();

    assert!(matches!(err, ExtensionError::Analysis { .. }));
    assert_eq!(h.manager.state("acme.fragile"), Some(ExtensionState::Failed));
    assert!(!h.manager.is_active("acme.fragile"));
}

#[tokio::test]
async fn rapid_reload_requests_collapse_into_one() {
    let h = Harness::new(
        HostConfig::new()
            .with_watch(false)
            .with_reload_debounce_ms(50),
    );
    h.add("busy", &[], "ok");
    h.load(true).await;

    h.manager.request_reload("acme.busy");
    h.manager.request_reload("acme.busy");
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(entries(&h.log, "activate:acme.busy").len(), 2);
    assert_eq!(entries(&h.log, "deactivate:acme.busy").len(), 1);
    assert_eq!(h.manager.state("acme.busy"), Some(ExtensionState::Started));
}

#[tokio::test]
async fn file_change_triggers_a_reload() {
    let h = Harness::new(HostConfig::new().with_reload_debounce_ms(50));
    let root = h.add("watched", &[], "ok-v1");
    h.load(true).await;
    assert!(h.manager.is_watching("acme.watched"));
    let _listener = h.manager.spawn_reload_listener().unwrap();

    std::fs::write(root.join("main.txt"), "ok-v2").unwrap();

    let expected = Some(json!({ "source": "ok-v2" }));
    let deadline = Instant::now() + Duration::from_secs(10);
    while h.manager.exports("acme.watched") != expected {
        assert!(Instant::now() < deadline, "reload never happened");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(h.manager.is_watching("acme.watched"));
}
