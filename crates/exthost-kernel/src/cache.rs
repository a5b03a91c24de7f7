//! Module cache manager.
//!
//! The engine keeps every loaded code module in a [`ModuleCache`] keyed by the
//! module's canonical path.  Modules form a tree: a module loaded while
//! another one was loading becomes its child.  Re-loading an extension from
//! disk without restarting the host means sweeping the cache first:
//!
//! 1. Native modules (shared libraries) are never touched; they cannot be
//!    safely unloaded.
//! 2. Every module *anchored* inside the extension's root directory is
//!    evicted outright and detached from its parent.
//! 3. Every module reachable from an anchored module (a descendant living
//!    outside the root) keeps its entry but loses its cached exports, and is
//!    detached from its parent.
//!
//! The next [`ModuleCache::require`] of an evicted or cleared module calls the
//! loader again, so the extension observes the newest code on disk.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

/// File extensions of native modules.
const NATIVE_EXTENSIONS: &[&str] = &["node", "so", "dll", "dylib"];

/// Whether the cache key names a native module that must never be evicted.
pub fn is_native_module(key: &Path) -> bool {
    key.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| NATIVE_EXTENSIONS.contains(&ext))
}

/// One module held by the cache.
#[derive(Debug, Clone)]
pub struct CachedModule<T> {
    /// Canonical path of the module.
    pub key: PathBuf,
    /// The module that loaded this one, if any.
    pub parent: Option<PathBuf>,
    /// Modules loaded by this one.
    pub children: Vec<PathBuf>,
    /// Cached exports; `None` once the module was invalidated.
    pub exports: Option<T>,
}

/// What a sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invalidation {
    /// Keys removed from the cache, sorted.
    pub evicted: Vec<PathBuf>,
    /// Keys whose exports were cleared, sorted.
    pub cleared: Vec<PathBuf>,
    /// Native modules inside the root that were left untouched.
    pub skipped_native: usize,
}

/// Arena of loaded modules keyed by canonical path.
#[derive(Debug)]
pub struct ModuleCache<T> {
    modules: HashMap<PathBuf, CachedModule<T>>,
}

impl<T> Default for ModuleCache<T> {
    fn default() -> Self {
        Self {
            modules: HashMap::new(),
        }
    }
}

impl<T: Clone> ModuleCache<T> {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached modules.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Returns `true` if no modules are cached.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Whether `key` has an entry (cleared or not).
    pub fn contains(&self, key: &Path) -> bool {
        self.modules.contains_key(key)
    }

    /// Look up a module entry.
    pub fn get(&self, key: &Path) -> Option<&CachedModule<T>> {
        self.modules.get(key)
    }

    /// Cached exports of `key`, if present and not cleared.
    pub fn exports(&self, key: &Path) -> Option<T> {
        self.modules.get(key).and_then(|m| m.exports.clone())
    }

    /// All cached keys, sorted.
    pub fn keys(&self) -> Vec<PathBuf> {
        let mut keys: Vec<PathBuf> = self.modules.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Store `exports` under `key`, linking it as a child of `parent`.
    ///
    /// An existing entry keeps its children and gets its exports replaced.
    pub fn insert(&mut self, key: impl Into<PathBuf>, parent: Option<&Path>, exports: T) {
        let key = key.into();
        let parent = parent.map(Path::to_path_buf);

        if let Some(parent_key) = &parent {
            if let Some(parent_module) = self.modules.get_mut(parent_key) {
                if !parent_module.children.contains(&key) {
                    parent_module.children.push(key.clone());
                }
            }
        }

        match self.modules.get_mut(&key) {
            Some(existing) => {
                existing.exports = Some(exports);
                if parent.is_some() {
                    existing.parent = parent;
                }
            }
            None => {
                tracing::trace!(module = %key.display(), "module cached");
                self.modules.insert(
                    key.clone(),
                    CachedModule {
                        key,
                        parent,
                        children: Vec::new(),
                        exports: Some(exports),
                    },
                );
            }
        }
    }

    /// Return the cached exports of `key`, or run `load` and cache its result.
    ///
    /// Cleared entries count as absent.  `load` errors are returned untouched
    /// and leave the cache unchanged.
    pub fn require<E, F>(&mut self, key: &Path, parent: Option<&Path>, load: F) -> Result<T, E>
    where
        F: FnOnce(&Path) -> Result<T, E>,
    {
        if let Some(exports) = self.exports(key) {
            return Ok(exports);
        }

        let exports = load(key)?;
        self.insert(key, parent, exports.clone());
        Ok(exports)
    }

    /// Sweep every module that belongs to the unit rooted at `root`.
    pub fn invalidate_unit(&mut self, root: &Path) -> Invalidation {
        let mut report = Invalidation::default();

        let mut anchored: HashSet<PathBuf> = HashSet::new();
        for key in self.modules.keys() {
            if !key.starts_with(root) {
                continue;
            }
            if is_native_module(key) {
                report.skipped_native += 1;
                continue;
            }
            anchored.insert(key.clone());
        }

        // Walk the child links out of the anchored set.
        let mut descendants: HashSet<PathBuf> = HashSet::new();
        let mut queue: VecDeque<PathBuf> = anchored.iter().cloned().collect();
        while let Some(key) = queue.pop_front() {
            let Some(module) = self.modules.get(&key) else {
                continue;
            };
            for child in &module.children {
                if anchored.contains(child) || is_native_module(child) {
                    continue;
                }
                if descendants.insert(child.clone()) {
                    queue.push_back(child.clone());
                }
            }
        }

        for key in &descendants {
            self.detach_from_parent(key);
            if let Some(module) = self.modules.get_mut(key) {
                module.exports = None;
                module.parent = None;
            }
        }

        for key in &anchored {
            self.detach_from_parent(key);
            self.modules.remove(key);
        }

        report.evicted = anchored.into_iter().collect();
        report.evicted.sort();
        report.cleared = descendants.into_iter().collect();
        report.cleared.sort();

        tracing::debug!(
            root = %root.display(),
            evicted = report.evicted.len(),
            cleared = report.cleared.len(),
            skipped_native = report.skipped_native,
            "module cache swept"
        );

        report
    }

    fn detach_from_parent(&mut self, key: &Path) {
        let Some(parent) = self.modules.get(key).and_then(|m| m.parent.clone()) else {
            return;
        };
        if let Some(parent_module) = self.modules.get_mut(&parent) {
            parent_module.children.retain(|child| child != key);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
