// Plugin registry: every known plugin with its matchers, loaded or not.
//
// Built-ins are registered lazily from `plugins.json` when its hash checks
// out, so matching a URL never constructs a plugin it does not need. A lazy
// entry is loaded when it wins a match; if loading fails the entry is marked
// failed and the next best match is tried.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::arguments::{PluginArgument, PluginArguments};
use crate::error::PluginError;
use crate::matcher::{MatchedUrl, Matcher, MatcherDefinition, match_url};
use crate::platforms::{self, declarative};
use crate::plugin::PluginSpec;

/// Matchers and arguments of a plugin, without its code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub matchers: Vec<MatcherDefinition>,
    #[serde(default)]
    pub arguments: Vec<PluginArgument>,
}

pub type PluginLoader = Arc<dyn Fn(&str) -> Result<PluginSpec, PluginError> + Send + Sync>;

/// The built-in plugin bundle: metadata text, its expected hash and the code.
#[derive(Clone, Copy)]
pub struct BuiltinPlugins {
    pub metadata: &'static str,
    pub sha256: &'static str,
    pub names: &'static [&'static str],
    pub loader: fn(&str) -> Result<PluginSpec, PluginError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginSource {
    Builtin,
    Sideloaded { path: PathBuf, sha256: String },
    /// Registered directly through [`PluginRegistry::register`].
    Runtime,
}

/// Plugin names kept for compatibility with older command lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deprecation {
    Renamed { old: &'static str, new: &'static str },
    Removed { name: &'static str, reason: &'static str },
}

pub const DEPRECATED_PLUGINS: &[Deprecation] = &[
    Deprecation::Renamed {
        old: "hlsvariant",
        new: "hls",
    },
    Deprecation::Renamed {
        old: "niconico",
        new: "nicolive",
    },
    Deprecation::Removed {
        name: "akamaihd",
        reason: "HDS streams are no longer supported",
    },
];

fn deprecation(name: &str) -> Option<Deprecation> {
    DEPRECATED_PLUGINS.iter().copied().find(|d| match d {
        Deprecation::Renamed { old, .. } => *old == name,
        Deprecation::Removed { name: removed, .. } => *removed == name,
    })
}

/// Rewrites `--{old}-{arg}` option keys of renamed plugins to the current name.
pub fn normalize_option_key(key: &str) -> String {
    for deprecation in DEPRECATED_PLUGINS {
        if let Deprecation::Renamed { old, new } = deprecation
            && let Some(rest) = key.strip_prefix(old)
            && rest.starts_with('-')
        {
            warn!("Option --{key} is deprecated, use --{new}{rest}");
            return format!("{new}{rest}");
        }
    }
    key.to_string()
}

enum EntryState {
    Loaded(Arc<PluginSpec>),
    Lazy(PluginLoader),
    Failed,
}

struct Entry {
    name: String,
    matchers: Vec<Matcher>,
    arguments: PluginArguments,
    source: PluginSource,
    state: EntryState,
}

impl Entry {
    fn loaded(spec: PluginSpec, source: PluginSource) -> Self {
        Self {
            name: spec.name.clone(),
            matchers: spec.matchers.clone(),
            arguments: spec.arguments.clone(),
            source,
            state: EntryState::Loaded(Arc::new(spec)),
        }
    }
}

#[derive(Default)]
pub struct PluginRegistry {
    entries: RwLock<Vec<Entry>>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in plugins.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.load_builtins(&platforms::builtins());
        registry
    }

    fn insert(&self, entry: Entry) {
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|e| e.name == entry.name) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
    }

    /// Adds a plugin, replacing one of the same name in place.
    pub fn register(&self, spec: PluginSpec) {
        self.insert(Entry::loaded(spec, PluginSource::Runtime));
    }

    /// Adds a plugin known only by its manifest; `loader` runs on first use.
    pub fn register_lazy(
        &self,
        manifest: PluginManifest,
        source: PluginSource,
        loader: PluginLoader,
    ) -> Result<(), PluginError> {
        let matchers = manifest
            .matchers
            .iter()
            .map(|m| {
                m.compile()
                    .map_err(|e| PluginError::load(&manifest.name, e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.insert(Entry {
            name: manifest.name,
            matchers,
            arguments: PluginArguments::new(manifest.arguments),
            source,
            state: EntryState::Lazy(loader),
        });
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.name != name);
        entries.len() != before
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().iter().map(|e| e.name.clone()).collect();
        names.sort();
        names
    }

    pub fn source(&self, name: &str) -> Option<PluginSource> {
        self.entries
            .read()
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.source.clone())
    }

    /// Declared arguments of every plugin, loaded or not.
    pub fn arguments(&self) -> Vec<(String, PluginArguments)> {
        self.entries
            .read()
            .iter()
            .map(|e| (e.name.clone(), e.arguments.clone()))
            .collect()
    }

    /// Looks up a plugin by name, following renamed aliases and loading it if
    /// needed.
    pub fn get(&self, name: &str) -> Option<Arc<PluginSpec>> {
        let name = match deprecation(name) {
            Some(Deprecation::Renamed { old, new }) => {
                warn!("Plugin {old} has been renamed to {new}");
                new
            }
            Some(Deprecation::Removed { name, reason }) => {
                warn!("Plugin {name} has been removed: {reason}");
                return None;
            }
            None => name,
        };
        match self.ensure_loaded(name) {
            Ok(spec) => spec,
            Err(e) => {
                warn!(plugin = name, error = %e, "Failed to load plugin");
                None
            }
        }
    }

    fn ensure_loaded(&self, name: &str) -> Result<Option<Arc<PluginSpec>>, PluginError> {
        let loader = {
            let entries = self.entries.read();
            let Some(entry) = entries.iter().find(|e| e.name == name) else {
                return Ok(None);
            };
            match &entry.state {
                EntryState::Loaded(spec) => return Ok(Some(spec.clone())),
                EntryState::Failed => {
                    return Err(PluginError::load(name, "plugin failed to load earlier"));
                }
                EntryState::Lazy(loader) => loader.clone(),
            }
        };

        debug!(plugin = name, "Loading plugin");
        let result = loader(name);

        let mut entries = self.entries.write();
        let Some(entry) = entries.iter_mut().find(|e| e.name == name) else {
            return Ok(None);
        };
        match result {
            Ok(spec) => {
                let spec = Arc::new(spec);
                entry.matchers = spec.matchers.clone();
                entry.arguments = spec.arguments.clone();
                entry.state = EntryState::Loaded(spec.clone());
                Ok(Some(spec))
            }
            Err(e) => {
                entry.state = EntryState::Failed;
                Err(e)
            }
        }
    }

    /// Finds the plugin for `url`. The highest-priority match wins and ties
    /// go to the plugin registered first. A winner that fails to load is
    /// skipped in favour of the next candidate.
    pub fn match_url(&self, url: &str) -> Option<(MatchedUrl, Arc<PluginSpec>)> {
        let mut candidates: Vec<(String, MatchedUrl)> = self
            .entries
            .read()
            .iter()
            .filter(|e| !matches!(e.state, EntryState::Failed))
            .filter_map(|e| match_url(&e.matchers, url).map(|m| (e.name.clone(), m)))
            .collect();
        candidates.sort_by(|(_, a), (_, b)| b.priority.cmp(&a.priority));

        for (name, matched) in candidates {
            match self.ensure_loaded(&name) {
                Ok(Some(spec)) => return Some((matched, spec)),
                Ok(None) => continue,
                Err(e) => {
                    warn!(plugin = %name, error = %e, "Failed to load plugin, trying the next match");
                }
            }
        }
        None
    }

    /// Registers the built-ins, lazily when the metadata hash matches and
    /// eagerly otherwise.
    pub fn load_builtins(&self, builtins: &BuiltinPlugins) {
        let digest = hex::encode(Sha256::digest(builtins.metadata.as_bytes()));
        let manifests = if digest == builtins.sha256 {
            serde_json::from_str::<Vec<PluginManifest>>(builtins.metadata)
                .inspect_err(|e| warn!(error = %e, "Unreadable plugin metadata"))
                .ok()
        } else {
            warn!(
                expected = builtins.sha256,
                actual = %digest,
                "Plugin metadata hash mismatch, loading all plugins"
            );
            None
        };

        match manifests {
            Some(manifests) => {
                let load = builtins.loader;
                let loader: PluginLoader = Arc::new(move |name: &str| load(name));
                for manifest in manifests {
                    let name = manifest.name.clone();
                    if let Err(e) = self.register_lazy(manifest, PluginSource::Builtin, loader.clone()) {
                        warn!(plugin = %name, error = %e, "Skipping plugin");
                    }
                }
                debug!(count = self.entries.read().len(), "Registered plugins from metadata");
            }
            None => {
                for name in builtins.names {
                    match (builtins.loader)(name) {
                        Ok(spec) => self.insert(Entry::loaded(spec, PluginSource::Builtin)),
                        Err(e) => warn!(plugin = name, error = %e, "Skipping plugin"),
                    }
                }
            }
        }
    }

    /// Loads every `*.json` declarative plugin in `dir`. Returns how many
    /// were registered; unreadable files are logged and skipped.
    pub fn sideload(&self, dir: &Path) -> usize {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "No sideload directory");
                return 0;
            }
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            match self.sideload_file(&path) {
                Ok(()) => loaded += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to sideload plugin"),
            }
        }
        loaded
    }

    fn sideload_file(&self, path: &Path) -> Result<(), PluginError> {
        let bytes = fs::read(path)?;
        let sha256 = hex::encode(Sha256::digest(&bytes));
        let text = String::from_utf8(bytes)
            .map_err(|e| PluginError::other(format!("{} is not UTF-8: {e}", path.display())))?;
        let spec = declarative::spec(declarative::DeclarativeDefinition::from_json(&text)?)?;

        let name = spec.name.clone();
        if self.entries.read().iter().any(|e| e.name == name) {
            info!(
                "Plugin {name} is being overridden by {} (sha256:{sha256})",
                path.display()
            );
        } else {
            debug!(plugin = %name, path = %path.display(), "Sideloaded plugin");
        }
        self.insert(Entry::loaded(
            spec,
            PluginSource::Sideloaded {
                path: path.to_path_buf(),
                sha256,
            },
        ));
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    pub sideload_dirs: Vec<PathBuf>,
}

static GLOBAL: LazyLock<RwLock<Option<Arc<PluginRegistry>>>> = LazyLock::new(|| RwLock::new(None));

/// Builds the process-wide registry: built-ins first, then sideloaded plugins.
pub fn init(config: &RegistryConfig) -> Arc<PluginRegistry> {
    let registry = PluginRegistry::with_builtins();
    for dir in &config.sideload_dirs {
        registry.sideload(dir);
    }
    let registry = Arc::new(registry);
    *GLOBAL.write() = Some(registry.clone());
    registry
}

pub fn global() -> Option<Arc<PluginRegistry>> {
    GLOBAL.read().clone()
}

pub fn teardown() {
    GLOBAL.write().take();
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::PluginError;
    use crate::matcher::{LOW_PRIORITY, NORMAL_PRIORITY};
    use crate::plugin::Plugin;
    use crate::stream::StreamSet;

    struct Empty(String);

    #[async_trait]
    impl Plugin for Empty {
        fn name(&self) -> &str {
            &self.0
        }

        async fn streams(&self) -> Result<StreamSet, PluginError> {
            Ok(StreamSet::new())
        }
    }

    fn spec(name: &str, pattern: &str, priority: i32) -> PluginSpec {
        let owned = name.to_string();
        PluginSpec::new(
            name,
            vec![Matcher::new(pattern).unwrap().with_priority(priority)],
            move |_| Ok(Box::new(Empty(owned.clone())) as Box<dyn Plugin>),
        )
    }

    fn manifest(name: &str, pattern: &str, priority: i32) -> PluginManifest {
        PluginManifest {
            name: name.to_string(),
            matchers: vec![MatcherDefinition {
                pattern: pattern.to_string(),
                priority,
                name: None,
            }],
            arguments: Vec::new(),
        }
    }

    #[test]
    fn falls_back_when_the_winner_fails_to_load() {
        let registry = PluginRegistry::new();
        registry
            .register_lazy(
                manifest("generic", "^https://site\\.example/", LOW_PRIORITY),
                PluginSource::Builtin,
                Arc::new(|_: &str| Ok(spec("generic", "^https://site\\.example/", LOW_PRIORITY))),
            )
            .unwrap();
        registry
            .register_lazy(
                manifest("specific", "^https://site\\.example/live/", NORMAL_PRIORITY),
                PluginSource::Builtin,
                Arc::new(|name: &str| Err(PluginError::load(name, "broken"))),
            )
            .unwrap();

        let (matched, plugin) = registry.match_url("https://site.example/live/1").unwrap();
        assert_eq!(plugin.name, "generic");
        assert_eq!(matched.priority, LOW_PRIORITY);
        assert!(registry.get("specific").is_none());
    }

    #[test]
    fn ties_go_to_the_first_registered() {
        let registry = PluginRegistry::new();
        registry.register(spec("first", "^https://", NORMAL_PRIORITY));
        registry.register(spec("second", "^https://", NORMAL_PRIORITY));
        registry.register(spec("low", "^https://a", LOW_PRIORITY));

        assert_eq!(registry.match_url("https://a.example").unwrap().1.name, "first");
        assert_eq!(registry.names(), vec!["first", "low", "second"]);

        assert!(registry.unregister("first"));
        assert!(!registry.unregister("first"));
        assert_eq!(registry.match_url("https://a.example").unwrap().1.name, "second");
        assert!(registry.match_url("ftp://a.example").is_none());
    }

    #[test]
    fn lazy_plugins_load_once_on_first_match() {
        static LOADS: AtomicUsize = AtomicUsize::new(0);
        let registry = PluginRegistry::new();
        registry
            .register_lazy(
                manifest("lazy", "^https://lazy\\.example/", NORMAL_PRIORITY),
                PluginSource::Builtin,
                Arc::new(|_: &str| {
                    LOADS.fetch_add(1, Ordering::SeqCst);
                    Ok(spec("lazy", "^https://lazy\\.example/", NORMAL_PRIORITY))
                }),
            )
            .unwrap();

        assert_eq!(LOADS.load(Ordering::SeqCst), 0);
        registry.match_url("https://lazy.example/a").unwrap();
        registry.match_url("https://lazy.example/b").unwrap();
        assert_eq!(LOADS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn builtin_metadata_is_used_only_when_the_hash_matches() {
        static LOADS: AtomicUsize = AtomicUsize::new(0);
        fn counting(name: &str) -> Result<PluginSpec, PluginError> {
            LOADS.fetch_add(1, Ordering::SeqCst);
            platforms::load_builtin(name)
        }

        let mut builtins = platforms::builtins();
        builtins.loader = counting;

        let lazy = PluginRegistry::new();
        lazy.load_builtins(&builtins);
        assert_eq!(lazy.names(), vec!["hls", "nicolive"]);
        assert_eq!(LOADS.load(Ordering::SeqCst), 0);
        let (_, plugin) = lazy.match_url("https://cdn.example/index.m3u8").unwrap();
        assert_eq!(plugin.name, "hls");
        assert_eq!(LOADS.load(Ordering::SeqCst), 1);

        builtins.sha256 = "0000";
        let eager = PluginRegistry::new();
        eager.load_builtins(&builtins);
        assert_eq!(eager.names(), vec!["hls", "nicolive"]);
        assert_eq!(LOADS.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn renamed_plugins_resolve_to_their_new_name() {
        let registry = PluginRegistry::with_builtins();
        assert_eq!(registry.get("hlsvariant").unwrap().name, "hls");
        assert!(registry.get("akamaihd").is_none());
        assert_eq!(normalize_option_key("niconico-user-session"), "nicolive-user-session");
        assert_eq!(normalize_option_key("nicolive-user-session"), "nicolive-user-session");
        assert_eq!(normalize_option_key("hlsx"), "hlsx");
    }

    #[test]
    fn sideloaded_plugins_override_builtins() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("hls.json"),
            r#"{
                "name": "hls",
                "matchers": [{"pattern": "^hls://(?P<url>.+)$", "priority": 30}],
                "url_template": "https://{url}"
            }"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("extra.json"),
            r#"{
                "name": "extra",
                "matchers": [{"pattern": "^https://extra\\.example/(?P<id>\\d+)$"}],
                "url_template": "https://cdn.extra.example/{id}.m3u8"
            }"#,
        )
        .unwrap();
        fs::write(dir.path().join("broken.json"), "{").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let registry = PluginRegistry::with_builtins();
        assert_eq!(registry.sideload(dir.path()), 2);
        assert_eq!(registry.names(), vec!["extra", "hls", "nicolive"]);

        let Some(PluginSource::Sideloaded { path, sha256 }) = registry.source("hls") else {
            panic!("hls should be sideloaded");
        };
        assert_eq!(path, dir.path().join("hls.json"));
        assert_eq!(sha256.len(), 64);

        let (matched, plugin) = registry.match_url("hls://example.com/live.m3u8").unwrap();
        assert_eq!(plugin.name, "hls");
        assert_eq!(matched.priority, 30);
        assert_eq!(registry.sideload(&dir.path().join("missing")), 0);
    }

    #[test]
    fn global_registry_lifecycle() {
        let registry = init(&RegistryConfig::default());
        assert!(Arc::ptr_eq(&registry, &global().unwrap()));
        teardown();
        assert!(global().is_none());
    }
}
