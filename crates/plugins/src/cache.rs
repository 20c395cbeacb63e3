// Plugin cache: a JSON key/value file shared by all plugins.
//
// Keys are namespaced as `{plugin}:{key}`, every entry carries a unix
// expiry timestamp, and expired entries are dropped when the file is loaded.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::PluginError;

/// Entries without an explicit lifetime live for a year.
const DEFAULT_EXPIRY: Duration = Duration::from_secs(60 * 60 * 24 * 365);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CacheEntry {
    value: Value,
    expires_at: i64,
}

impl CacheEntry {
    fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone)]
pub struct PluginCache {
    path: Option<PathBuf>,
    prefix: Option<String>,
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl PluginCache {
    /// A cache that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            prefix: None,
            entries: Arc::default(),
        }
    }

    /// Loads `path` if it exists. A corrupt file is logged and replaced.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let now = Utc::now().timestamp();

        let mut entries: HashMap<String, CacheEntry> = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable plugin cache");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        debug!(
            path = %path.display(),
            entries = entries.len(),
            pruned = before - entries.len(),
            "Loaded plugin cache"
        );

        Self {
            path: Some(path),
            prefix: None,
            entries: Arc::new(Mutex::new(entries)),
        }
    }

    /// A view of the same store whose keys are namespaced by `plugin`.
    pub fn for_plugin(&self, plugin: &str) -> Self {
        Self {
            path: self.path.clone(),
            prefix: Some(plugin.to_string()),
            entries: self.entries.clone(),
        }
    }

    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}:{key}"),
            None => key.to_string(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Utc::now().timestamp();
        let entries = self.entries.lock();
        entries
            .get(&self.full_key(key))
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone())
    }

    /// All live entries of this namespace, keys without the prefix.
    pub fn get_all(&self) -> HashMap<String, Value> {
        let now = Utc::now().timestamp();
        let prefix = self.prefix.as_ref().map(|p| format!("{p}:"));
        self.entries
            .lock()
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .filter_map(|(key, entry)| {
                let short = match &prefix {
                    Some(prefix) => key.strip_prefix(prefix.as_str())?,
                    None => key.as_str(),
                };
                Some((short.to_string(), entry.value.clone()))
            })
            .collect()
    }

    pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), PluginError> {
        let ttl = ttl.unwrap_or(DEFAULT_EXPIRY);
        let expires_at = Utc::now().timestamp() + ttl.as_secs() as i64;
        self.entries
            .lock()
            .insert(self.full_key(key), CacheEntry { value, expires_at });
        self.save()
    }

    pub fn remove(&self, key: &str) -> Result<(), PluginError> {
        let removed = self.entries.lock().remove(&self.full_key(key)).is_some();
        if removed {
            self.save()?;
        }
        Ok(())
    }

    fn save(&self) -> Result<(), PluginError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&*self.entries.lock())?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
