//! Config entries: one configured instance of an integration
//!
//! Entries keep insertion order and are written to
//! `<storage_dir>/core.config_entries.json` on every change.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::util;

const STORAGE_KEY: &str = "core.config_entries";
const STORAGE_VERSION: u32 = 1;

/// How an entry came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntrySource {
    User,
    Import,
    Ssdp,
    Zeroconf,
    Homekit,
    /// The user dismissed a discovery.
    Ignore,
}

impl ConfigEntrySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigEntrySource::User => "user",
            ConfigEntrySource::Import => "import",
            ConfigEntrySource::Ssdp => "ssdp",
            ConfigEntrySource::Zeroconf => "zeroconf",
            ConfigEntrySource::Homekit => "homekit",
            ConfigEntrySource::Ignore => "ignore",
        }
    }
}

impl std::str::FromStr for ConfigEntrySource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| format!("unknown config entry source: {}", s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub entry_id: String,
    pub domain: String,
    pub title: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub options: Map<String, Value>,
    pub source: ConfigEntrySource,
    #[serde(default)]
    pub unique_id: Option<String>,
}

impl ConfigEntry {
    pub fn new(
        domain: &str,
        title: impl Into<String>,
        data: Map<String, Value>,
        source: ConfigEntrySource,
        unique_id: Option<String>,
    ) -> Self {
        Self {
            entry_id: uuid::Uuid::new_v4().simple().to_string(),
            domain: domain.to_string(),
            title: title.into(),
            data,
            options: Map::new(),
            source,
            unique_id,
        }
    }

    pub fn host(&self) -> Option<&str> {
        self.data.get("host").and_then(Value::as_str)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredEntries {
    entries: Vec<ConfigEntry>,
}

/// The config entry store.
pub struct ConfigEntries {
    entries: RwLock<Vec<ConfigEntry>>,
    path: Option<PathBuf>,
}

impl ConfigEntries {
    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            path: None,
        }
    }

    /// Load entries from the storage directory (empty when no file exists yet).
    pub fn load(storage_dir: &Path) -> anyhow::Result<Self> {
        let path = util::store_path(storage_dir, STORAGE_KEY);
        let entries = util::load_store::<StoredEntries>(&path)?
            .map(|file| file.data.entries)
            .unwrap_or_default();
        tracing::info!("Loaded {} config entries", entries.len());
        Ok(Self {
            entries: RwLock::new(entries),
            path: Some(path),
        })
    }

    /// Entries for a domain, in insertion order.
    pub fn entries(&self, domain: &str) -> Vec<ConfigEntry> {
        self.read()
            .iter()
            .filter(|e| e.domain == domain)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<ConfigEntry> {
        self.read().clone()
    }

    pub fn get(&self, entry_id: &str) -> Option<ConfigEntry> {
        self.read().iter().find(|e| e.entry_id == entry_id).cloned()
    }

    pub fn add(&self, entry: ConfigEntry) {
        tracing::info!(
            domain = %entry.domain,
            entry_id = %entry.entry_id,
            "Config entry added: {}",
            entry.title
        );
        self.write().push(entry);
        self.persist();
    }

    /// Merge `updates` into an entry's data. Returns true if anything changed.
    pub fn update_data(&self, entry_id: &str, updates: &Map<String, Value>) -> bool {
        let changed = {
            let mut entries = self.write();
            let Some(entry) = entries.iter_mut().find(|e| e.entry_id == entry_id) else {
                return false;
            };
            let mut changed = false;
            for (k, v) in updates {
                if entry.data.get(k) != Some(v) {
                    entry.data.insert(k.clone(), v.clone());
                    changed = true;
                }
            }
            changed
        };
        if changed {
            self.persist();
        }
        changed
    }

    /// Replace an entry's options. Returns false for an unknown entry.
    pub fn update_options(&self, entry_id: &str, options: Map<String, Value>) -> bool {
        {
            let mut entries = self.write();
            let Some(entry) = entries.iter_mut().find(|e| e.entry_id == entry_id) else {
                return false;
            };
            entry.options = options;
        }
        self.persist();
        true
    }

    pub fn remove(&self, entry_id: &str) -> Option<ConfigEntry> {
        let removed = {
            let mut entries = self.write();
            let idx = entries.iter().position(|e| e.entry_id == entry_id)?;
            entries.remove(idx)
        };
        tracing::info!(domain = %removed.domain, entry_id = %entry_id, "Config entry removed");
        self.persist();
        Some(removed)
    }

    /// Unique ids of a domain's entries, optionally skipping ignored ones.
    pub fn current_ids(&self, domain: &str, include_ignore: bool) -> HashSet<String> {
        self.read()
            .iter()
            .filter(|e| e.domain == domain)
            .filter(|e| include_ignore || e.source != ConfigEntrySource::Ignore)
            .filter_map(|e| e.unique_id.clone())
            .collect()
    }

    fn persist(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let data = StoredEntries {
            entries: self.all(),
        };
        if let Err(e) = util::save_store(path, STORAGE_KEY, STORAGE_VERSION, &data) {
            tracing::warn!("Failed to save config entries to {}: {}", path.display(), e);
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<ConfigEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<ConfigEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_data(host: &str) -> Map<String, Value> {
        let mut data = Map::new();
        data.insert("host".into(), Value::String(host.into()));
        data
    }

    #[test]
    fn test_current_ids_skips_ignored() {
        let store = ConfigEntries::in_memory();
        store.add(ConfigEntry::new("hue", "", Map::new(), ConfigEntrySource::Ignore, Some("bla".into())));
        store.add(ConfigEntry::new("hue", "Bridge", host_data("1.2.3.4"), ConfigEntrySource::User, Some("abc".into())));
        store.add(ConfigEntry::new("other", "x", Map::new(), ConfigEntrySource::User, Some("zzz".into())));

        let ids = store.current_ids("hue", false);
        assert_eq!(ids.len(), 1);
        assert!(ids.contains("abc"));
        assert_eq!(store.current_ids("hue", true).len(), 2);
    }

    #[test]
    fn test_update_data_reports_changes() {
        let store = ConfigEntries::in_memory();
        let entry = ConfigEntry::new("hue", "Bridge", host_data("0.0.0.0"), ConfigEntrySource::User, None);
        let id = entry.entry_id.clone();
        store.add(entry);

        assert!(!store.update_data(&id, &host_data("0.0.0.0")));
        assert!(store.update_data(&id, &host_data("1.1.1.1")));
        assert_eq!(store.get(&id).unwrap().host(), Some("1.1.1.1"));
        assert!(!store.update_data("missing", &host_data("1.1.1.1")));
    }

    #[test]
    fn test_entries_persist_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigEntries::load(dir.path()).unwrap();
        let entry = ConfigEntry::new("hue", "Hue Bridge abc", host_data("2.2.2.2"), ConfigEntrySource::Import, Some("abc".into()));
        let id = entry.entry_id.clone();
        store.add(entry);
        let mut options = Map::new();
        options.insert("allow_hue_groups".into(), Value::Bool(true));
        assert!(store.update_options(&id, options));

        let reloaded = ConfigEntries::load(dir.path()).unwrap();
        let entries = reloaded.entries("hue");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].source, ConfigEntrySource::Import);
        assert_eq!(entries[0].options["allow_hue_groups"], Value::Bool(true));

        assert!(reloaded.remove(&id).is_some());
        assert!(ConfigEntries::load(dir.path()).unwrap().all().is_empty());
    }

    #[test]
    fn test_source_from_str() {
        assert_eq!("homekit".parse::<ConfigEntrySource>().unwrap(), ConfigEntrySource::Homekit);
        assert!("bogus".parse::<ConfigEntrySource>().is_err());
    }
}
