//! input_button helper
//!
//! A button has no state of its own beyond the time it was last pressed.
//! Buttons come from two places: the `input_button:` YAML section (read-only,
//! reloadable) and a JSON storage collection edited over the WebSocket API.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::api::AppState;
use crate::recorder::RestoredState;
use crate::state::{Context, STATE_UNKNOWN};
use crate::util::{self, is_slug, slugify};

pub const DOMAIN: &str = "input_button";
pub const SERVICE_PRESS: &str = "press";
pub const SERVICE_RELOAD: &str = "reload";

const STORAGE_KEY: &str = "input_button";
const STORAGE_VERSION: u32 = 1;

/// Configuration of a single button.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl ButtonConfig {
    pub fn entity_id(&self) -> String {
        format!("{}.{}", DOMAIN, self.id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ButtonError {
    #[error("invalid input_button config: {0}")]
    InvalidConfig(String),
    #[error("unable to find input_button_id {0}")]
    NotFound(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl ButtonError {
    /// Error code reported over the WebSocket API.
    pub fn code(&self) -> &'static str {
        match self {
            ButtonError::NotFound(_) => "not_found",
            ButtonError::InvalidConfig(_) | ButtonError::InvalidData(_) => "invalid_format",
            ButtonError::Storage(_) => "unknown_error",
        }
    }
}

/// Parse the `input_button:` YAML section.
///
/// The section must be a map keyed by slug object ids; each value is null
/// or a map with optional `name` and `icon`.
pub fn parse_yaml_config(section: &serde_yaml::Value) -> Result<Vec<ButtonConfig>, ButtonError> {
    let serde_yaml::Value::Mapping(map) = section else {
        return Err(ButtonError::InvalidConfig("expected a dictionary".to_string()));
    };

    let mut buttons = Vec::with_capacity(map.len());
    for (key, value) in map {
        let id = key
            .as_str()
            .filter(|k| is_slug(k))
            .ok_or_else(|| ButtonError::InvalidConfig(format!("invalid slug {:?}", key)))?;

        let (name, icon) = match value {
            serde_yaml::Value::Null => (None, None),
            serde_yaml::Value::Mapping(opts) => {
                let mut name = None;
                let mut icon = None;
                for (opt, v) in opts {
                    let text = v
                        .as_str()
                        .map(String::from)
                        .ok_or_else(|| ButtonError::InvalidConfig(format!("{}: expected a string for {:?}", id, opt)))?;
                    match opt.as_str() {
                        Some("name") => name = Some(text),
                        Some("icon") => icon = Some(text),
                        _ => {
                            return Err(ButtonError::InvalidConfig(format!("{}: extra key {:?}", id, opt)));
                        }
                    }
                }
                (name, icon)
            }
            _ => return Err(ButtonError::InvalidConfig(format!("{}: expected a dictionary", id))),
        };

        buttons.push(ButtonConfig {
            id: id.to_string(),
            name,
            icon,
        });
    }
    Ok(buttons)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredItems {
    items: Vec<ButtonConfig>,
}

#[derive(Debug, Clone)]
struct Button {
    config: ButtonConfig,
    editable: bool,
}

impl Button {
    fn attributes(&self) -> Map<String, Value> {
        let mut attrs = Map::new();
        if let Some(name) = &self.config.name {
            attrs.insert("friendly_name".into(), Value::String(name.clone()));
        }
        if let Some(icon) = &self.config.icon {
            attrs.insert("icon".into(), Value::String(icon.clone()));
        }
        attrs.insert("editable".into(), Value::Bool(self.editable));
        attrs
    }
}

/// Optional fields of an `input_button/update` call.
#[derive(Debug, Default, Deserialize)]
pub struct ButtonUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
}

/// All configured buttons and their entity registry entries.
pub struct InputButtons {
    app: Arc<AppState>,
    buttons: DashMap<String, Button>,
    /// Entity registry: unique id -> entity id.
    registry: DashMap<String, String>,
    storage: Mutex<Vec<ButtonConfig>>,
    storage_path: Option<PathBuf>,
    restored: HashMap<String, RestoredState>,
}

impl InputButtons {
    /// Set up YAML and stored buttons, restoring their last recorded state.
    pub fn setup(
        app: Arc<AppState>,
        yaml: Vec<ButtonConfig>,
        storage_path: Option<PathBuf>,
        restored: HashMap<String, RestoredState>,
    ) -> Result<Self, ButtonError> {
        let stored = match &storage_path {
            Some(path) => util::load_store::<StoredItems>(path)?
                .map(|file| file.data.items)
                .unwrap_or_default(),
            None => Vec::new(),
        };

        let this = Self {
            app,
            buttons: DashMap::new(),
            registry: DashMap::new(),
            storage: Mutex::new(Vec::new()),
            storage_path,
            restored,
        };

        for config in yaml {
            this.add_entity(config, false);
        }
        for config in stored {
            // Shadowed items stay in storage so the next write keeps them
            this.storage_items().push(config.clone());
            if this.buttons.contains_key(&config.id) {
                tracing::warn!(id = %config.id, "Stored input_button duplicates a YAML button, not loading it");
                continue;
            }
            this.add_entity(config, true);
        }

        tracing::info!("input_button: {} buttons set up", this.buttons.len());
        Ok(this)
    }

    /// Entity id registered for a unique id.
    pub fn registry_entity_id(&self, unique_id: &str) -> Option<String> {
        self.registry.get(unique_id).map(|e| e.value().clone())
    }

    pub fn entity_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.buttons.iter().map(|b| b.config.entity_id()).collect();
        ids.sort();
        ids
    }

    /// Record a press: the state becomes the current time, carrying `context`.
    pub fn press(&self, entity_id: &str, context: Context) -> Result<(), ButtonError> {
        let id = entity_id
            .strip_prefix("input_button.")
            .ok_or_else(|| ButtonError::NotFound(entity_id.to_string()))?;
        let button = self
            .buttons
            .get(id)
            .map(|b| b.value().clone())
            .ok_or_else(|| ButtonError::NotFound(entity_id.to_string()))?;

        let now = chrono::Utc::now().to_rfc3339();
        tracing::debug!(entity_id = %entity_id, "input_button pressed");
        self.app
            .state_machine
            .set_with_context(button.config.entity_id(), now, button.attributes(), context);
        Ok(())
    }

    /// Reconcile YAML buttons with a freshly loaded section: drop the ones
    /// that disappeared, update changed ones, add new ones.
    pub fn reload(&self, yaml: Vec<ButtonConfig>) {
        let new: BTreeMap<String, ButtonConfig> = yaml.into_iter().map(|c| (c.id.clone(), c)).collect();

        let current: Vec<String> = self
            .buttons
            .iter()
            .filter(|b| !b.editable)
            .map(|b| b.key().clone())
            .collect();
        for id in current {
            if !new.contains_key(&id) {
                self.remove_entity(&id);
                let shadowed = self.storage_items().iter().find(|i| i.id == id).cloned();
                if let Some(config) = shadowed {
                    self.add_entity(config, true);
                }
            }
        }

        for (id, config) in new {
            let existing = self.buttons.get(&id).map(|b| b.value().clone());
            match existing {
                Some(b) if b.editable => {
                    tracing::warn!(id = %id, "YAML input_button duplicates a stored button, skipping");
                }
                Some(b) if b.config == config => {}
                Some(_) => self.update_entity(config, false),
                None => self.add_entity(config, false),
            }
        }
        tracing::info!("input_button: reloaded, {} buttons", self.buttons.len());
    }

    /// Stored (editable) buttons.
    pub fn list(&self) -> Vec<ButtonConfig> {
        self.storage_items().clone()
    }

    pub fn create(&self, name: &str, icon: Option<String>) -> Result<ButtonConfig, ButtonError> {
        let base = slugify(name);
        if base.is_empty() {
            return Err(ButtonError::InvalidData(format!("cannot derive an id from {:?}", name)));
        }

        // Id choice and the write happen under the storage lock
        let config = {
            let mut items = self.storage_items();
            let taken = |id: &str| self.buttons.contains_key(id) || items.iter().any(|i| i.id == id);
            let mut id = base.clone();
            let mut suffix = 2;
            while taken(&id) {
                id = format!("{}_{}", base, suffix);
                suffix += 1;
            }

            let config = ButtonConfig {
                id,
                name: Some(name.to_string()),
                icon,
            };
            let mut next = items.clone();
            next.push(config.clone());
            self.persist(&next)?;
            *items = next;
            config
        };
        self.add_entity(config.clone(), true);
        Ok(config)
    }

    pub fn update(&self, id: &str, changes: ButtonUpdate) -> Result<ButtonConfig, ButtonError> {
        let updated = {
            let mut items = self.storage_items();
            let mut next = items.clone();
            let item = next
                .iter_mut()
                .find(|i| i.id == id)
                .ok_or_else(|| ButtonError::NotFound(id.to_string()))?;
            if let Some(name) = changes.name {
                item.name = Some(name);
            }
            if let Some(icon) = changes.icon {
                item.icon = Some(icon);
            }
            let updated = item.clone();
            self.persist(&next)?;
            *items = next;
            updated
        };
        if self.is_loaded_from_storage(id) {
            self.update_entity(updated.clone(), true);
        }
        Ok(updated)
    }

    pub fn delete(&self, id: &str) -> Result<(), ButtonError> {
        {
            let mut items = self.storage_items();
            let idx = items
                .iter()
                .position(|i| i.id == id)
                .ok_or_else(|| ButtonError::NotFound(id.to_string()))?;
            let mut next = items.clone();
            next.remove(idx);
            self.persist(&next)?;
            *items = next;
        }
        if self.is_loaded_from_storage(id) {
            self.remove_entity(id);
        }
        Ok(())
    }

    /// False when a YAML button with the same id shadows the stored item.
    fn is_loaded_from_storage(&self, id: &str) -> bool {
        self.buttons.get(id).map_or(false, |b| b.editable)
    }

    fn add_entity(&self, config: ButtonConfig, editable: bool) {
        let entity_id = config.entity_id();
        let state = self
            .restored
            .get(&entity_id)
            .map(|s| s.state.clone())
            .unwrap_or_else(|| STATE_UNKNOWN.to_string());

        let button = Button { config, editable };
        self.registry.insert(button.config.id.clone(), entity_id.clone());
        self.app.state_machine.set(entity_id, state, button.attributes());
        self.buttons.insert(button.config.id.clone(), button);
    }

    fn update_entity(&self, config: ButtonConfig, editable: bool) {
        let entity_id = config.entity_id();
        let state = self
            .app
            .state_machine
            .get(&entity_id)
            .map(|s| s.state)
            .unwrap_or_else(|| STATE_UNKNOWN.to_string());
        let button = Button { config, editable };
        self.app.state_machine.set(entity_id, state, button.attributes());
        self.buttons.insert(button.config.id.clone(), button);
    }

    fn remove_entity(&self, id: &str) {
        if let Some((_, button)) = self.buttons.remove(id) {
            self.app.state_machine.remove(&button.config.entity_id());
        }
        self.registry.remove(id);
    }

    fn persist(&self, items: &[ButtonConfig]) -> anyhow::Result<()> {
        let Some(path) = &self.storage_path else {
            return Ok(());
        };
        let data = StoredItems { items: items.to_vec() };
        util::save_store(path, STORAGE_KEY, STORAGE_VERSION, &data)
    }

    fn storage_items(&self) -> std::sync::MutexGuard<'_, Vec<ButtonConfig>> {
        self.storage.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Path of the button storage collection inside the storage directory.
pub fn storage_path(storage_dir: &std::path::Path) -> PathBuf {
    util::store_path(storage_dir, STORAGE_KEY)
}
