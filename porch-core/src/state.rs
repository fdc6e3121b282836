use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

pub const STATE_UNKNOWN: &str = "unknown";

/// HA-compatible state object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    pub last_changed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub context: Context,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id: None,
            user_id: None,
        }
    }

    /// Context for an action performed on behalf of a user.
    pub fn with_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::new()
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Event fired when state changes. `new_state` is `None` when the entity
/// was removed.
#[derive(Debug, Clone, Serialize)]
pub struct StateChangedEvent {
    pub entity_id: String,
    pub old_state: Option<EntityState>,
    pub new_state: Option<EntityState>,
}

/// The entity state machine shared by every integration.
pub struct StateMachine {
    states: Arc<DashMap<String, EntityState>>,
    event_tx: broadcast::Sender<StateChangedEvent>,
}

impl StateMachine {
    pub fn new(channel_capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(channel_capacity);
        Self {
            states: Arc::new(DashMap::new()),
            event_tx,
        }
    }

    /// Get all entity states
    pub fn get_all(&self) -> Vec<EntityState> {
        self.states
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Get a single entity state
    pub fn get(&self, entity_id: &str) -> Option<EntityState> {
        self.states.get(entity_id).map(|entry| entry.value().clone())
    }

    /// Set entity state with a fresh context.
    pub fn set(
        &self,
        entity_id: String,
        state: String,
        attributes: serde_json::Map<String, serde_json::Value>,
    ) -> EntityState {
        self.set_with_context(entity_id, state, attributes, Context::new())
    }

    /// Set entity state and fire `state_changed`.
    pub fn set_with_context(
        &self,
        entity_id: String,
        state: String,
        attributes: serde_json::Map<String, serde_json::Value>,
        context: Context,
    ) -> EntityState {
        let now = Utc::now();
        let old_state = self.states.get(&entity_id).map(|e| e.value().clone());

        let (last_changed, last_updated) = match &old_state {
            Some(prev) => {
                let changed = if prev.state != state {
                    now
                } else {
                    prev.last_changed
                };
                let updated = if prev.state != state || prev.attributes != attributes {
                    now
                } else {
                    prev.last_updated
                };
                (changed, updated)
            }
            None => (now, now),
        };

        let new_state = EntityState {
            entity_id: entity_id.clone(),
            state,
            attributes,
            last_changed,
            last_updated,
            context,
        };

        self.states.insert(entity_id.clone(), new_state.clone());

        // No subscribers is fine
        let _ = self.event_tx.send(StateChangedEvent {
            entity_id,
            old_state,
            new_state: Some(new_state.clone()),
        });

        new_state
    }

    /// Remove an entity from the state machine. Returns true if it existed.
    pub fn remove(&self, entity_id: &str) -> bool {
        match self.states.remove(entity_id) {
            Some((_, old)) => {
                let _ = self.event_tx.send(StateChangedEvent {
                    entity_id: entity_id.to_string(),
                    old_state: Some(old),
                    new_state: None,
                });
                true
            }
            None => false,
        }
    }

    /// Subscribe to state change events
    pub fn subscribe(&self) -> broadcast::Receiver<StateChangedEvent> {
        self.event_tx.subscribe()
    }

    /// Entity ids currently tracked, sorted.
    pub fn entity_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.states.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Number of entities currently tracked
    pub fn len(&self) -> usize {
        self.states.len()
    }
}
