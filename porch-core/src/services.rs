//! Service calls
//!
//! REST and WebSocket callers both land here. Services are keyed by
//! (domain, service); the target entity ids come from `entity_id` or
//! `target.entity_id` in the call data, as a string or a list.

use serde_json::Value;

use crate::api::ApiState;
use crate::config;
use crate::input_button::{self, ButtonError};
use crate::state::{Context, EntityState};

/// A service call as received from a client.
#[derive(Debug, Clone)]
pub struct ServiceCall {
    pub domain: String,
    pub service: String,
    pub data: Value,
    pub context: Context,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("service {0}.{1} not found")]
    NotFound(String, String),
    #[error(transparent)]
    Button(#[from] ButtonError),
    #[error("failed to reload configuration: {0}")]
    Reload(anyhow::Error),
}

impl ServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::NotFound(..) => "not_found",
            ServiceError::Button(e) => e.code(),
            ServiceError::Reload(_) => "home_assistant_error",
        }
    }
}

/// Services this instance can handle.
pub fn list_services() -> Vec<(&'static str, &'static str)> {
    vec![
        (input_button::DOMAIN, input_button::SERVICE_PRESS),
        (input_button::DOMAIN, input_button::SERVICE_RELOAD),
    ]
}

/// Extract target entity ids from service data.
pub fn entity_ids(data: &Value) -> Vec<String> {
    let from = |v: Option<&Value>| -> Option<Vec<String>> {
        match v? {
            Value::String(s) => Some(vec![s.clone()]),
            Value::Array(arr) => Some(arr.iter().filter_map(|v| v.as_str().map(String::from)).collect()),
            _ => None,
        }
    };
    from(data.get("entity_id"))
        .or_else(|| from(data.get("target").and_then(|t| t.get("entity_id"))))
        .unwrap_or_default()
}

/// Run a service call. Returns the states it changed.
pub fn call_service(state: &ApiState, call: ServiceCall) -> Result<Vec<EntityState>, ServiceError> {
    tracing::info!(domain = %call.domain, service = %call.service, "Service called");

    match (call.domain.as_str(), call.service.as_str()) {
        (input_button::DOMAIN, input_button::SERVICE_PRESS) => {
            let mut changed = Vec::new();
            for entity_id in entity_ids(&call.data) {
                state.buttons.press(&entity_id, call.context.clone())?;
                if let Some(s) = state.app.state_machine.get(&entity_id) {
                    changed.push(s);
                }
            }
            Ok(changed)
        }
        (input_button::DOMAIN, input_button::SERVICE_RELOAD) => {
            let config = config::load_config(&state.app.config_path).map_err(ServiceError::Reload)?;
            let buttons = config.input_buttons()?;
            state.buttons.reload(buttons);
            Ok(Vec::new())
        }
        _ => {
            tracing::warn!(domain = %call.domain, service = %call.service, "Unknown service");
            Err(ServiceError::NotFound(call.domain, call.service))
        }
    }
}
