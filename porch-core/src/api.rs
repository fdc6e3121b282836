use axum::{
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::auth::AuthConfig;
use crate::config_entries::ConfigEntries;
use crate::config_flow::FlowManager;
use crate::input_button::InputButtons;
use crate::integrations::hue_config_flow::HueConfigFlow;
use crate::services::{self, ServiceCall, ServiceError};
use crate::state::{Context, EntityState, StateMachine};

/// Shared application state
pub struct AppState {
    pub state_machine: StateMachine,
    pub location_name: String,
    /// YAML file re-read by reload services.
    pub config_path: PathBuf,
    pub started_at: std::time::Instant,
}

impl AppState {
    pub fn new(state_machine: StateMachine, location_name: String, config_path: PathBuf) -> Self {
        Self {
            state_machine,
            location_name,
            config_path,
            started_at: std::time::Instant::now(),
        }
    }

    #[cfg(test)]
    pub fn for_tests(state_machine: StateMachine) -> Self {
        Self::new(state_machine, "Test Home".to_string(), PathBuf::from("porch.yaml"))
    }
}

/// Router state shared by the REST and WebSocket handlers.
#[derive(Clone)]
pub struct ApiState {
    pub app: Arc<AppState>,
    pub auth: Arc<AuthConfig>,
    pub config_entries: Arc<ConfigEntries>,
    pub buttons: Arc<InputButtons>,
    pub hue_flows: Arc<FlowManager<HueConfigFlow>>,
}

/// GET /api/ response
#[derive(Serialize)]
struct ApiStatus {
    message: String,
}

/// GET /api/config response
#[derive(Serialize)]
struct ApiConfig {
    location_name: String,
    version: String,
    state: String,
}

/// POST /api/services/{domain}/{service} response
#[derive(Debug, Serialize)]
struct ServiceResponse {
    changed_states: Vec<EntityState>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/", get(api_status))
        .route("/api/config", get(api_config))
        .route("/api/states", get(get_states))
        .route("/api/states/:entity_id", get(get_state))
        .route("/api/services/:domain/:service", post(call_service))
        .route("/api/health", get(health))
        .with_state(state)
}

/// GET /api/: API running check
async fn api_status() -> Json<ApiStatus> {
    Json(ApiStatus {
        message: "API running.".to_string(),
    })
}

/// GET /api/config: system configuration
async fn api_config(State(state): State<ApiState>) -> Json<ApiConfig> {
    Json(ApiConfig {
        location_name: state.app.location_name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        state: "RUNNING".to_string(),
    })
}

/// GET /api/states: return all entity states
async fn get_states(State(state): State<ApiState>) -> Json<Vec<EntityState>> {
    Json(state.app.state_machine.get_all())
}

/// GET /api/states/{entity_id}: return single entity state
async fn get_state(
    State(state): State<ApiState>,
    Path(entity_id): Path<String>,
) -> Result<Json<EntityState>, StatusCode> {
    state
        .app
        .state_machine
        .get(&entity_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// POST /api/services/{domain}/{service}: call a service
async fn call_service(
    State(state): State<ApiState>,
    Path((domain, service)): Path<(String, String)>,
    headers: HeaderMap,
    body: Option<Json<serde_json::Value>>,
) -> Result<Json<ServiceResponse>, (StatusCode, Json<serde_json::Value>)> {
    let auth_header = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    if !state.auth.validate_header(auth_header) {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"message": "Invalid access token"})),
        ));
    }

    let data = body.map(|Json(v)| v).unwrap_or_else(|| serde_json::json!({}));
    let context = match state.auth.user_id() {
        Some(user) => Context::with_user(user),
        None => Context::new(),
    };
    let call = ServiceCall {
        domain,
        service,
        data,
        context,
    };

    match services::call_service(&state, call) {
        Ok(changed) => Ok(Json(ServiceResponse {
            changed_states: changed,
        })),
        Err(e) => {
            let status = match &e {
                ServiceError::NotFound(..) => StatusCode::BAD_REQUEST,
                ServiceError::Button(_) => StatusCode::BAD_REQUEST,
                ServiceError::Reload(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            Err((status, Json(serde_json::json!({"message": e.to_string()}))))
        }
    }
}

/// GET /api/health: health check
async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "entity_count": state.app.state_machine.len(),
        "config_entries": state.config_entries.all().len(),
        "uptime_seconds": state.app.started_at.elapsed().as_secs(),
    }))
}

/// Router state over a temporary config file, for handler tests.
#[cfg(test)]
pub fn test_state(dir: &std::path::Path, yaml: &str) -> ApiState {
    use crate::integrations::hue::HttpBridgeApi;

    let config_path = dir.join("porch.yaml");
    std::fs::write(&config_path, yaml).unwrap();
    let config = crate::config::load_config(&config_path).unwrap();

    let app = Arc::new(AppState::new(StateMachine::new(64), config.location_name.clone(), config_path));
    let config_entries = Arc::new(ConfigEntries::load(dir).unwrap());
    let buttons = Arc::new(
        InputButtons::setup(
            app.clone(),
            config.input_buttons().unwrap(),
            Some(crate::input_button::storage_path(dir)),
            Default::default(),
        )
        .unwrap(),
    );
    let bridge_api: Arc<dyn crate::integrations::hue::BridgeApi> = Arc::new(HttpBridgeApi::new());
    let location = config.location_name.clone();
    let hue_flows = Arc::new(FlowManager::new(config_entries.clone(), move || {
        HueConfigFlow::new(bridge_api.clone(), &location)
    }));

    ApiState {
        app,
        auth: Arc::new(AuthConfig::disabled()),
        config_entries,
        buttons,
        hue_flows,
    }
}
