use axum::{
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Router,
};
use axum::extract::ws::{Message, WebSocket};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::api::ApiState;
use crate::config_entries::ConfigEntrySource;
use crate::config_flow::FlowError;
use crate::input_button::ButtonUpdate;
use crate::services::{self, ServiceCall};
use crate::state::{Context, StateChangedEvent};

/// WebSocket message types (HA WebSocket API compatible)
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum WsOutgoing {
    #[serde(rename = "auth_required")]
    AuthRequired { ha_version: String },
    #[serde(rename = "auth_ok")]
    AuthOk { ha_version: String },
    #[serde(rename = "auth_invalid")]
    AuthInvalid { message: String },
    #[serde(rename = "result")]
    Result {
        id: u64,
        success: bool,
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<WsError>,
    },
    #[serde(rename = "event")]
    Event { id: u64, event: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct WsError {
    code: String,
    message: String,
}

impl WsError {
    fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl From<FlowError> for WsError {
    fn from(e: FlowError) -> Self {
        let code = match &e {
            FlowError::UnknownFlow(_) | FlowError::UnknownEntry(_) => "not_found",
            FlowError::OptionsNotSupported(_) => "not_supported",
            FlowError::InvalidInput(_) => "invalid_format",
        };
        WsError::new(code, e.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct WsIncoming {
    id: Option<u64>,
    #[serde(rename = "type")]
    msg_type: String,
    access_token: Option<String>,
    #[serde(flatten)]
    data: Map<String, Value>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/websocket", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ApiState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn send_json(socket: &mut WebSocket, msg: &WsOutgoing) -> bool {
    match serde_json::to_string(msg) {
        Ok(text) => socket.send(Message::Text(text)).await.is_ok(),
        Err(e) => {
            tracing::error!("WS: failed to encode message: {}", e);
            false
        }
    }
}

async fn handle_ws(mut socket: WebSocket, state: ApiState) {
    let version = env!("CARGO_PKG_VERSION").to_string();
    if !send_json(&mut socket, &WsOutgoing::AuthRequired { ha_version: version.clone() }).await {
        return;
    }

    let auth_msg = match socket.recv().await {
        Some(Ok(Message::Text(text))) => text,
        _ => return,
    };
    match serde_json::from_str::<WsIncoming>(&auth_msg) {
        Ok(msg) if msg.msg_type == "auth" => {
            let token = msg.access_token.as_deref().unwrap_or("");
            if !state.auth.validate(token) {
                let _ = send_json(
                    &mut socket,
                    &WsOutgoing::AuthInvalid {
                        message: "Invalid access token".to_string(),
                    },
                )
                .await;
                return;
            }
            if !send_json(&mut socket, &WsOutgoing::AuthOk { ha_version: version }).await {
                return;
            }
        }
        _ => return,
    }

    let user_id = state.auth.user_id().map(String::from);
    tracing::debug!(user = user_id.as_deref().unwrap_or("-"), "WS client authenticated");

    // Bridge the broadcast receiver into an mpsc so it can sit in select!
    let (event_tx, mut event_rx) = mpsc::channel::<StateChangedEvent>(256);
    let mut state_rx = state.app.state_machine.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = state_rx.recv().await {
            if event_tx.send(event).await.is_err() {
                break;
            }
        }
    });

    let mut subscribed_ids: Vec<u64> = Vec::new();

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let incoming = match serde_json::from_str::<WsIncoming>(&text) {
                            Ok(incoming) => incoming,
                            Err(e) => {
                                tracing::debug!("WS: ignoring malformed message: {}", e);
                                continue;
                            }
                        };
                        let id = incoming.id.unwrap_or(0);
                        let reply = match incoming.msg_type.as_str() {
                            "subscribe_events" => {
                                subscribed_ids.push(id);
                                ws_result(id, Ok(Value::Null))
                            }
                            "ping" => serde_json::json!({"id": id, "type": "pong"}).to_string(),
                            _ => {
                                let context = match &user_id {
                                    Some(user) => Context::with_user(user.clone()),
                                    None => Context::new(),
                                };
                                ws_result(id, dispatch(&state, &incoming, context).await)
                            }
                        };
                        if socket.send(Message::Text(reply)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }

            Some(event) = event_rx.recv() => {
                for &sub_id in &subscribed_ids {
                    let msg = WsOutgoing::Event {
                        id: sub_id,
                        event: make_state_changed_event(&event),
                    };
                    if !send_json(&mut socket, &msg).await {
                        return;
                    }
                }
            }
        }
    }
}

fn str_field<'a>(data: &'a Map<String, Value>, key: &str) -> Result<&'a str, WsError> {
    data.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| WsError::new("invalid_format", format!("required key not provided: {}", key)))
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, WsError> {
    serde_json::to_value(value).map_err(|e| WsError::new("unknown_error", e.to_string()))
}

/// Run one command and produce its result payload.
async fn dispatch(state: &ApiState, incoming: &WsIncoming, context: Context) -> Result<Value, WsError> {
    let data = &incoming.data;
    match incoming.msg_type.as_str() {
        "get_states" => to_value(&state.app.state_machine.get_all()),

        "get_services" => {
            let mut domains = Map::new();
            for (domain, service) in services::list_services() {
                if let Value::Object(services) = domains
                    .entry(domain)
                    .or_insert_with(|| Value::Object(Map::new()))
                {
                    services.insert(service.to_string(), Value::Object(Map::new()));
                }
            }
            Ok(Value::Object(domains))
        }

        "call_service" => {
            // { domain, service, service_data: { entity_id, ... } }
            let call = ServiceCall {
                domain: str_field(data, "domain")?.to_string(),
                service: str_field(data, "service")?.to_string(),
                data: data.get("service_data").cloned().unwrap_or_else(|| Value::Object(Map::new())),
                context,
            };
            let changed = services::call_service(state, call).map_err(|e| WsError::new(e.code(), e.to_string()))?;
            to_value(&changed)
        }

        "input_button/list" => to_value(&state.buttons.list()),
        "input_button/create" => {
            let name = str_field(data, "name")?;
            let icon = data.get("icon").and_then(Value::as_str).map(String::from);
            let created = state
                .buttons
                .create(name, icon)
                .map_err(|e| WsError::new(e.code(), e.to_string()))?;
            to_value(&created)
        }
        "input_button/update" => {
            let id = str_field(data, "input_button_id")?;
            let changes = ButtonUpdate {
                name: data.get("name").and_then(Value::as_str).map(String::from),
                icon: data.get("icon").and_then(Value::as_str).map(String::from),
            };
            let updated = state
                .buttons
                .update(id, changes)
                .map_err(|e| WsError::new(e.code(), e.to_string()))?;
            to_value(&updated)
        }
        "input_button/delete" => {
            let id = str_field(data, "input_button_id")?;
            state
                .buttons
                .delete(id)
                .map_err(|e| WsError::new(e.code(), e.to_string()))?;
            Ok(Value::Null)
        }

        "config_entries/list" => {
            let domain = data.get("domain").and_then(Value::as_str);
            let entries: Vec<_> = state
                .config_entries
                .all()
                .into_iter()
                .filter(|e| domain.map_or(true, |d| e.domain == d))
                .collect();
            to_value(&entries)
        }
        "config_entries/flow/init" => {
            let handler = str_field(data, "handler")?;
            if handler != state.hue_flows.handler() {
                return Err(WsError::new("invalid_format", format!("Invalid handler specified: {}", handler)));
            }
            let source = match data.get("source").and_then(Value::as_str) {
                Some(s) => s
                    .parse::<ConfigEntrySource>()
                    .map_err(|e| WsError::new("invalid_format", e))?,
                None => ConfigEntrySource::User,
            };
            let result = state.hue_flows.init(source, data.get("data").cloned()).await?;
            to_value(&result)
        }
        "config_entries/flow/configure" => {
            let flow_id = str_field(data, "flow_id")?;
            let result = state.hue_flows.configure(flow_id, user_input(data)).await?;
            to_value(&result)
        }
        "config_entries/flow/progress" => to_value(&state.hue_flows.progress().await),
        "config_entries/options/init" => {
            let entry_id = str_field(data, "entry_id")?;
            to_value(&state.hue_flows.options_init(entry_id)?)
        }
        "config_entries/options/configure" => {
            let flow_id = str_field(data, "flow_id")?;
            to_value(&state.hue_flows.options_configure(flow_id, user_input(data))?)
        }

        other => {
            tracing::debug!(msg_type = %other, "Unknown WS message type");
            Err(WsError::new("unknown_command", "Unknown command."))
        }
    }
}

fn user_input(data: &Map<String, Value>) -> Map<String, Value> {
    data.get("user_input")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn ws_result(id: u64, outcome: Result<Value, WsError>) -> String {
    let msg = match outcome {
        Ok(result) => WsOutgoing::Result {
            id,
            success: true,
            result: Some(result),
            error: None,
        },
        Err(error) => WsOutgoing::Result {
            id,
            success: false,
            result: None,
            error: Some(error),
        },
    };
    serde_json::to_string(&msg).unwrap_or_default()
}

fn make_state_changed_event(event: &StateChangedEvent) -> Value {
    serde_json::json!({
        "event_type": "state_changed",
        "data": {
            "entity_id": event.entity_id,
            "old_state": event.old_state,
            "new_state": event.new_state,
        },
        "time_fired": chrono::Utc::now().to_rfc3339(),
    })
}
