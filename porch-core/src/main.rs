mod api;
mod auth;
mod config;
mod config_entries;
mod config_flow;
mod input_button;
mod integrations;
mod recorder;
mod services;
mod state;
mod util;
mod websocket;

use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use api::{ApiState, AppState};
use config_entries::{ConfigEntries, ConfigEntrySource};
use config_flow::FlowManager;
use input_button::InputButtons;
use integrations::hue::{BridgeApi, HttpBridgeApi};
use integrations::hue_config_flow::HueConfigFlow;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,porch=debug")),
        )
        .init();

    tracing::info!("Starting Porch v{}", env!("CARGO_PKG_VERSION"));

    let config_path = config::config_path();
    let config = config::load_config(&config_path)?;
    let storage_dir = config.storage_dir();
    std::fs::create_dir_all(&storage_dir)?;

    // Last known states, read before the recorder starts writing
    let db_path = storage_dir.join("porch.db");
    let restored = recorder::load_last_states(&db_path).unwrap_or_else(|e| {
        tracing::warn!("Could not restore previous states: {}", e);
        Default::default()
    });

    let state_machine = state::StateMachine::new(4096);
    let app_state = Arc::new(AppState::new(
        state_machine,
        config.location_name.clone(),
        config_path.clone(),
    ));
    recorder::start_recorder(&app_state.state_machine, db_path);

    let config_entries = Arc::new(ConfigEntries::load(&storage_dir)?);

    let buttons = Arc::new(InputButtons::setup(
        app_state.clone(),
        config.input_buttons()?,
        Some(input_button::storage_path(&storage_dir)),
        restored,
    )?);

    let bridge_api: Arc<dyn BridgeApi> = Arc::new(HttpBridgeApi::new());
    let location_name = config.location_name.clone();
    let hue_flows = Arc::new(FlowManager::new(config_entries.clone(), move || {
        HueConfigFlow::new(bridge_api.clone(), &location_name)
    }));

    // Bridges listed in YAML are imported in the background
    for bridge in config.hue.bridges.clone() {
        let flows = hue_flows.clone();
        tokio::spawn(async move {
            let data = serde_json::json!({ "host": bridge.host });
            match flows.init(ConfigEntrySource::Import, Some(data)).await {
                Ok(result) => tracing::info!(host = %bridge.host, "Hue import: {:?}", result.step),
                Err(e) => tracing::warn!(host = %bridge.host, "Hue import failed: {}", e),
            }
        });
    }

    for weather in config.environment_canada.clone() {
        if let Err(e) = weather.validate() {
            tracing::warn!(title = %weather.title, "Skipping weather feed: {}", e);
            continue;
        }
        integrations::environment_canada::start_weather_poller(app_state.clone(), weather);
    }

    let api_state = ApiState {
        app: app_state,
        auth: Arc::new(auth::AuthConfig::from_env()),
        config_entries,
        buttons,
        hue_flows,
    };

    // Build combined router: REST API + WebSocket
    let app = api::router(api_state.clone())
        .merge(websocket::router(api_state))
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config::http_port()));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
