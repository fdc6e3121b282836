//! Setup flow for Hue bridges
//!
//! Bridges arrive from the user (N-UPnP discovery or a manual host), from
//! SSDP, zeroconf and HomeKit discovery, or from a YAML import. Every path
//! ends in the `link` step, which pairs with the bridge once its link
//! button was pressed.

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::hue::{normalize_bridge_id, BridgeApi, DiscoveredBridge, HueError, DOMAIN};
use crate::config_entries::{ConfigEntry, ConfigEntrySource};
use crate::config_flow::{
    AbortFlow, ConfigFlow, FlowContext, FlowStep, FormField, StepResult, DEFAULT_DISCOVERY_UNIQUE_ID,
};
use crate::util::slugify_max;

pub const HUE_MANUAL_BRIDGE_ID: &str = "manual";
pub const HUE_MANUFACTURER_URLS: [&str; 2] = ["http://www.philips.com", "http://www.philips-hue.com"];
pub const HUE_IGNORED_BRIDGE_NAMES: [&str; 2] = ["Home Assistant Bridge", "Espalexa"];

pub const CONF_HOST: &str = "host";
pub const CONF_API_KEY: &str = "api_key";
pub const CONF_API_VERSION: &str = "api_version";
pub const CONF_ALLOW_HUE_GROUPS: &str = "allow_hue_groups";
pub const CONF_ALLOW_UNREACHABLE: &str = "allow_unreachable";

const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Deserialize)]
struct SsdpInfo {
    #[serde(default)]
    ssdp_location: Option<String>,
    #[serde(default)]
    upnp: HashMap<String, Value>,
}

impl SsdpInfo {
    fn upnp_str(&self, key: &str) -> Option<&str> {
        self.upnp.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ZeroconfInfo {
    #[serde(default)]
    host: String,
    #[serde(default)]
    properties: Map<String, Value>,
}

pub struct HueConfigFlow {
    api: Arc<dyn BridgeApi>,
    location_name: String,
    discovery_timeout: Duration,
    discovered_bridges: Vec<DiscoveredBridge>,
    bridge: Option<DiscoveredBridge>,
}

impl HueConfigFlow {
    pub fn new(api: Arc<dyn BridgeApi>, location_name: &str) -> Self {
        Self {
            api,
            location_name: location_name.to_string(),
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            discovered_bridges: Vec::new(),
            bridge: None,
        }
    }

    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Device type sent when pairing, e.g. `porch#home`.
    fn device_type(&self) -> String {
        format!("porch#{}", slugify_max(&self.location_name, 19))
    }

    fn discovered(&self, bridge_id: &str) -> Option<DiscoveredBridge> {
        self.discovered_bridges.iter().find(|b| b.id == bridge_id).cloned()
    }

    /// Resolve a bridge, preferring one already seen during discovery.
    async fn get_bridge(&self, host: &str, bridge_id: Option<&str>) -> Option<DiscoveredBridge> {
        if let Some(id) = bridge_id {
            if let Some(bridge) = self.discovered(&normalize_bridge_id(id)) {
                return Some(bridge);
            }
        }
        match self.api.discover_bridge(host).await {
            Ok(bridge) => {
                if let Some(id) = bridge_id {
                    if normalize_bridge_id(id) != bridge.id {
                        tracing::warn!(host = %host, "Bridge at {} reports id {}, expected {}", host, bridge.id, id);
                    }
                }
                Some(bridge)
            }
            Err(e) => {
                tracing::warn!(host = %host, "Hue bridge lookup failed: {}", e);
                None
            }
        }
    }

    fn manual_form() -> FlowStep {
        FlowStep::form("manual", vec![FormField::string(CONF_HOST)])
    }

    fn link_form() -> FlowStep {
        FlowStep::form("link", vec![])
    }

    async fn step_init(&mut self, ctx: &mut FlowContext<'_>, input: Option<Map<String, Value>>) -> StepResult {
        if let Some(input) = input {
            let id = input.get("id").and_then(Value::as_str).unwrap_or_default();
            if id == HUE_MANUAL_BRIDGE_ID {
                return Ok(Self::manual_form());
            }
            if let Some(bridge) = self.discovered(id) {
                ctx.set_unique_id(bridge.id.clone(), false)?;
                self.bridge = Some(bridge);
                return Ok(Self::link_form());
            }
        }

        let bridges = match tokio::time::timeout(self.discovery_timeout, self.api.discover_nupnp()).await {
            Err(_) => return Err(AbortFlow::new("discover_timeout")),
            Ok(Err(e)) => {
                tracing::warn!("Hue N-UPnP discovery failed: {}", e);
                Vec::new()
            }
            Ok(Ok(bridges)) => bridges,
        };

        let configured = ctx.current_ids(false);
        let bridges: Vec<DiscoveredBridge> = bridges
            .into_iter()
            .filter(|b| !configured.contains(&b.id))
            .collect();
        if bridges.is_empty() {
            return Ok(Self::manual_form());
        }

        let mut options: Vec<(String, String)> = bridges.iter().map(|b| (b.id.clone(), b.host.clone())).collect();
        options.push((HUE_MANUAL_BRIDGE_ID.to_string(), "Manually add a Hue Bridge".to_string()));
        self.discovered_bridges = bridges;

        Ok(FlowStep::form("init", vec![FormField::select("id", options)]))
    }

    async fn step_manual(&mut self, ctx: &mut FlowContext<'_>, input: Map<String, Value>) -> StepResult {
        let host = input.get(CONF_HOST).and_then(Value::as_str).unwrap_or_default().to_string();
        ctx.abort_entries_match(CONF_HOST, &Value::String(host.clone()))?;

        let bridge = self
            .get_bridge(&host, None)
            .await
            .ok_or_else(|| AbortFlow::new("cannot_connect"))?;
        self.bridge = Some(bridge);
        Ok(Self::link_form())
    }

    async fn step_link(&mut self, ctx: &mut FlowContext<'_>) -> StepResult {
        let bridge = self.bridge.clone().ok_or_else(|| AbortFlow::new("unknown"))?;

        let app_key = match self.api.create_app_key(&bridge.host, &self.device_type()).await {
            Ok(key) => key,
            Err(HueError::LinkButtonNotPressed) => {
                return Ok(FlowStep::form_with_errors("link", vec![], base_error("register_failed")));
            }
            Err(HueError::CannotConnect(e)) => {
                tracing::error!(host = %bridge.host, "Error connecting to the Hue bridge: {}", e);
                return Err(AbortFlow::new("cannot_connect"));
            }
            Err(e) => {
                tracing::error!(host = %bridge.host, "Unknown error connecting to the Hue bridge: {}", e);
                return Ok(FlowStep::form_with_errors("link", vec![], base_error("linking")));
            }
        };

        if ctx.unique_id.is_none() || ctx.unique_id.as_deref() == Some(DEFAULT_DISCOVERY_UNIQUE_ID) {
            ctx.set_unique_id(bridge.id.clone(), false)?;
        }

        let mut data = Map::new();
        data.insert(CONF_HOST.into(), Value::String(bridge.host.clone()));
        data.insert(CONF_API_KEY.into(), Value::String(app_key));
        data.insert(CONF_API_VERSION.into(), Value::from(bridge.api_version()));
        tracing::info!(host = %bridge.host, "Paired with Hue bridge {}", bridge.id);
        Ok(FlowStep::create_entry(format!("Hue Bridge {}", bridge.id), data))
    }

    async fn step_ssdp(&mut self, ctx: &mut FlowContext<'_>, data: Option<Value>) -> StepResult {
        let info: SsdpInfo = parse_discovery(data)?;

        let manufacturer = info.upnp_str("manufacturerURL").unwrap_or_default();
        if !HUE_MANUFACTURER_URLS.contains(&manufacturer) {
            return Err(AbortFlow::new("not_hue_bridge"));
        }
        let friendly_name = info.upnp_str("friendlyName").unwrap_or_default();
        if HUE_IGNORED_BRIDGE_NAMES.iter().any(|n| friendly_name.contains(n)) {
            return Err(AbortFlow::new("not_hue_bridge"));
        }
        let (Some(location), Some(serial)) = (info.ssdp_location.as_deref(), info.upnp_str("serialNumber")) else {
            return Err(AbortFlow::new("not_hue_bridge"));
        };

        let host = reqwest::Url::parse(location)
            .ok()
            .and_then(|url| url.host_str().map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string()))
            .filter(|h| !h.is_empty())
            .ok_or_else(|| AbortFlow::new("not_hue_bridge"))?;

        self.discovered_host(ctx, &host, Some(serial)).await
    }

    async fn step_zeroconf(&mut self, ctx: &mut FlowContext<'_>, data: Option<Value>) -> StepResult {
        let info: ZeroconfInfo = parse_discovery(data)?;
        let bridge_id = info.properties.get("bridgeid").and_then(Value::as_str);
        self.discovered_host(ctx, &info.host, bridge_id).await
    }

    /// Shared tail of SSDP and zeroconf discovery.
    async fn discovered_host(&mut self, ctx: &mut FlowContext<'_>, host: &str, bridge_id: Option<&str>) -> StepResult {
        if host.parse::<Ipv6Addr>().is_ok() {
            return Err(AbortFlow::new("invalid_host"));
        }

        let bridge = self
            .get_bridge(host, bridge_id)
            .await
            .ok_or_else(|| AbortFlow::new("cannot_connect"))?;

        ctx.set_unique_id(bridge.id.clone(), true)?;
        let mut updates = Map::new();
        updates.insert(CONF_HOST.into(), Value::String(bridge.host.clone()));
        ctx.abort_if_unique_id_configured(&updates)?;

        self.bridge = Some(bridge);
        Ok(Self::link_form())
    }

    /// HomeKit reports a different bridge id, so the flow runs without one.
    async fn step_homekit(&mut self, ctx: &mut FlowContext<'_>, data: Option<Value>) -> StepResult {
        let info: ZeroconfInfo = parse_discovery(data)?;
        let bridge = self
            .get_bridge(&info.host, None)
            .await
            .ok_or_else(|| AbortFlow::new("cannot_connect"))?;
        ctx.handle_discovery_without_unique_id()?;
        self.bridge = Some(bridge);
        Ok(Self::link_form())
    }

    async fn step_import(&mut self, ctx: &mut FlowContext<'_>, data: Option<Value>) -> StepResult {
        let host = data
            .as_ref()
            .and_then(|d| d.get(CONF_HOST))
            .and_then(Value::as_str)
            .ok_or_else(|| AbortFlow::new("invalid_host"))?
            .to_string();
        ctx.abort_entries_match(CONF_HOST, &Value::String(host.clone()))?;

        let bridge = self
            .get_bridge(&host, None)
            .await
            .ok_or_else(|| AbortFlow::new("cannot_connect"))?;
        self.bridge = Some(bridge);
        Ok(Self::link_form())
    }
}

#[async_trait]
impl ConfigFlow for HueConfigFlow {
    const DOMAIN: &'static str = DOMAIN;

    async fn start(&mut self, ctx: &mut FlowContext<'_>, data: Option<Value>) -> StepResult {
        match ctx.source {
            ConfigEntrySource::User => self.step_init(ctx, None).await,
            ConfigEntrySource::Import => self.step_import(ctx, data).await,
            ConfigEntrySource::Ssdp => self.step_ssdp(ctx, data).await,
            ConfigEntrySource::Zeroconf => self.step_zeroconf(ctx, data).await,
            ConfigEntrySource::Homekit => self.step_homekit(ctx, data).await,
            ConfigEntrySource::Ignore => ctx.ignore(data),
        }
    }

    async fn step(&mut self, ctx: &mut FlowContext<'_>, step_id: &str, input: Map<String, Value>) -> StepResult {
        match step_id {
            "init" => self.step_init(ctx, Some(input)).await,
            "manual" => self.step_manual(ctx, input).await,
            "link" => self.step_link(ctx).await,
            _ => Err(AbortFlow::new("unknown_step")),
        }
    }

    /// Only v1 bridges expose group and reachability options.
    fn supports_options(entry: &ConfigEntry) -> bool {
        entry
            .data
            .get(CONF_API_VERSION)
            .and_then(Value::as_u64)
            .unwrap_or(1)
            == 1
    }

    fn options_schema(entry: &ConfigEntry) -> Vec<FormField> {
        let current = |key: &str| entry.options.get(key).and_then(Value::as_bool).unwrap_or(false);
        vec![
            FormField::boolean(CONF_ALLOW_HUE_GROUPS, current(CONF_ALLOW_HUE_GROUPS)),
            FormField::boolean(CONF_ALLOW_UNREACHABLE, current(CONF_ALLOW_UNREACHABLE)),
        ]
    }
}

fn parse_discovery<T: serde::de::DeserializeOwned + Default>(data: Option<Value>) -> Result<T, AbortFlow> {
    match data {
        Some(value) => serde_json::from_value(value).map_err(|_| AbortFlow::new("not_hue_bridge")),
        None => Ok(T::default()),
    }
}

fn base_error(reason: &str) -> HashMap<String, String> {
    HashMap::from([("base".to_string(), reason.to_string())])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_entries::ConfigEntries;
    use crate::config_flow::{FlowManager, FlowResult};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockBridgeApi {
        nupnp: Mutex<Vec<DiscoveredBridge>>,
        nupnp_delay: Option<Duration>,
        bridges: Mutex<HashMap<String, DiscoveredBridge>>,
        /// Errors returned by successive pairing attempts before succeeding.
        pair_errors: Mutex<Vec<HueError>>,
        device_types: Mutex<Vec<String>>,
    }

    impl MockBridgeApi {
        fn with_bridge(self, id: &str, host: &str) -> Self {
            self.bridges
                .lock()
                .unwrap()
                .insert(host.to_string(), DiscoveredBridge::new(id, host, false));
            self
        }

        fn with_nupnp(self, bridges: Vec<DiscoveredBridge>) -> Self {
            *self.nupnp.lock().unwrap() = bridges;
            self
        }

        fn fail_pairing(&self, err: HueError) {
            self.pair_errors.lock().unwrap().push(err);
        }
    }

    #[async_trait]
    impl BridgeApi for MockBridgeApi {
        async fn discover_nupnp(&self) -> Result<Vec<DiscoveredBridge>, HueError> {
            if let Some(delay) = self.nupnp_delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.nupnp.lock().unwrap().clone())
        }

        async fn discover_bridge(&self, host: &str) -> Result<DiscoveredBridge, HueError> {
            self.bridges
                .lock()
                .unwrap()
                .get(host)
                .cloned()
                .ok_or_else(|| HueError::CannotConnect(host.to_string()))
        }

        async fn create_app_key(&self, _host: &str, device_type: &str) -> Result<String, HueError> {
            self.device_types.lock().unwrap().push(device_type.to_string());
            match self.pair_errors.lock().unwrap().pop() {
                Some(err) => Err(err),
                None => Ok("123456789".to_string()),
            }
        }
    }

    fn manager(api: Arc<MockBridgeApi>) -> FlowManager<HueConfigFlow> {
        FlowManager::new(Arc::new(ConfigEntries::in_memory()), move || {
            HueConfigFlow::new(api.clone(), "Test Home").with_discovery_timeout(Duration::from_millis(50))
        })
    }

    fn input(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn step_id(result: &FlowResult) -> &str {
        match &result.step {
            FlowStep::Form { step_id, .. } => step_id,
            other => panic!("expected a form, got {:?}", other),
        }
    }

    fn add_entry(flows: &FlowManager<HueConfigFlow>, host: &str, unique_id: Option<&str>, source: ConfigEntrySource) -> String {
        let mut data = Map::new();
        if !host.is_empty() {
            data.insert(CONF_HOST.into(), json!(host));
        }
        let entry = ConfigEntry::new(DOMAIN, "Hue Bridge", data, source, unique_id.map(String::from));
        let id = entry.entry_id.clone();
        flows.entries().add(entry);
        id
    }

    #[tokio::test]
    async fn test_flow_works() {
        let api = Arc::new(MockBridgeApi::default().with_nupnp(vec![DiscoveredBridge::new("BSB002_00", "1.2.3.4", false)]));
        let flows = manager(api.clone());

        let result = flows.init(ConfigEntrySource::User, None).await.unwrap();
        assert_eq!(step_id(&result), "init");

        let result = flows
            .configure(&result.flow_id, input(json!({"id": "bsb002_00"})))
            .await
            .unwrap();
        assert_eq!(step_id(&result), "link");
        let progress = flows.progress().await;
        assert_eq!(progress[0].unique_id.as_deref(), Some("bsb002_00"));

        let result = flows.configure(&result.flow_id, Map::new()).await.unwrap();
        assert_eq!(
            result.step,
            FlowStep::create_entry(
                "Hue Bridge bsb002_00",
                input(json!({"host": "1.2.3.4", "api_key": "123456789", "api_version": 1}))
            )
        );
        assert_eq!(api.device_types.lock().unwrap()[0], "porch#test_home");
    }

    #[tokio::test]
    async fn test_manual_flow_works() {
        let api = Arc::new(
            MockBridgeApi::default()
                .with_nupnp(vec![DiscoveredBridge::new("bla", "1.2.3.4", false)])
                .with_bridge("aabbccddeeff", "2.2.2.2"),
        );
        let flows = manager(api);

        let result = flows.init(ConfigEntrySource::User, None).await.unwrap();
        let result = flows
            .configure(&result.flow_id, input(json!({"id": "manual"})))
            .await
            .unwrap();
        assert_eq!(step_id(&result), "manual");

        let result = flows
            .configure(&result.flow_id, input(json!({"host": "2.2.2.2"})))
            .await
            .unwrap();
        assert_eq!(step_id(&result), "link");

        let result = flows.configure(&result.flow_id, Map::new()).await.unwrap();
        assert!(matches!(&result.step, FlowStep::CreateEntry { title, .. } if title == "Hue Bridge aabbccddeeff"));
        let entries = flows.entries().entries(DOMAIN);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].unique_id.as_deref(), Some("aabbccddeeff"));
    }

    #[tokio::test]
    async fn test_manual_flow_no_discovered_bridges() {
        let flows = manager(Arc::new(MockBridgeApi::default()));
        let result = flows.init(ConfigEntrySource::User, None).await.unwrap();
        assert_eq!(step_id(&result), "manual");
    }

    #[tokio::test]
    async fn test_manual_flow_already_configured() {
        let flows = manager(Arc::new(MockBridgeApi::default()));
        add_entry(&flows, "1.2.3.4", None, ConfigEntrySource::User);

        let result = flows.init(ConfigEntrySource::User, None).await.unwrap();
        let result = flows
            .configure(&result.flow_id, input(json!({"host": "1.2.3.4"})))
            .await
            .unwrap();
        assert_eq!(result.step, FlowStep::abort("already_configured"));
    }

    #[tokio::test]
    async fn test_manual_flow_bridge_unreachable() {
        let flows = manager(Arc::new(MockBridgeApi::default()));
        let result = flows.init(ConfigEntrySource::User, None).await.unwrap();
        let result = flows
            .configure(&result.flow_id, input(json!({"host": "9.9.9.9"})))
            .await
            .unwrap();
        assert_eq!(result.step, FlowStep::abort("cannot_connect"));
    }

    #[tokio::test]
    async fn test_flow_all_discovered_bridges_exist() {
        let api = Arc::new(MockBridgeApi::default().with_nupnp(vec![DiscoveredBridge::new("bla", "1.2.3.4", false)]));
        let flows = manager(api);
        add_entry(&flows, "1.2.3.4", Some("bla"), ConfigEntrySource::User);

        let result = flows.init(ConfigEntrySource::User, None).await.unwrap();
        assert_eq!(step_id(&result), "manual");
    }

    #[tokio::test]
    async fn test_flow_bridges_discovered_ignored_entry_does_not_count() {
        let api = Arc::new(MockBridgeApi::default().with_nupnp(vec![
            DiscoveredBridge::new("bla", "1.2.3.4", false),
            DiscoveredBridge::new("beer", "5.6.7.8", false),
        ]));
        let flows = manager(api);
        add_entry(&flows, "", Some("bla"), ConfigEntrySource::Ignore);

        let result = flows.init(ConfigEntrySource::User, None).await.unwrap();
        assert_eq!(step_id(&result), "init");
        match &result.step {
            FlowStep::Form { data_schema, .. } => {
                let ids: Vec<&str> = data_schema[0].options.iter().map(|(v, _)| v.as_str()).collect();
                assert_eq!(ids, vec!["bla", "beer", "manual"]);
            }
            _ => unreachable!(),
        }

        let err = flows
            .configure(&result.flow_id, input(json!({"id": "not-discovered"})))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::config_flow::FlowError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_flow_timeout_discovery() {
        let api = Arc::new(MockBridgeApi {
            nupnp_delay: Some(Duration::from_secs(2)),
            ..Default::default()
        });
        let flows = manager(api);
        let result = flows.init(ConfigEntrySource::User, None).await.unwrap();
        assert_eq!(result.step, FlowStep::abort("discover_timeout"));
    }

    #[tokio::test]
    async fn test_flow_link_errors() {
        let api = Arc::new(MockBridgeApi::default().with_nupnp(vec![DiscoveredBridge::new("aabbccddeeff", "1.2.3.4", true)]));
        let flows = manager(api.clone());

        let result = flows.init(ConfigEntrySource::User, None).await.unwrap();
        let result = flows
            .configure(&result.flow_id, input(json!({"id": "aabbccddeeff"})))
            .await
            .unwrap();

        api.fail_pairing(HueError::LinkButtonNotPressed);
        let result = flows.configure(&result.flow_id, Map::new()).await.unwrap();
        assert_eq!(result.step, FlowStep::form_with_errors("link", vec![], base_error("register_failed")));

        api.fail_pairing(HueError::Bridge("boom".into()));
        let result = flows.configure(&result.flow_id, Map::new()).await.unwrap();
        assert_eq!(result.step, FlowStep::form_with_errors("link", vec![], base_error("linking")));

        // Pairing succeeds on a v2 bridge
        let done = flows.configure(&result.flow_id, Map::new()).await.unwrap();
        match &done.step {
            FlowStep::CreateEntry { data, .. } => assert_eq!(data[CONF_API_VERSION], json!(2)),
            other => panic!("expected entry, got {:?}", other),
        }

        let result = flows.init(ConfigEntrySource::Import, Some(json!({"host": "5.5.5.5"}))).await.unwrap();
        assert_eq!(result.step, FlowStep::abort("cannot_connect"));
    }

    #[tokio::test]
    async fn test_flow_link_cannot_connect() {
        let api = Arc::new(MockBridgeApi::default().with_nupnp(vec![DiscoveredBridge::new("aabbccddeeff", "1.2.3.4", false)]));
        let flows = manager(api.clone());

        let result = flows.init(ConfigEntrySource::User, None).await.unwrap();
        let result = flows
            .configure(&result.flow_id, input(json!({"id": "aabbccddeeff"})))
            .await
            .unwrap();
        api.fail_pairing(HueError::CannotConnect("refused".into()));
        let result = flows.configure(&result.flow_id, Map::new()).await.unwrap();
        assert_eq!(result.step, FlowStep::abort("cannot_connect"));
    }

    fn ssdp(location: Option<&str>, manufacturer: &str, name: &str, serial: Option<&str>) -> Value {
        let mut upnp = json!({"manufacturerURL": manufacturer, "friendlyName": name});
        if let Some(serial) = serial {
            upnp["serialNumber"] = json!(serial);
        }
        json!({"ssdp_location": location, "upnp": upnp})
    }

    #[tokio::test]
    async fn test_bridge_ssdp() {
        let api = Arc::new(MockBridgeApi::default().with_bridge("1234", "0.0.0.0"));
        let flows = manager(api);

        for manufacturer in HUE_MANUFACTURER_URLS {
            let result = flows
                .init(
                    ConfigEntrySource::Ssdp,
                    Some(ssdp(Some("http://0.0.0.0/"), manufacturer, "Hue", Some("1234"))),
                )
                .await
                .unwrap();
            // The second manufacturer finds the first flow holding the id
            if manufacturer == HUE_MANUFACTURER_URLS[0] {
                assert_eq!(step_id(&result), "link");
            } else {
                assert_eq!(result.step, FlowStep::abort("already_in_progress"));
            }
        }
    }

    #[tokio::test]
    async fn test_bridge_ssdp_rejections() {
        let flows = manager(Arc::new(MockBridgeApi::default().with_bridge("1234", "0.0.0.0")));
        let philips = HUE_MANUFACTURER_URLS[0];
        let cases = [
            (ssdp(None, "http://www.notphilips.com", "Hue", None), "not_hue_bridge"),
            (ssdp(Some("http://0.0.0.0/"), philips, "Home Assistant Bridge", Some("1234")), "not_hue_bridge"),
            (ssdp(Some("http://0.0.0.0/"), philips, "Espalexa (0.0.0.0)", Some("1234")), "not_hue_bridge"),
            (ssdp(Some("http://0.0.0.0/"), philips, "Hue", None), "not_hue_bridge"),
            (ssdp(Some("http:///"), philips, "Hue", Some("1234")), "not_hue_bridge"),
            (ssdp(Some("http://[fd00::eeb5:faff:fe84:b17d]/description.xml"), philips, "Hue", Some("1234")), "invalid_host"),
        ];
        for (data, reason) in cases {
            let result = flows.init(ConfigEntrySource::Ssdp, Some(data)).await.unwrap();
            assert_eq!(result.step, FlowStep::abort(reason));
        }
    }

    #[tokio::test]
    async fn test_bridge_ssdp_already_configured_updates_host() {
        let api = Arc::new(MockBridgeApi::default().with_bridge("1234", "0.0.0.0"));
        let flows = manager(api);
        let entry_id = add_entry(&flows, "1.1.1.1", Some("1234"), ConfigEntrySource::User);

        let result = flows
            .init(
                ConfigEntrySource::Ssdp,
                Some(ssdp(Some("http://0.0.0.0/"), HUE_MANUFACTURER_URLS[0], "Hue", Some("1234"))),
            )
            .await
            .unwrap();
        assert_eq!(result.step, FlowStep::abort("already_configured"));
        assert_eq!(flows.entries().get(&entry_id).unwrap().host(), Some("0.0.0.0"));
    }

    #[tokio::test]
    async fn test_bridge_zeroconf() {
        let api = Arc::new(MockBridgeApi::default().with_bridge("ecb5fafffeabcabc", "192.168.1.217"));
        let flows = manager(api);
        let data = json!({
            "host": "192.168.1.217",
            "properties": {"bridgeid": "ecb5fafffeabcabc", "modelid": "BSB002"}
        });

        let result = flows.init(ConfigEntrySource::Zeroconf, Some(data.clone())).await.unwrap();
        assert_eq!(step_id(&result), "link");
        assert_eq!(flows.progress().await[0].unique_id.as_deref(), Some("ecb5faabcabc"));

        let ipv6 = json!({"host": "fd00::eeb5:faff:fe84:b17d", "properties": {"bridgeid": "ecb5faabcabc"}});
        let result = flows.init(ConfigEntrySource::Zeroconf, Some(ipv6)).await.unwrap();
        assert_eq!(result.step, FlowStep::abort("invalid_host"));
    }

    #[tokio::test]
    async fn test_bridge_zeroconf_already_exists() {
        let api = Arc::new(MockBridgeApi::default().with_bridge("ecb5faabcabc", "192.168.1.217"));
        let flows = manager(api);
        let entry_id = add_entry(&flows, "0.0.0.0", Some("ecb5faabcabc"), ConfigEntrySource::User);

        let data = json!({"host": "192.168.1.217", "properties": {"bridgeid": "ecb5faabcabc"}});
        let result = flows.init(ConfigEntrySource::Zeroconf, Some(data)).await.unwrap();
        assert_eq!(result.step, FlowStep::abort("already_configured"));
        assert_eq!(flows.entries().get(&entry_id).unwrap().host(), Some("192.168.1.217"));
    }

    #[tokio::test]
    async fn test_bridge_homekit() {
        let api = Arc::new(MockBridgeApi::default().with_bridge("aabbccddeeff", "0.0.0.0"));
        let flows = manager(api);
        let data = json!({"host": "0.0.0.0", "properties": {"id": "aa:bb:cc:dd:ee:ff"}});

        let result = flows.init(ConfigEntrySource::Homekit, Some(data)).await.unwrap();
        assert_eq!(step_id(&result), "link");
        assert_eq!(
            flows.progress().await[0].unique_id.as_deref(),
            Some(DEFAULT_DISCOVERY_UNIQUE_ID)
        );

        // Pairing replaces the placeholder id with the bridge id
        let result = flows.configure(&result.flow_id, Map::new()).await.unwrap();
        assert!(matches!(result.step, FlowStep::CreateEntry { .. }));
        assert_eq!(
            flows.entries().entries(DOMAIN)[0].unique_id.as_deref(),
            Some("aabbccddeeff")
        );
    }

    #[tokio::test]
    async fn test_bridge_homekit_already_configured() {
        let api = Arc::new(MockBridgeApi::default().with_bridge("aabbccddeeff", "0.0.0.0"));
        let flows = manager(api);
        add_entry(&flows, "0.0.0.0", Some("aabbccddeeff"), ConfigEntrySource::User);

        let data = json!({"host": "0.0.0.0", "properties": {"id": "aa:bb:cc:dd:ee:ff"}});
        let result = flows.init(ConfigEntrySource::Homekit, Some(data)).await.unwrap();
        assert_eq!(result.step, FlowStep::abort("already_configured"));
    }

    #[tokio::test]
    async fn test_bridge_import_flow() {
        let api = Arc::new(MockBridgeApi::default().with_bridge("aabbccddeeff", "2.2.2.2"));
        let flows = manager(api);

        let result = flows
            .init(ConfigEntrySource::Import, Some(json!({"host": "2.2.2.2"})))
            .await
            .unwrap();
        assert_eq!(step_id(&result), "link");
        flows.configure(&result.flow_id, Map::new()).await.unwrap();

        let result = flows
            .init(ConfigEntrySource::Import, Some(json!({"host": "2.2.2.2"})))
            .await
            .unwrap();
        assert_eq!(result.step, FlowStep::abort("already_configured"));
    }

    #[tokio::test]
    async fn test_creating_entry_removes_entries_for_same_host_or_bridge() {
        let api = Arc::new(MockBridgeApi::default().with_bridge("id-1234", "2.2.2.2"));
        let flows = manager(api);
        add_entry(&flows, "0.0.0.0", Some("id-1234"), ConfigEntrySource::User);

        let result = flows.init(ConfigEntrySource::User, None).await.unwrap();
        let result = flows
            .configure(&result.flow_id, input(json!({"host": "2.2.2.2"})))
            .await
            .unwrap();
        let result = flows.configure(&result.flow_id, Map::new()).await.unwrap();
        assert!(matches!(result.step, FlowStep::CreateEntry { .. }));

        let entries = flows.entries().entries(DOMAIN);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].host(), Some("2.2.2.2"));
        assert_eq!(entries[0].unique_id.as_deref(), Some("id-1234"));
    }

    #[tokio::test]
    async fn test_options_flow_v1() {
        let flows = manager(Arc::new(MockBridgeApi::default()));
        let entry_id = add_entry(&flows, "0.0.0.0", Some("aabbccddeeff"), ConfigEntrySource::User);

        let result = flows.options_init(&entry_id).unwrap();
        match &result.step {
            FlowStep::Form { step_id, data_schema, .. } => {
                assert_eq!(step_id, "init");
                let names: Vec<&str> = data_schema.iter().map(|f| f.name.as_str()).collect();
                assert_eq!(names, vec![CONF_ALLOW_HUE_GROUPS, CONF_ALLOW_UNREACHABLE]);
                assert!(data_schema.iter().all(|f| f.default == Some(json!(false))));
            }
            other => panic!("expected form, got {:?}", other),
        }

        let options = input(json!({"allow_hue_groups": true, "allow_unreachable": true}));
        let result = flows.options_configure(&result.flow_id, options.clone()).unwrap();
        assert_eq!(result.step, FlowStep::create_entry("", options));
    }

    #[tokio::test]
    async fn test_options_flow_v2_not_supported() {
        let flows = manager(Arc::new(MockBridgeApi::default()));
        let mut data = Map::new();
        data.insert(CONF_HOST.into(), json!("0.0.0.0"));
        data.insert(CONF_API_VERSION.into(), json!(2));
        let entry = ConfigEntry::new(DOMAIN, "Hue", data, ConfigEntrySource::User, Some("x".into()));
        let entry_id = entry.entry_id.clone();
        flows.entries().add(entry);

        assert!(matches!(
            flows.options_init(&entry_id),
            Err(crate::config_flow::FlowError::OptionsNotSupported(_))
        ));
    }

    #[test]
    fn test_device_type_truncates_location() {
        let flow = HueConfigFlow::new(Arc::new(MockBridgeApi::default()), "A very long location name here");
        assert_eq!(flow.device_type(), "porch#a_very_long_locatio");
    }
}
