//! Philips Hue bridge client
//!
//! Discovery and pairing against the bridge REST API:
//! - N-UPnP discovery: GET https://discovery.meethue.com/
//! - Bridge lookup: GET http://{host}/api/config (bridgeid)
//! - V2 probe: GET https://{host}/clip/v2/resources answers 403 without a key
//! - Link button pairing: POST /api with {devicetype: "porch#instance"}

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DOMAIN: &str = "hue";

const NUPNP_URL: &str = "https://discovery.meethue.com/";

/// Hue error type returned while the link button has not been pressed.
const ERROR_LINK_BUTTON_NOT_PRESSED: u64 = 101;

/// A bridge found on the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredBridge {
    pub id: String,
    pub host: String,
    pub supports_v2: bool,
}

impl DiscoveredBridge {
    pub fn new(id: &str, host: &str, supports_v2: bool) -> Self {
        Self {
            id: normalize_bridge_id(id),
            host: host.to_string(),
            supports_v2,
        }
    }

    pub fn api_version(&self) -> u8 {
        if self.supports_v2 {
            2
        } else {
            1
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HueError {
    #[error("link button not pressed")]
    LinkButtonNotPressed,
    #[error("cannot connect to bridge: {0}")]
    CannotConnect(String),
    #[error("bridge error: {0}")]
    Bridge(String),
}

impl From<reqwest::Error> for HueError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() || e.is_request() {
            HueError::CannotConnect(e.to_string())
        } else {
            HueError::Bridge(e.to_string())
        }
    }
}

/// Bridge operations needed by the setup flow.
#[async_trait]
pub trait BridgeApi: Send + Sync {
    /// Ask the Hue cloud for bridges on the local network.
    async fn discover_nupnp(&self) -> Result<Vec<DiscoveredBridge>, HueError>;

    /// Identify the bridge at `host`.
    async fn discover_bridge(&self, host: &str) -> Result<DiscoveredBridge, HueError>;

    /// Pair with the bridge. Succeeds only after the link button was pressed.
    async fn create_app_key(&self, host: &str, device_type: &str) -> Result<String, HueError>;
}

/// Normalize a bridge id as reported by discovery, SSDP or the bridge itself.
///
/// `AA:BB:CC:DD:EE:FF` becomes `aabbccddeeff`; 16-character ids with the
/// `fffe` filler in the middle collapse to the 12-character form.
pub fn normalize_bridge_id(bridge_id: &str) -> String {
    let id = bridge_id.to_lowercase().replace(':', "");
    if id.len() == 16 && id.is_ascii() && &id[6..10] == "fffe" {
        return format!("{}{}", &id[..6], &id[10..]);
    }
    id
}

#[derive(Debug, Deserialize)]
struct NupnpEntry {
    id: String,
    #[serde(rename = "internalipaddress")]
    internal_ip_address: String,
}

#[derive(Debug, Deserialize)]
struct BridgeConfig {
    #[serde(default)]
    bridgeid: Option<String>,
}

/// reqwest-backed [`BridgeApi`].
pub struct HttpBridgeApi {
    client: reqwest::Client,
    /// Bridges serve CLIP v2 over HTTPS with a self-signed certificate.
    insecure_client: reqwest::Client,
}

impl HttpBridgeApi {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let insecure_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            insecure_client,
        }
    }

    async fn is_v2_bridge(&self, host: &str) -> bool {
        let url = format!("https://{}/clip/v2/resources", host);
        match self.insecure_client.get(&url).send().await {
            Ok(resp) => resp.status() == reqwest::StatusCode::FORBIDDEN,
            Err(e) => {
                tracing::debug!(host = %host, "CLIP v2 probe failed: {}", e);
                false
            }
        }
    }
}

impl Default for HttpBridgeApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BridgeApi for HttpBridgeApi {
    async fn discover_nupnp(&self) -> Result<Vec<DiscoveredBridge>, HueError> {
        let entries: Vec<NupnpEntry> = self.client.get(NUPNP_URL).send().await?.json().await?;

        let mut bridges = Vec::with_capacity(entries.len());
        for entry in entries {
            let supports_v2 = self.is_v2_bridge(&entry.internal_ip_address).await;
            bridges.push(DiscoveredBridge::new(&entry.id, &entry.internal_ip_address, supports_v2));
        }
        tracing::debug!("N-UPnP discovery found {} Hue bridges", bridges.len());
        Ok(bridges)
    }

    async fn discover_bridge(&self, host: &str) -> Result<DiscoveredBridge, HueError> {
        let url = format!("http://{}/api/config", host);
        let config: BridgeConfig = self.client.get(&url).send().await?.json().await?;
        let id = config
            .bridgeid
            .ok_or_else(|| HueError::Bridge(format!("{} did not report a bridge id", host)))?;
        let supports_v2 = self.is_v2_bridge(host).await;
        Ok(DiscoveredBridge::new(&id, host, supports_v2))
    }

    async fn create_app_key(&self, host: &str, device_type: &str) -> Result<String, HueError> {
        let url = format!("http://{}/api", host);
        let payload = serde_json::json!({"devicetype": device_type, "generateclientkey": true});

        let body: Vec<Value> = self.client.post(&url).json(&payload).send().await?.json().await?;
        parse_pair_response(&body)
    }
}

/// Interpret the array returned by `POST /api`.
fn parse_pair_response(body: &[Value]) -> Result<String, HueError> {
    let Some(first) = body.first() else {
        return Err(HueError::Bridge("empty pairing response".to_string()));
    };

    if let Some(username) = first
        .get("success")
        .and_then(|s| s.get("username"))
        .and_then(Value::as_str)
    {
        return Ok(username.to_string());
    }

    if let Some(err) = first.get("error") {
        let error_type = err.get("type").and_then(Value::as_u64).unwrap_or(0);
        if error_type == ERROR_LINK_BUTTON_NOT_PRESSED {
            return Err(HueError::LinkButtonNotPressed);
        }
        let desc = err
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("Unknown error");
        return Err(HueError::Bridge(format!("type {}: {}", error_type, desc)));
    }

    Err(HueError::Bridge("unexpected pairing response".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_bridge_id() {
        assert_eq!(normalize_bridge_id("AA:BB:CC:DD:EE:FF"), "aabbccddeeff");
        assert_eq!(normalize_bridge_id("001788FFFE23BFC2"), "00178823bfc2");
        assert_eq!(normalize_bridge_id("aabbccddeeff"), "aabbccddeeff");
        // 16 chars without the filler stay as they are
        assert_eq!(normalize_bridge_id("0017880123456789"), "0017880123456789");
    }

    #[test]
    fn test_discovered_bridge_normalizes_id() {
        let bridge = DiscoveredBridge::new("ECB5FAFFFE0A1B2C", "1.2.3.4", true);
        assert_eq!(bridge.id, "ecb5fa0a1b2c");
        assert_eq!(bridge.api_version(), 2);
        assert_eq!(DiscoveredBridge::new("x", "h", false).api_version(), 1);
    }

    #[test]
    fn test_parse_pair_response() {
        let ok = [json!({"success": {"username": "abcdefgh", "clientkey": "k"}})];
        assert_eq!(parse_pair_response(&ok).unwrap(), "abcdefgh");

        let not_pressed = [json!({"error": {"type": 101, "address": "", "description": "link button not pressed"}})];
        assert!(matches!(
            parse_pair_response(&not_pressed),
            Err(HueError::LinkButtonNotPressed)
        ));

        let other = [json!({"error": {"type": 7, "description": "invalid value"}})];
        match parse_pair_response(&other) {
            Err(HueError::Bridge(msg)) => assert!(msg.contains("invalid value")),
            r => panic!("unexpected result: {:?}", r),
        }

        assert!(matches!(parse_pair_response(&[]), Err(HueError::Bridge(_))));
    }
}
