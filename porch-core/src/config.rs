//! YAML configuration
//!
//! ```yaml
//! location_name: Home
//! storage_dir: .porch
//! environment_canada:
//!   - title: Ottawa
//!     station: ON/s0000430
//!     feed_url: http://localhost:8080/ottawa.json
//! hue:
//!   bridges:
//!     - host: 192.168.1.20
//! input_button:
//!   doorbell: { name: Doorbell, icon: "mdi:bell" }
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::input_button::{parse_yaml_config, ButtonConfig, ButtonError};
use crate::integrations::environment_canada::WeatherConfig;

pub const DEFAULT_CONFIG_PATH: &str = "porch.yaml";
pub const DEFAULT_STORAGE_DIR: &str = ".porch";
pub const DEFAULT_HTTP_PORT: u16 = 8124;

#[derive(Debug, Default, Deserialize)]
pub struct PorchConfig {
    #[serde(default = "default_location_name")]
    pub location_name: String,
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,
    #[serde(default)]
    pub environment_canada: Vec<WeatherConfig>,
    #[serde(default)]
    pub hue: HueYaml,
    /// Raw `input_button:` section. Kept unparsed so that an explicit
    /// null can be told apart from a missing section.
    #[serde(skip)]
    pub input_button: Option<serde_yaml::Value>,
}

/// Bridges listed in YAML are imported as config entries.
#[derive(Debug, Default, Deserialize)]
pub struct HueYaml {
    #[serde(default)]
    pub bridges: Vec<HueBridgeImport>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HueBridgeImport {
    pub host: String,
}

fn default_location_name() -> String {
    "Home".to_string()
}

impl PorchConfig {
    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        let raw: serde_yaml::Value = serde_yaml::from_str(contents)?;
        if raw.is_null() {
            return Ok(Self {
                location_name: default_location_name(),
                ..Default::default()
            });
        }
        let mut config: PorchConfig = serde_yaml::from_value(raw.clone())?;
        config.input_button = raw.get("input_button").cloned();
        Ok(config)
    }

    /// Buttons from the `input_button:` section; none when it is absent.
    pub fn input_buttons(&self) -> Result<Vec<ButtonConfig>, ButtonError> {
        match &self.input_button {
            Some(section) => parse_yaml_config(section),
            None => Ok(Vec::new()),
        }
    }

    /// Storage directory, `PORCH_STORAGE_DIR` taking precedence.
    pub fn storage_dir(&self) -> PathBuf {
        std::env::var("PORCH_STORAGE_DIR")
            .map(PathBuf::from)
            .ok()
            .or_else(|| self.storage_dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR))
    }
}

/// Load the config file. A missing file yields the defaults.
pub fn load_config(path: &Path) -> anyhow::Result<PorchConfig> {
    if !path.exists() {
        tracing::warn!("Config file {} not found, using defaults", path.display());
        return PorchConfig::parse("");
    }
    let contents = std::fs::read_to_string(path)?;
    PorchConfig::parse(&contents)
}

/// Config file path from `PORCH_CONFIG`.
pub fn config_path() -> PathBuf {
    std::env::var("PORCH_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// HTTP port from `PORCH_HTTP_PORT`.
pub fn http_port() -> u16 {
    std::env::var("PORCH_HTTP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_HTTP_PORT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = PorchConfig::parse(
            r#"
location_name: Cottage
environment_canada:
  - title: Ottawa
    station: ON/s0000430
    feed_url: http://localhost/ottawa.json
hue:
  bridges:
    - host: 192.168.1.20
input_button:
  doorbell: { name: Doorbell }
  reset: ~
"#,
        )
        .unwrap();

        assert_eq!(config.location_name, "Cottage");
        assert_eq!(config.environment_canada.len(), 1);
        assert_eq!(config.environment_canada[0].poll_interval_secs, 300);
        assert_eq!(config.hue.bridges[0].host, "192.168.1.20");
        let buttons = config.input_buttons().unwrap();
        assert_eq!(buttons.len(), 2);
        assert_eq!(buttons[0].name.as_deref(), Some("Doorbell"));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = PorchConfig::parse("").unwrap();
        assert_eq!(config.location_name, "Home");
        assert!(config.input_buttons().unwrap().is_empty());
        assert!(config.environment_canada.is_empty());
    }

    #[test]
    fn test_null_input_button_section_is_rejected() {
        let config = PorchConfig::parse("input_button:\n").unwrap();
        assert!(config.input_button.is_some());
        assert!(config.input_buttons().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("nope.yaml")).unwrap();
        assert_eq!(config.location_name, "Home");
    }
}
