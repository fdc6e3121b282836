//! Environment Canada weather integration
//!
//! Maps the Environment Canada city-page feed onto weather entities:
//! - Current observation fields with fallback to the first hourly forecast
//! - Vendor icon codes (0-47) to platform condition labels
//! - Half-day forecasts merged into calendar days, hourly forecasts as-is
//!
//! The feed snapshot is fetched as JSON from a configured URL. Parsing the
//! upstream XML is the job of whatever serves that URL.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::AppState;
use crate::util::slugify;

pub const DEFAULT_ATTRIBUTION: &str = "Data provided by Environment Canada";
const TEMP_CELSIUS: &str = "\u{00b0}C";

/// Number of calendar days after today built from half-day pairs.
const FOLLOWING_DAYS: i64 = 5;

// ── Conditions ─────────────────────────────────────────────────

/// Platform weather condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Condition {
    #[serde(rename = "sunny")]
    Sunny,
    #[serde(rename = "clear-night")]
    ClearNight,
    #[serde(rename = "partlycloudy")]
    PartlyCloudy,
    #[serde(rename = "cloudy")]
    Cloudy,
    #[serde(rename = "rainy")]
    Rainy,
    #[serde(rename = "lightning-rainy")]
    LightningRainy,
    #[serde(rename = "pouring")]
    Pouring,
    #[serde(rename = "snowy-rainy")]
    SnowyRainy,
    #[serde(rename = "snowy")]
    Snowy,
    #[serde(rename = "windy")]
    Windy,
    #[serde(rename = "fog")]
    Fog,
    #[serde(rename = "hail")]
    Hail,
}

impl Condition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::Sunny => "sunny",
            Condition::ClearNight => "clear-night",
            Condition::PartlyCloudy => "partlycloudy",
            Condition::Cloudy => "cloudy",
            Condition::Rainy => "rainy",
            Condition::LightningRainy => "lightning-rainy",
            Condition::Pouring => "pouring",
            Condition::SnowyRainy => "snowy-rainy",
            Condition::Snowy => "snowy",
            Condition::Windy => "windy",
            Condition::Fog => "fog",
            Condition::Hail => "hail",
        }
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Icon codes from the Environment Canada current conditions icon list.
///
/// 26 and 27 are listed under two conditions each upstream. Lookups return
/// the first entry in this order.
pub const ICON_CONDITION_MAP: &[(Condition, &[i64])] = &[
    (Condition::Sunny, &[0, 1]),
    (Condition::ClearNight, &[30, 31]),
    (Condition::PartlyCloudy, &[2, 3, 4, 5, 22, 32, 33, 34, 35]),
    (Condition::Cloudy, &[10]),
    (Condition::Rainy, &[6, 9, 11, 12, 28, 36]),
    (Condition::LightningRainy, &[19, 39, 46, 47]),
    (Condition::Pouring, &[13]),
    (Condition::SnowyRainy, &[7, 14, 15, 27, 37]),
    (Condition::Snowy, &[8, 16, 17, 18, 25, 26, 38, 40]),
    (Condition::Windy, &[43]),
    (Condition::Fog, &[20, 21, 23, 24, 44]),
    (Condition::Hail, &[26, 27]),
];

/// Return the condition for an icon code, or `None` when the code is unknown.
pub fn icon_code_to_condition(icon_code: i64) -> Option<Condition> {
    ICON_CONDITION_MAP
        .iter()
        .find(|(_, codes)| codes.contains(&icon_code))
        .map(|(condition, _)| *condition)
}

/// Every condition an icon code is listed under, in table order.
pub fn conditions_for_icon_code(icon_code: i64) -> Vec<Condition> {
    ICON_CONDITION_MAP
        .iter()
        .filter(|(_, codes)| codes.contains(&icon_code))
        .map(|(condition, _)| *condition)
        .collect()
}

// ── Feed payload ───────────────────────────────────────────────

/// A scalar from the feed. Upstream sends most values as strings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FeedValue {
    Number(f64),
    Text(String),
}

impl FeedValue {
    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_f64().map(FeedValue::Number),
            Value::String(s) => Some(FeedValue::Text(s.clone())),
            _ => None,
        }
    }

    /// Empty strings count as absent.
    fn is_present(&self) -> bool {
        match self {
            FeedValue::Number(_) => true,
            FeedValue::Text(s) => !s.trim().is_empty(),
        }
    }

    /// Finite value only: `NaN` and infinities count as unparsable.
    pub fn as_f64(&self) -> Option<f64> {
        let n = match self {
            FeedValue::Number(n) => *n,
            FeedValue::Text(s) => s.trim().parse().ok()?,
        };
        n.is_finite().then_some(n)
    }

    /// Integer value; fractional inputs are truncated.
    pub fn as_i64(&self) -> Option<i64> {
        if let FeedValue::Text(s) = self {
            if let Ok(i) = s.trim().parse::<i64>() {
                return Some(i);
            }
        }
        self.as_f64().map(|f| f.trunc() as i64)
    }
}

fn present(value: &Option<FeedValue>) -> Option<&FeedValue> {
    value.as_ref().filter(|v| v.is_present())
}

fn to_f64(field: &str, value: &FeedValue) -> Option<f64> {
    let parsed = value.as_f64();
    if parsed.is_none() {
        tracing::debug!(field, ?value, "Ignoring unparsable feed value");
    }
    parsed
}

fn to_i64(field: &str, value: &FeedValue) -> Option<i64> {
    let parsed = value.as_i64();
    if parsed.is_none() {
        tracing::debug!(field, ?value, "Ignoring unparsable feed value");
    }
    parsed
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemperatureClass {
    High,
    Low,
}

/// One half-day (day or night) period of the daily forecast.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HalfDayForecast {
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default)]
    pub temperature: Option<FeedValue>,
    #[serde(default)]
    pub temperature_class: Option<TemperatureClass>,
    #[serde(default)]
    pub icon_code: Option<FeedValue>,
    #[serde(default)]
    pub precip_probability: Option<FeedValue>,
}

/// One hourly forecast sample.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HourlyForecast {
    #[serde(default)]
    pub period: String,
    #[serde(default)]
    pub temperature: Option<FeedValue>,
    #[serde(default)]
    pub icon_code: Option<FeedValue>,
    #[serde(default)]
    pub precip_probability: Option<FeedValue>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedMetadata {
    #[serde(default)]
    pub attribution: Option<String>,
}

/// A fetched feed snapshot.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EcData {
    #[serde(default)]
    pub metadata: FeedMetadata,
    /// Field name to `{ "value": ... }`.
    #[serde(default)]
    pub conditions: serde_json::Map<String, Value>,
    #[serde(default)]
    pub daily_forecasts: Vec<HalfDayForecast>,
    #[serde(default)]
    pub hourly_forecasts: Vec<HourlyForecast>,
}

/// Current-conditions side of a feed.
pub trait ObservationSource {
    /// The `value` of a current-conditions field, if present and non-empty.
    fn observation(&self, field: &str) -> Option<FeedValue>;
}

/// Forecast side of a feed.
pub trait ForecastSource {
    fn half_days(&self) -> &[HalfDayForecast];
    fn hourly(&self) -> &[HourlyForecast];
}

impl ObservationSource for EcData {
    fn observation(&self, field: &str) -> Option<FeedValue> {
        self.conditions
            .get(field)
            .and_then(|entry| entry.get("value"))
            .and_then(FeedValue::from_json)
            .filter(FeedValue::is_present)
    }
}

impl ForecastSource for EcData {
    fn half_days(&self) -> &[HalfDayForecast] {
        &self.daily_forecasts
    }

    fn hourly(&self) -> &[HourlyForecast] {
        &self.hourly_forecasts
    }
}

// ── Observation accessors ──────────────────────────────────────

fn observed_f64<S: ObservationSource>(src: &S, field: &str) -> Option<f64> {
    src.observation(field).and_then(|v| to_f64(field, &v))
}

/// Current temperature, falling back to the first hourly forecast.
pub fn temperature<S: ObservationSource + ForecastSource>(src: &S) -> Option<f64> {
    if let Some(v) = src.observation("temperature") {
        return to_f64("temperature", &v);
    }
    src.hourly()
        .first()
        .and_then(|hour| present(&hour.temperature))
        .and_then(|v| to_f64("temperature", v))
}

pub fn humidity<S: ObservationSource>(src: &S) -> Option<f64> {
    observed_f64(src, "humidity")
}

pub fn wind_speed<S: ObservationSource>(src: &S) -> Option<f64> {
    observed_f64(src, "wind_speed")
}

pub fn wind_bearing<S: ObservationSource>(src: &S) -> Option<f64> {
    observed_f64(src, "wind_bearing")
}

/// Pressure in hPa. The feed reports kPa.
pub fn pressure<S: ObservationSource>(src: &S) -> Option<f64> {
    observed_f64(src, "pressure").map(|kpa| 10.0 * kpa)
}

pub fn visibility<S: ObservationSource>(src: &S) -> Option<f64> {
    observed_f64(src, "visibility")
}

/// Current condition from the observed icon code, falling back to the
/// first hourly forecast.
pub fn condition<S: ObservationSource + ForecastSource>(src: &S) -> Option<Condition> {
    let icon_code = src.observation("icon_code").or_else(|| {
        src.hourly()
            .first()
            .and_then(|hour| present(&hour.icon_code))
            .cloned()
    })?;
    to_i64("icon_code", &icon_code).and_then(icon_code_to_condition)
}

// ── Forecasts ──────────────────────────────────────────────────

/// A platform forecast record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastPoint {
    pub datetime: String,
    pub condition: Option<Condition>,
    pub precipitation_probability: Option<i64>,
    pub temperature: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub templow: Option<i64>,
}

fn int_field(field: &str, value: &Option<FeedValue>) -> Option<i64> {
    present(value).and_then(|v| to_i64(field, v))
}

fn condition_of(value: &Option<FeedValue>) -> Option<Condition> {
    int_field("icon_code", value).and_then(icon_code_to_condition)
}

/// Merge half-day periods into calendar days.
///
/// Returns `None` when the feed has no daily forecast. A feed that starts
/// at night yields a first day without a high.
pub fn daily_forecast<S: ForecastSource>(src: &S, now: DateTime<Utc>) -> Option<Vec<ForecastPoint>> {
    let half_days = src.half_days();
    let first = half_days.first()?;

    let (today_high, today_low, rest) = if first.temperature_class == Some(TemperatureClass::High) {
        let low = half_days.get(1).and_then(|h| int_field("temperature", &h.temperature));
        (
            int_field("temperature", &first.temperature),
            low,
            half_days.get(2..).unwrap_or_default(),
        )
    } else {
        (None, int_field("temperature", &first.temperature), &half_days[1..])
    };

    let mut days = Vec::with_capacity(1 + FOLLOWING_DAYS as usize);
    days.push(ForecastPoint {
        datetime: now.to_rfc3339(),
        condition: condition_of(&first.icon_code),
        precipitation_probability: int_field("precip_probability", &first.precip_probability),
        temperature: today_high,
        templow: today_low,
    });

    for (day, pair) in (1..=FOLLOWING_DAYS).zip(rest.chunks_exact(2)) {
        let (high, low) = (&pair[0], &pair[1]);
        days.push(ForecastPoint {
            datetime: (now + chrono::Duration::days(day)).to_rfc3339(),
            condition: condition_of(&high.icon_code),
            precipitation_probability: int_field("precip_probability", &high.precip_probability),
            temperature: int_field("temperature", &high.temperature),
            templow: int_field("temperature", &low.temperature),
        });
    }

    Some(days)
}

/// One record per hourly sample.
pub fn hourly_forecast<S: ForecastSource>(src: &S) -> Vec<ForecastPoint> {
    src.hourly()
        .iter()
        .map(|hour| ForecastPoint {
            datetime: hour.period.clone(),
            condition: condition_of(&hour.icon_code),
            precipitation_probability: int_field("precip_probability", &hour.precip_probability),
            temperature: int_field("temperature", &hour.temperature),
            templow: None,
        })
        .collect()
}

// ── Configuration ──────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
#[error("Station ID must be of the form \"XX/s0000###\"")]
pub struct InvalidStation;

/// Check that a station id is well-formed. `None` is allowed.
pub fn validate_station(station: Option<&str>) -> Result<Option<&str>, InvalidStation> {
    static STATION_RE: OnceLock<Regex> = OnceLock::new();
    let Some(station) = station else {
        return Ok(None);
    };
    let re = STATION_RE
        .get_or_init(|| Regex::new(r"^[A-Z]{2}/s0000\d{3}$").expect("station pattern is valid"));
    if re.is_match(station) {
        Ok(Some(station))
    } else {
        Err(InvalidStation)
    }
}

/// Configuration for one Environment Canada feed.
#[derive(Debug, Clone, Deserialize)]
pub struct WeatherConfig {
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default)]
    pub station: Option<String>,
    /// Base for entity unique ids; defaults to the station id, then the title slug.
    #[serde(default)]
    pub unique_id: Option<String>,
    /// URL serving the feed snapshot as JSON.
    pub feed_url: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_title() -> String {
    "Environment Canada".to_string()
}

fn default_poll_interval() -> u64 {
    300
}

impl WeatherConfig {
    pub fn validate(&self) -> Result<(), InvalidStation> {
        validate_station(self.station.as_deref()).map(|_| ())
    }

    fn base_unique_id(&self) -> String {
        self.unique_id
            .clone()
            .or_else(|| self.station.clone())
            .unwrap_or_else(|| slugify(&self.title))
    }
}

// ── Entities ───────────────────────────────────────────────────

/// A daily or hourly weather entity backed by one feed.
#[derive(Debug, Clone)]
pub struct EcWeather {
    pub name: String,
    pub unique_id: String,
    pub hourly: bool,
}

impl EcWeather {
    pub fn new(title: &str, base_unique_id: &str, hourly: bool) -> Self {
        Self {
            name: format!("{}{}", title, if hourly { " Hourly" } else { "" }),
            unique_id: format!("{}{}", base_unique_id, if hourly { "-hourly" } else { "-daily" }),
            hourly,
        }
    }

    pub fn entity_id(&self) -> String {
        format!("weather.{}", slugify(&self.name))
    }

    /// Entity state and attributes for a feed snapshot.
    pub fn render(&self, data: &EcData, now: DateTime<Utc>) -> (String, serde_json::Map<String, Value>) {
        let state = condition(data)
            .map(|c| c.as_str().to_string())
            .unwrap_or_else(|| crate::state::STATE_UNKNOWN.to_string());

        let forecast = if self.hourly {
            Some(hourly_forecast(data))
        } else {
            daily_forecast(data, now)
        };

        let attribution = data
            .metadata
            .attribution
            .clone()
            .unwrap_or_else(|| DEFAULT_ATTRIBUTION.to_string());

        let mut attrs = serde_json::Map::new();
        attrs.insert("friendly_name".into(), serde_json::json!(self.name));
        attrs.insert("attribution".into(), serde_json::json!(attribution));
        attrs.insert("temperature".into(), serde_json::json!(temperature(data)));
        attrs.insert("temperature_unit".into(), serde_json::json!(TEMP_CELSIUS));
        attrs.insert("humidity".into(), serde_json::json!(humidity(data)));
        attrs.insert("wind_speed".into(), serde_json::json!(wind_speed(data)));
        attrs.insert("wind_bearing".into(), serde_json::json!(wind_bearing(data)));
        attrs.insert("pressure".into(), serde_json::json!(pressure(data)));
        attrs.insert("visibility".into(), serde_json::json!(visibility(data)));
        attrs.insert("forecast".into(), serde_json::json!(forecast));

        (state, attrs)
    }
}

/// Both entities for a configured feed.
pub fn entities_for(config: &WeatherConfig) -> [EcWeather; 2] {
    let base = config.base_unique_id();
    [
        EcWeather::new(&config.title, &base, false),
        EcWeather::new(&config.title, &base, true),
    ]
}

/// Publish a snapshot to the state machine.
pub fn update_entities(app: &AppState, entities: &[EcWeather], data: &EcData) {
    let now = Utc::now();
    for entity in entities {
        let (state, attrs) = entity.render(data, now);
        tracing::trace!(unique_id = %entity.unique_id, state = %state, "Weather entity updated");
        app.state_machine.set(entity.entity_id(), state, attrs);
    }
}

// ── Poller ─────────────────────────────────────────────────────

/// Spawn a background task that periodically fetches the feed snapshot
/// and updates the weather entities.
pub fn start_weather_poller(app: Arc<AppState>, config: WeatherConfig) {
    tokio::spawn(async move {
        let client = match reqwest::Client::builder()
            .user_agent(concat!("porch/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("Weather: failed to build HTTP client: {}", e);
                return;
            }
        };

        let entities = entities_for(&config);
        let mut first_fetch = true;

        loop {
            match fetch_feed(&client, &config.feed_url).await {
                Ok(data) => {
                    if first_fetch {
                        tracing::info!(
                            title = %config.title,
                            station = config.station.as_deref().unwrap_or("-"),
                            "Weather integration active"
                        );
                        first_fetch = false;
                    }
                    update_entities(&app, &entities, &data);
                }
                Err(e) => {
                    tracing::warn!(
                        "Weather fetch failed: {} (retrying in {}s)",
                        e,
                        config.poll_interval_secs
                    );
                }
            }

            tokio::time::sleep(Duration::from_secs(config.poll_interval_secs)).await;
        }
    });
}

async fn fetch_feed(client: &reqwest::Client, url: &str) -> anyhow::Result<EcData> {
    let resp = client.get(url).send().await?;
    let status = resp.status();
    if !status.is_success() {
        anyhow::bail!("feed returned HTTP {}", status);
    }
    Ok(resp.json::<EcData>().await?)
}
