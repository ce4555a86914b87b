//! AccuWeather adapter.
//!
//! Premium long-range forecasts behind a very small free quota. Every query
//! first needs a location key (geoposition or city search); keys are
//! memoised per normalised query so repeat lookups cost nothing.
//!
//! API: `https://dataservice.accuweather.com/`
//! Auth: `apikey` query parameter.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use parking_lot::Mutex;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

use super::{build_client, decode, get_json, kmh_to_ms, vendor_country, ProviderRequest, WeatherProvider};
use crate::error::ProviderError;
use crate::types::{
    CanonicalWeatherRecord, Condition, CurrentConditions, DailyForecast, Freshness, Location, ProviderId,
};

const BASE_URL: &str = "https://dataservice.accuweather.com";
/// Resolved location keys kept per adapter; oldest dropped first.
const LOCATION_MEMO_CAPACITY: usize = 512;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct AccuLocation {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "LocalizedName")]
    name: String,
    #[serde(rename = "Country")]
    country: AccuCountry,
    #[serde(rename = "GeoPosition")]
    geo: AccuGeo,
}

#[derive(Debug, Clone, Deserialize)]
struct AccuCountry {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct AccuGeo {
    #[serde(rename = "Latitude")]
    lat: f64,
    #[serde(rename = "Longitude")]
    lon: f64,
}

#[derive(Debug, Deserialize)]
struct MetricValue {
    #[serde(rename = "Metric")]
    metric: Measure,
}

#[derive(Debug, Deserialize)]
struct Measure {
    #[serde(rename = "Value")]
    value: f64,
}

#[derive(Debug, Deserialize)]
struct AccuCurrent {
    #[serde(rename = "EpochTime")]
    epoch: i64,
    #[serde(rename = "WeatherText")]
    text: String,
    #[serde(rename = "WeatherIcon")]
    icon: i64,
    #[serde(rename = "Temperature")]
    temperature: MetricValue,
    #[serde(rename = "RealFeelTemperature")]
    real_feel: Option<MetricValue>,
    #[serde(rename = "RelativeHumidity")]
    humidity: f64,
    #[serde(rename = "Pressure", default)]
    pressure: Option<MetricValue>,
    #[serde(rename = "Visibility", default)]
    visibility: Option<MetricValue>,
    #[serde(rename = "UVIndex", default)]
    uv_index: Option<f64>,
    #[serde(rename = "Wind")]
    wind: AccuWind,
}

#[derive(Debug, Deserialize)]
struct AccuWind {
    #[serde(rename = "Speed")]
    speed: MetricValue,
    #[serde(rename = "Direction", default)]
    direction: Option<AccuDirection>,
}

#[derive(Debug, Deserialize)]
struct AccuDirection {
    #[serde(rename = "Degrees")]
    degrees: f64,
}

#[derive(Debug, Deserialize)]
struct AccuForecast {
    #[serde(rename = "DailyForecasts")]
    daily: Vec<AccuDaily>,
}

#[derive(Debug, Deserialize)]
struct AccuDaily {
    #[serde(rename = "Date")]
    date: DateTime<FixedOffset>,
    #[serde(rename = "Temperature")]
    temperature: AccuRange,
    #[serde(rename = "Day")]
    day: AccuDayPart,
    #[serde(rename = "Sun", default)]
    sun: Option<AccuSun>,
}

#[derive(Debug, Deserialize)]
struct AccuRange {
    #[serde(rename = "Minimum")]
    min: Measure,
    #[serde(rename = "Maximum")]
    max: Measure,
}

#[derive(Debug, Deserialize)]
struct AccuDayPart {
    #[serde(rename = "Icon")]
    icon: i64,
    #[serde(rename = "IconPhrase")]
    phrase: String,
}

#[derive(Debug, Deserialize)]
struct AccuSun {
    #[serde(rename = "Rise", default)]
    rise: Option<DateTime<FixedOffset>>,
    #[serde(rename = "Set", default)]
    set: Option<DateTime<FixedOffset>>,
}

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

/// Map AccuWeather icon numbers (1-44).
pub(crate) fn map_icon(icon: i64) -> Condition {
    match icon {
        1 | 2 | 33 | 34 => Condition::Clear,
        3 | 4 | 6 | 7 | 8 | 35 | 36 | 38 => Condition::Clouds,
        5 | 11 | 37 => Condition::Mist,
        12 | 13 | 14 | 18 | 39 | 40 => Condition::Rain,
        15 | 16 | 17 | 41 | 42 => Condition::Thunderstorm,
        19..=26 | 29 | 43 | 44 => Condition::Snow,
        _ => Condition::Other,
    }
}

/// Pick the location from a geoposition (object) or city search (array)
/// response.
pub(crate) fn parse_location(value: Value) -> Result<AccuLocation, ProviderError> {
    match value {
        Value::Array(items) => {
            let first = items
                .into_iter()
                .next()
                .ok_or_else(|| ProviderError::not_found(ProviderId::AccuWeather, "no matching location"))?;
            decode(ProviderId::AccuWeather, "location", first)
        }
        Value::Null => Err(ProviderError::not_found(ProviderId::AccuWeather, "no matching location")),
        other => decode(ProviderId::AccuWeather, "location", other),
    }
}

pub(crate) fn normalize(
    location: &AccuLocation,
    current: Value,
    forecast: Value,
    days: usize,
) -> Result<CanonicalWeatherRecord, ProviderError> {
    let current: Vec<AccuCurrent> = decode(ProviderId::AccuWeather, "currentconditions", current)?;
    let cur = current
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::parse(ProviderId::AccuWeather, "currentconditions: empty array"))?;
    let fc: AccuForecast = decode(ProviderId::AccuWeather, "forecast", forecast)?;

    let sun = fc.daily.first().and_then(|d| d.sun.as_ref());
    let sunrise = sun.and_then(|s| s.rise).map(|t| t.with_timezone(&Utc));
    let sunset = sun.and_then(|s| s.set).map(|t| t.with_timezone(&Utc));

    let forecast = fc
        .daily
        .iter()
        .take(days)
        .map(|d| DailyForecast {
            date: d.date.date_naive(),
            min: d.temperature.min.value,
            max: d.temperature.max.value,
            condition: map_icon(d.day.icon),
            description: d.day.phrase.clone(),
        })
        .collect();

    let temperature = cur.temperature.metric.value;
    Ok(CanonicalWeatherRecord {
        location: Location {
            name: location.name.clone(),
            country: vendor_country(Some(location.country.id.clone())),
            lat: location.geo.lat,
            lon: location.geo.lon,
        },
        current: CurrentConditions {
            temperature,
            feels_like: cur.real_feel.map(|r| r.metric.value).unwrap_or(temperature),
            humidity: cur.humidity,
            pressure: cur.pressure.map(|p| p.metric.value),
            visibility: cur.visibility.map(|v| v.metric.value),
            uv_index: cur.uv_index,
            wind_speed: kmh_to_ms(cur.wind.speed.metric.value),
            wind_direction: cur.wind.direction.map(|d| d.degrees),
            condition: map_icon(cur.icon),
            description: cur.text,
        },
        forecast,
        hourly: None,
        sunrise,
        sunset,
        source: ProviderId::AccuWeather,
        freshness: Freshness::Fresh,
        observed_at: DateTime::from_timestamp(cur.epoch, 0).unwrap_or_else(Utc::now),
        cached_at: None,
    })
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Bounded query → location-key memo with insertion-order eviction.
#[derive(Debug)]
struct LocationMemo {
    capacity: usize,
    entries: HashMap<String, AccuLocation>,
    order: VecDeque<String>,
}

impl LocationMemo {
    fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), entries: HashMap::new(), order: VecDeque::new() }
    }

    fn get(&self, key: &str) -> Option<AccuLocation> {
        self.entries.get(key).cloned()
    }

    fn remember(&mut self, key: String, location: AccuLocation) {
        if self.entries.insert(key.clone(), location).is_none() {
            self.order.push_back(key);
        }
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct AccuWeatherProvider {
    http: Client,
    api_key: SecretString,
    location_keys: Mutex<LocationMemo>,
}

impl AccuWeatherProvider {
    pub fn new(api_key: SecretString, timeout: std::time::Duration) -> anyhow::Result<Self> {
        Ok(Self {
            http: build_client(ProviderId::AccuWeather, timeout)?,
            api_key,
            location_keys: Mutex::new(LocationMemo::new(LOCATION_MEMO_CAPACITY)),
        })
    }

    async fn resolve_location(&self, req: &ProviderRequest) -> Result<AccuLocation, ProviderError> {
        let memo_key = req.query.normalized();
        let cached = self.location_keys.lock().get(&memo_key);
        if let Some(hit) = cached {
            return Ok(hit);
        }

        let key = self.api_key.expose_secret();
        let (endpoint, url) = match (req.location.coordinates(), req.location.text()) {
            (Some(c), _) => (
                "geoposition",
                format!("{BASE_URL}/locations/v1/cities/geoposition/search?apikey={key}&q={},{}", c.lat, c.lon),
            ),
            (None, Some(text)) => (
                "cities/search",
                format!("{BASE_URL}/locations/v1/cities/search?apikey={key}&q={}", urlencoding::encode(text.trim())),
            ),
            (None, None) => {
                return Err(ProviderError::not_found(ProviderId::AccuWeather, "query has neither coordinates nor text"))
            }
        };
        let location = parse_location(get_json(&self.http, ProviderId::AccuWeather, endpoint, &url).await?)?;
        debug!(query = %memo_key, location_key = %location.key, "Resolved AccuWeather location key");
        self.location_keys.lock().remember(memo_key, location.clone());
        Ok(location)
    }
}

#[async_trait]
impl WeatherProvider for AccuWeatherProvider {
    fn id(&self) -> ProviderId {
        ProviderId::AccuWeather
    }

    async fn fetch(&self, req: &ProviderRequest) -> Result<CanonicalWeatherRecord, ProviderError> {
        let location = self.resolve_location(req).await?;
        let key = self.api_key.expose_secret();
        let (span, days) = if req.wants_extended() { ("15day", 15) } else { ("5day", 5) };

        let current_url = format!("{BASE_URL}/currentconditions/v1/{}?apikey={key}&details=true", location.key);
        let forecast_url =
            format!("{BASE_URL}/forecasts/v1/daily/{span}/{}?apikey={key}&metric=true&details=true", location.key);

        let (current, forecast) = futures::try_join!(
            get_json(&self.http, ProviderId::AccuWeather, "currentconditions", &current_url),
            get_json(&self.http, ProviderId::AccuWeather, "forecasts", &forecast_url),
        )?;
        normalize(&location, current, forecast, days)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
