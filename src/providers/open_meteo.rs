//! Open-Meteo adapter.
//!
//! Keyless, coordinate-based forecasts. International text queries are
//! resolved through the Open-Meteo geocoding API first.
//!
//! API: `https://api.open-meteo.com/v1/forecast`,
//! `https://geocoding-api.open-meteo.com/v1/search`
//! Auth: None required.
//! Rate limit: Generous (free tier).

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{build_client, decode, get_json, local_to_utc, vendor_country, ProviderRequest, WeatherProvider};
use crate::error::ProviderError;
use crate::location::DOMESTIC_COUNTRY;
use crate::types::{
    CanonicalWeatherRecord, Condition, CurrentConditions, DailyForecast, Freshness, HourlyPoint, Location,
    ProviderId,
};

const FORECAST_URL: &str = "https://api.open-meteo.com/v1/forecast";
const GEOCODING_URL: &str = "https://geocoding-api.open-meteo.com/v1/search";
const HOURLY_POINTS: usize = 8;
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M";

// ---------------------------------------------------------------------------
// Open-Meteo response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct OpenMeteoResponse {
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    utc_offset_seconds: i64,
    current: OpenMeteoCurrent,
    #[serde(default)]
    daily: Option<OpenMeteoDaily>,
    #[serde(default)]
    hourly: Option<OpenMeteoHourly>,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoCurrent {
    time: String,
    temperature_2m: f64,
    relative_humidity_2m: f64,
    #[serde(default)]
    apparent_temperature: Option<f64>,
    #[serde(default)]
    pressure_msl: Option<f64>,
    wind_speed_10m: f64,
    #[serde(default)]
    wind_direction_10m: Option<f64>,
    weather_code: i64,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoDaily {
    #[serde(default)]
    time: Vec<NaiveDate>,
    #[serde(default)]
    weather_code: Vec<i64>,
    #[serde(default)]
    temperature_2m_max: Vec<f64>,
    #[serde(default)]
    temperature_2m_min: Vec<f64>,
    #[serde(default)]
    sunrise: Vec<String>,
    #[serde(default)]
    sunset: Vec<String>,
    #[serde(default)]
    uv_index_max: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoHourly {
    #[serde(default)]
    time: Vec<String>,
    #[serde(default)]
    temperature_2m: Vec<Option<f64>>,
    #[serde(default)]
    weather_code: Vec<Option<i64>>,
    #[serde(default)]
    precipitation_probability: Vec<Option<f64>>,
    #[serde(default)]
    visibility: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct GeocodingResponse {
    #[serde(default)]
    results: Vec<GeocodingResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct GeocodingResult {
    name: String,
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    country_code: Option<String>,
}

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

/// Map WMO weather interpretation codes.
pub(crate) fn map_wmo(code: i64) -> (Condition, &'static str) {
    match code {
        0 => (Condition::Clear, "clear sky"),
        1 => (Condition::Clear, "mainly clear"),
        2 => (Condition::Clouds, "partly cloudy"),
        3 => (Condition::Clouds, "overcast"),
        45 | 48 => (Condition::Mist, "fog"),
        51..=57 => (Condition::Drizzle, "drizzle"),
        61..=67 => (Condition::Rain, "rain"),
        80..=82 => (Condition::Rain, "rain showers"),
        71..=77 => (Condition::Snow, "snow"),
        85 | 86 => (Condition::Snow, "snow showers"),
        95..=99 => (Condition::Thunderstorm, "thunderstorm"),
        _ => (Condition::Other, "unknown"),
    }
}

fn parse_local(text: &str, offset_secs: i64) -> Option<chrono::DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text, TIME_FORMAT)
        .ok()
        .map(|naive| local_to_utc(naive, offset_secs))
}

pub(crate) fn parse_geocoding(value: Value) -> Result<GeocodingResult, ProviderError> {
    let resp: GeocodingResponse = decode(ProviderId::OpenMeteo, "geocoding", value)?;
    resp.results
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::not_found(ProviderId::OpenMeteo, "geocoding returned no results"))
}

/// Build the canonical record. `name` and `country` come from the query
/// side since the forecast endpoint does not echo them.
pub(crate) fn normalize(
    payload: Value,
    name: String,
    country: Option<String>,
    days: usize,
) -> Result<CanonicalWeatherRecord, ProviderError> {
    let resp: OpenMeteoResponse = decode(ProviderId::OpenMeteo, "forecast", payload)?;
    let offset = resp.utc_offset_seconds;
    let cur = &resp.current;
    let observed_at = parse_local(&cur.time, offset)
        .ok_or_else(|| ProviderError::parse(ProviderId::OpenMeteo, format!("current.time: {}", cur.time)))?;

    let (forecast, sunrise, sunset, uv_today) = match &resp.daily {
        Some(d) => {
            let forecast: Vec<DailyForecast> = d
                .time
                .iter()
                .enumerate()
                .filter_map(|(i, date)| {
                    let (condition, description) = map_wmo(*d.weather_code.get(i)?);
                    Some(DailyForecast {
                        date: *date,
                        min: *d.temperature_2m_min.get(i)?,
                        max: *d.temperature_2m_max.get(i)?,
                        condition,
                        description: description.to_string(),
                    })
                })
                .take(days)
                .collect();
            (
                forecast,
                d.sunrise.first().and_then(|s| parse_local(s, offset)),
                d.sunset.first().and_then(|s| parse_local(s, offset)),
                d.uv_index_max.first().copied().flatten(),
            )
        }
        None => (Vec::new(), None, None, None),
    };

    let mut visibility = None;
    let hourly: Vec<HourlyPoint> = match &resp.hourly {
        Some(h) => {
            // hourly arrays start at local midnight; skip to the current hour
            let points: Vec<(usize, chrono::DateTime<Utc>)> = h
                .time
                .iter()
                .enumerate()
                .filter_map(|(i, t)| parse_local(t, offset).map(|at| (i, at)))
                .filter(|(_, at)| *at + chrono::Duration::hours(1) > observed_at)
                .collect();
            if let Some((i, _)) = points.first() {
                visibility = h.visibility.get(*i).copied().flatten().map(|m| m / 1000.0);
            }
            points
                .into_iter()
                .filter_map(|(i, time)| {
                    Some(HourlyPoint {
                        time,
                        temperature: h.temperature_2m.get(i).copied().flatten()?,
                        condition: h
                            .weather_code
                            .get(i)
                            .copied()
                            .flatten()
                            .map(|c| map_wmo(c).0)
                            .unwrap_or(Condition::Other),
                        precipitation_chance: h.precipitation_probability.get(i).copied().flatten(),
                    })
                })
                .take(HOURLY_POINTS)
                .collect()
        }
        None => Vec::new(),
    };

    let (condition, description) = map_wmo(cur.weather_code);
    Ok(CanonicalWeatherRecord {
        location: Location { name, country, lat: resp.latitude, lon: resp.longitude },
        current: CurrentConditions {
            temperature: cur.temperature_2m,
            feels_like: cur.apparent_temperature.unwrap_or(cur.temperature_2m),
            humidity: cur.relative_humidity_2m,
            pressure: cur.pressure_msl,
            visibility,
            uv_index: uv_today,
            wind_speed: cur.wind_speed_10m,
            wind_direction: cur.wind_direction_10m,
            condition,
            description: description.to_string(),
        },
        forecast,
        hourly: if hourly.is_empty() { None } else { Some(hourly) },
        sunrise,
        sunset,
        source: ProviderId::OpenMeteo,
        freshness: Freshness::Fresh,
        observed_at,
        cached_at: None,
    })
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

pub struct OpenMeteoProvider {
    http: Client,
}

impl OpenMeteoProvider {
    pub fn new(timeout: std::time::Duration) -> anyhow::Result<Self> {
        Ok(Self { http: build_client(ProviderId::OpenMeteo, timeout)? })
    }

    /// Coordinates, display name and country for the request, geocoding
    /// free text when needed.
    async fn resolve(&self, req: &ProviderRequest) -> Result<(f64, f64, String, Option<String>), ProviderError> {
        let country = req.location.is_domestic().then(|| DOMESTIC_COUNTRY.to_string());
        if let Some(c) = req.location.coordinates() {
            return Ok((c.lat, c.lon, req.location.display_name(), country));
        }
        let text = req
            .location
            .text()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ProviderError::not_found(ProviderId::OpenMeteo, "query has neither coordinates nor text"))?;
        let url = format!("{GEOCODING_URL}?name={}&count=1&language=en&format=json", urlencoding::encode(text));
        let place = parse_geocoding(get_json(&self.http, ProviderId::OpenMeteo, "geocoding", &url).await?)?;
        debug!(query = text, name = %place.name, lat = place.latitude, lon = place.longitude, "Geocoded query");
        Ok((place.latitude, place.longitude, place.name, vendor_country(place.country_code).or(country)))
    }
}

#[async_trait]
impl WeatherProvider for OpenMeteoProvider {
    fn id(&self) -> ProviderId {
        ProviderId::OpenMeteo
    }

    async fn fetch(&self, req: &ProviderRequest) -> Result<CanonicalWeatherRecord, ProviderError> {
        let (lat, lon, name, country) = self.resolve(req).await?;
        let days = if req.wants_extended() { 16 } else { 7 };

        let url = format!(
            "{FORECAST_URL}?\
             latitude={lat}&longitude={lon}\
             &current=temperature_2m,relative_humidity_2m,apparent_temperature,pressure_msl,wind_speed_10m,wind_direction_10m,weather_code\
             &hourly=temperature_2m,weather_code,precipitation_probability,visibility\
             &daily=weather_code,temperature_2m_max,temperature_2m_min,sunrise,sunset,uv_index_max\
             &wind_speed_unit=ms&forecast_days={days}&timezone=auto"
        );
        let payload = get_json(&self.http, ProviderId::OpenMeteo, "forecast", &url).await?;
        normalize(payload, name, country, days)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
