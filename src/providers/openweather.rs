//! OpenWeatherMap adapter.
//!
//! General-purpose provider with the largest free quota. Current conditions
//! and the 5 day / 3 hour forecast are fetched by coordinates when we have
//! them, by city name otherwise.
//!
//! API: `https://api.openweathermap.org/data/2.5/`
//! Auth: `appid` query parameter.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

use super::{build_client, decode, get_json, vendor_country, ProviderRequest, WeatherProvider};
use crate::location::DOMESTIC_COUNTRY;
use crate::error::ProviderError;
use crate::types::{
    CanonicalWeatherRecord, Condition, CurrentConditions, DailyForecast, Freshness, HourlyPoint, Location,
    ProviderId,
};

const BASE_URL: &str = "https://api.openweathermap.org/data/2.5";
const HOURLY_POINTS: usize = 8;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CurrentResponse {
    coord: Coord,
    weather: Vec<WeatherCode>,
    main: MainBlock,
    #[serde(default)]
    visibility: Option<f64>,
    wind: Wind,
    dt: i64,
    sys: Sys,
    #[serde(default)]
    timezone: i64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct Coord {
    lat: f64,
    lon: f64,
}

#[derive(Debug, Deserialize)]
struct WeatherCode {
    id: i64,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct MainBlock {
    temp: f64,
    feels_like: f64,
    humidity: f64,
    #[serde(default)]
    pressure: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Wind {
    speed: f64,
    #[serde(default)]
    deg: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Sys {
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    sunrise: Option<i64>,
    #[serde(default)]
    sunset: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    list: Vec<ForecastEntry>,
    #[serde(default)]
    city: Option<City>,
}

#[derive(Debug, Deserialize)]
struct City {
    #[serde(default)]
    timezone: i64,
}

#[derive(Debug, Deserialize)]
struct ForecastEntry {
    dt: i64,
    main: ForecastMain,
    weather: Vec<WeatherCode>,
    #[serde(default)]
    pop: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ForecastMain {
    temp: f64,
    temp_min: f64,
    temp_max: f64,
}

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

/// Map a weather condition id by family.
pub(crate) fn map_condition(id: i64) -> Condition {
    match id {
        200..=299 => Condition::Thunderstorm,
        300..=399 => Condition::Drizzle,
        500..=599 => Condition::Rain,
        600..=699 => Condition::Snow,
        700..=799 => Condition::Mist,
        800 => Condition::Clear,
        801..=899 => Condition::Clouds,
        _ => Condition::Other,
    }
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

/// Fold the 3-hourly list into per-day min/max in the city's local time.
/// The day's condition is taken from the entry closest to local noon.
fn fold_daily(list: &[ForecastEntry], offset_secs: i64, days: usize) -> Vec<DailyForecast> {
    let mut by_day: BTreeMap<NaiveDate, Vec<(u32, &ForecastEntry)>> = BTreeMap::new();
    for entry in list {
        let Some(local) = timestamp(entry.dt + offset_secs) else {
            continue;
        };
        by_day.entry(local.date_naive()).or_default().push((local.hour(), entry));
    }

    by_day
        .into_iter()
        .filter_map(|(date, entries)| {
            let min = entries.iter().map(|(_, e)| e.main.temp_min).reduce(f64::min)?;
            let max = entries.iter().map(|(_, e)| e.main.temp_max).reduce(f64::max)?;
            let (_, noon) = entries.iter().min_by_key(|(hour, _)| hour.abs_diff(12))?;
            let code = noon.weather.first();
            Some(DailyForecast {
                date,
                min,
                max,
                condition: code.map(|c| map_condition(c.id)).unwrap_or(Condition::Other),
                description: code.map(|c| c.description.clone()).unwrap_or_default(),
            })
        })
        .take(days)
        .collect()
}

/// Build the canonical record from the two payloads.
pub(crate) fn normalize(current: Value, forecast: Value, days: usize) -> Result<CanonicalWeatherRecord, ProviderError> {
    let cur: CurrentResponse = decode(ProviderId::OpenWeather, "current", current)?;
    let fc: ForecastResponse = decode(ProviderId::OpenWeather, "forecast", forecast)?;

    let code = cur
        .weather
        .first()
        .ok_or_else(|| ProviderError::parse(ProviderId::OpenWeather, "current: empty weather array"))?;
    let offset = fc.city.as_ref().map(|c| c.timezone).unwrap_or(cur.timezone);

    let hourly: Vec<HourlyPoint> = fc
        .list
        .iter()
        .take(HOURLY_POINTS)
        .filter_map(|e| {
            Some(HourlyPoint {
                time: timestamp(e.dt)?,
                temperature: e.main.temp,
                condition: e.weather.first().map(|c| map_condition(c.id)).unwrap_or(Condition::Other),
                precipitation_chance: e.pop.map(|p| p * 100.0),
            })
        })
        .collect();

    Ok(CanonicalWeatherRecord {
        location: Location {
            name: cur.name,
            country: vendor_country(cur.sys.country),
            lat: cur.coord.lat,
            lon: cur.coord.lon,
        },
        current: CurrentConditions {
            temperature: cur.main.temp,
            feels_like: cur.main.feels_like,
            humidity: cur.main.humidity,
            pressure: cur.main.pressure,
            visibility: cur.visibility.map(|m| m / 1000.0),
            uv_index: None,
            wind_speed: cur.wind.speed,
            wind_direction: cur.wind.deg,
            condition: map_condition(code.id),
            description: code.description.clone(),
        },
        forecast: fold_daily(&fc.list, offset, days),
        hourly: if hourly.is_empty() { None } else { Some(hourly) },
        sunrise: cur.sys.sunrise.and_then(timestamp),
        sunset: cur.sys.sunset.and_then(timestamp),
        source: ProviderId::OpenWeather,
        freshness: Freshness::Fresh,
        observed_at: timestamp(cur.dt).unwrap_or_else(Utc::now),
        cached_at: None,
    })
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

pub struct OpenWeatherProvider {
    http: Client,
    api_key: SecretString,
}

impl OpenWeatherProvider {
    pub fn new(api_key: SecretString, timeout: std::time::Duration) -> anyhow::Result<Self> {
        Ok(Self { http: build_client(ProviderId::OpenWeather, timeout)?, api_key })
    }

    fn location_params(req: &ProviderRequest) -> Result<String, ProviderError> {
        if let Some(c) = req.location.coordinates() {
            return Ok(format!("lat={}&lon={}", c.lat, c.lon));
        }
        match req.location.text() {
            Some(text) if !text.trim().is_empty() => Ok(format!("q={}", urlencoding::encode(text.trim()))),
            _ => Err(ProviderError::not_found(ProviderId::OpenWeather, "query has neither coordinates nor text")),
        }
    }
}

#[async_trait]
impl WeatherProvider for OpenWeatherProvider {
    fn id(&self) -> ProviderId {
        ProviderId::OpenWeather
    }

    async fn fetch(&self, req: &ProviderRequest) -> Result<CanonicalWeatherRecord, ProviderError> {
        let params = Self::location_params(req)?;
        let key = self.api_key.expose_secret();
        let current_url = format!("{BASE_URL}/weather?{params}&appid={key}&units=metric");
        let forecast_url = format!("{BASE_URL}/forecast?{params}&appid={key}&units=metric");

        let (current, forecast) = futures::try_join!(
            get_json(&self.http, ProviderId::OpenWeather, "weather", &current_url),
            get_json(&self.http, ProviderId::OpenWeather, "forecast", &forecast_url),
        )?;
        // The free forecast endpoint covers five days either way.
        let mut record = normalize(current, forecast, 5)?;
        if record.location.country.is_none() && req.location.is_domestic() {
            record.location.country = Some(DOMESTIC_COUNTRY.to_string());
        }
        Ok(record)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
