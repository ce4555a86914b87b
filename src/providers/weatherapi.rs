//! WeatherAPI.com adapter.
//!
//! Specialist for UV index and historical queries. One `forecast.json` call
//! returns current conditions, daily and hourly forecast and astronomy.
//! Historical requests go to `history.json` for the previous day and carry
//! that day's aggregates as the "current" block.
//!
//! API: `https://api.weatherapi.com/v1/forecast.json`, `/v1/history.json`
//! Auth: `key` query parameter.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;

use super::{build_client, decode, get_json, kmh_to_ms, local_to_utc, vendor_country, ProviderRequest, WeatherProvider};
use crate::error::ProviderError;
use crate::types::{
    CanonicalWeatherRecord, Condition, CurrentConditions, DailyForecast, Freshness, HourlyPoint, Location,
    ProviderId, RequestKind,
};

const BASE_URL: &str = "https://api.weatherapi.com/v1";
const HOURLY_POINTS: usize = 8;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    location: ApiLocation,
    current: ApiCurrent,
    #[serde(default)]
    forecast: Option<ApiForecast>,
}

#[derive(Debug, Deserialize)]
struct ApiLocation {
    name: String,
    #[serde(default)]
    country: String,
    lat: f64,
    lon: f64,
    #[serde(default)]
    localtime_epoch: Option<i64>,
    #[serde(default)]
    localtime: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiCondition {
    #[serde(default)]
    text: String,
    code: i64,
}

#[derive(Debug, Deserialize)]
struct ApiCurrent {
    #[serde(default)]
    last_updated_epoch: Option<i64>,
    temp_c: f64,
    feelslike_c: f64,
    humidity: f64,
    #[serde(default)]
    pressure_mb: Option<f64>,
    #[serde(default)]
    vis_km: Option<f64>,
    #[serde(default)]
    uv: Option<f64>,
    wind_kph: f64,
    #[serde(default)]
    wind_degree: Option<f64>,
    condition: ApiCondition,
}

#[derive(Debug, Deserialize)]
struct ApiForecast {
    #[serde(default)]
    forecastday: Vec<ApiForecastDay>,
}

#[derive(Debug, Deserialize)]
struct ApiForecastDay {
    date: NaiveDate,
    day: ApiDay,
    #[serde(default)]
    astro: Option<ApiAstro>,
    #[serde(default)]
    hour: Vec<ApiHour>,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    location: ApiLocation,
    forecast: ApiForecast,
}

#[derive(Debug, Deserialize)]
struct ApiDay {
    maxtemp_c: f64,
    mintemp_c: f64,
    #[serde(default)]
    avgtemp_c: Option<f64>,
    #[serde(default)]
    avghumidity: Option<f64>,
    #[serde(default)]
    maxwind_kph: Option<f64>,
    #[serde(default)]
    avgvis_km: Option<f64>,
    #[serde(default)]
    uv: Option<f64>,
    condition: ApiCondition,
}

#[derive(Debug, Deserialize)]
struct ApiAstro {
    #[serde(default)]
    sunrise: Option<String>,
    #[serde(default)]
    sunset: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiHour {
    time_epoch: i64,
    temp_c: f64,
    #[serde(default)]
    chance_of_rain: Option<f64>,
    condition: ApiCondition,
}

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

/// Map WeatherAPI's numeric condition codes.
pub(crate) fn map_condition(code: i64) -> Condition {
    match code {
        1000 => Condition::Clear,
        1003 | 1006 | 1009 => Condition::Clouds,
        1030 | 1135 | 1147 => Condition::Mist,
        1072 | 1150 | 1153 | 1168 | 1171 => Condition::Drizzle,
        1063 | 1180..=1201 | 1240..=1246 => Condition::Rain,
        1066 | 1069 | 1114 | 1117 | 1204..=1237 | 1249..=1264 => Condition::Snow,
        1087 | 1273..=1282 => Condition::Thunderstorm,
        _ => Condition::Other,
    }
}

/// Offset of the location's clock from UTC, from `localtime` (minute
/// precision) versus `localtime_epoch`, rounded to the quarter hour.
fn local_offset_secs(loc: &ApiLocation) -> Option<i64> {
    let epoch = loc.localtime_epoch?;
    let local = NaiveDateTime::parse_from_str(loc.localtime.as_deref()?, "%Y-%m-%d %H:%M").ok()?;
    let raw = local.and_utc().timestamp() - epoch;
    Some((raw as f64 / 900.0).round() as i64 * 900)
}

/// "06:42 AM" on `date` in local time → UTC.
fn astro_time(date: NaiveDate, text: Option<&str>, offset_secs: i64) -> Option<DateTime<Utc>> {
    let time = NaiveTime::parse_from_str(text?.trim(), "%I:%M %p").ok()?;
    Some(local_to_utc(date.and_time(time), offset_secs))
}

pub(crate) fn normalize(payload: Value, days: usize) -> Result<CanonicalWeatherRecord, ProviderError> {
    let resp: ForecastResponse = decode(ProviderId::WeatherApi, "forecast", payload)?;
    let offset = local_offset_secs(&resp.location).unwrap_or(0);
    let forecast_days = resp.forecast.map(|f| f.forecastday).unwrap_or_default();

    let now_epoch = resp.current.last_updated_epoch.or(resp.location.localtime_epoch);
    let hourly: Vec<HourlyPoint> = forecast_days
        .iter()
        .flat_map(|d| d.hour.iter())
        .filter(|h| now_epoch.map_or(true, |now| h.time_epoch + 3600 > now))
        .take(HOURLY_POINTS)
        .filter_map(|h| {
            Some(HourlyPoint {
                time: DateTime::from_timestamp(h.time_epoch, 0)?,
                temperature: h.temp_c,
                condition: map_condition(h.condition.code),
                precipitation_chance: h.chance_of_rain,
            })
        })
        .collect();

    let (sunrise, sunset) = forecast_days
        .first()
        .and_then(|d| d.astro.as_ref().map(|a| (d.date, a)))
        .map(|(date, a)| {
            (
                astro_time(date, a.sunrise.as_deref(), offset),
                astro_time(date, a.sunset.as_deref(), offset),
            )
        })
        .unwrap_or((None, None));

    let forecast: Vec<DailyForecast> = forecast_days
        .iter()
        .take(days)
        .map(|d| DailyForecast {
            date: d.date,
            min: d.day.mintemp_c,
            max: d.day.maxtemp_c,
            condition: map_condition(d.day.condition.code),
            description: d.day.condition.text.clone(),
        })
        .collect();

    let cur = resp.current;
    Ok(CanonicalWeatherRecord {
        location: Location {
            name: resp.location.name,
            country: vendor_country(Some(resp.location.country)),
            lat: resp.location.lat,
            lon: resp.location.lon,
        },
        current: CurrentConditions {
            temperature: cur.temp_c,
            feels_like: cur.feelslike_c,
            humidity: cur.humidity,
            pressure: cur.pressure_mb,
            visibility: cur.vis_km,
            uv_index: cur.uv,
            wind_speed: kmh_to_ms(cur.wind_kph),
            wind_direction: cur.wind_degree,
            condition: map_condition(cur.condition.code),
            description: cur.condition.text,
        },
        forecast,
        hourly: if hourly.is_empty() { None } else { Some(hourly) },
        sunrise,
        sunset,
        source: ProviderId::WeatherApi,
        freshness: Freshness::Fresh,
        observed_at: cur.last_updated_epoch.and_then(|e| DateTime::from_timestamp(e, 0)).unwrap_or_else(Utc::now),
        cached_at: None,
    })
}

/// The day a historical request asks for: yesterday, UTC.
pub(crate) fn history_date(now: DateTime<Utc>) -> NaiveDate {
    (now - Duration::days(1)).date_naive()
}

/// Canonical record for one past day. Day aggregates stand in for the
/// current block; temperature and humidity averages are required.
pub(crate) fn normalize_history(payload: Value) -> Result<CanonicalWeatherRecord, ProviderError> {
    let resp: HistoryResponse = decode(ProviderId::WeatherApi, "history", payload)?;
    let offset = local_offset_secs(&resp.location).unwrap_or(0);
    let day = resp
        .forecast
        .forecastday
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::not_found(ProviderId::WeatherApi, "history returned no day"))?;

    let missing = |field: &str| ProviderError::parse(ProviderId::WeatherApi, format!("history: missing day.{field}"));
    let temperature = day.day.avgtemp_c.ok_or_else(|| missing("avgtemp_c"))?;
    let humidity = day.day.avghumidity.ok_or_else(|| missing("avghumidity"))?;

    let noon = day.date.and_hms_opt(12, 0, 0).map(|t| local_to_utc(t, offset));
    let hourly: Vec<HourlyPoint> = day
        .hour
        .iter()
        .filter_map(|h| {
            Some(HourlyPoint {
                time: DateTime::from_timestamp(h.time_epoch, 0)?,
                temperature: h.temp_c,
                condition: map_condition(h.condition.code),
                precipitation_chance: h.chance_of_rain,
            })
        })
        .collect();
    let (sunrise, sunset) = day
        .astro
        .as_ref()
        .map(|a| (astro_time(day.date, a.sunrise.as_deref(), offset), astro_time(day.date, a.sunset.as_deref(), offset)))
        .unwrap_or((None, None));

    let condition = map_condition(day.day.condition.code);
    Ok(CanonicalWeatherRecord {
        location: Location {
            name: resp.location.name,
            country: vendor_country(Some(resp.location.country)),
            lat: resp.location.lat,
            lon: resp.location.lon,
        },
        current: CurrentConditions {
            temperature,
            feels_like: temperature,
            humidity,
            pressure: None,
            visibility: day.day.avgvis_km,
            uv_index: day.day.uv,
            wind_speed: day.day.maxwind_kph.map(kmh_to_ms).unwrap_or(0.0),
            wind_direction: None,
            condition,
            description: day.day.condition.text.clone(),
        },
        forecast: vec![DailyForecast {
            date: day.date,
            min: day.day.mintemp_c,
            max: day.day.maxtemp_c,
            condition,
            description: day.day.condition.text,
        }],
        hourly: if hourly.is_empty() { None } else { Some(hourly) },
        sunrise,
        sunset,
        source: ProviderId::WeatherApi,
        freshness: Freshness::Fresh,
        observed_at: noon.unwrap_or_else(Utc::now),
        cached_at: None,
    })
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

pub struct WeatherApiProvider {
    http: Client,
    api_key: SecretString,
}

impl WeatherApiProvider {
    pub fn new(api_key: SecretString, timeout: std::time::Duration) -> anyhow::Result<Self> {
        Ok(Self { http: build_client(ProviderId::WeatherApi, timeout)?, api_key })
    }

    fn query_param(req: &ProviderRequest) -> Result<String, ProviderError> {
        if let Some(c) = req.location.coordinates() {
            return Ok(format!("{},{}", c.lat, c.lon));
        }
        req.location
            .text()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| urlencoding::encode(t).into_owned())
            .ok_or_else(|| ProviderError::not_found(ProviderId::WeatherApi, "query has neither coordinates nor text"))
    }
}

#[async_trait]
impl WeatherProvider for WeatherApiProvider {
    fn id(&self) -> ProviderId {
        ProviderId::WeatherApi
    }

    async fn fetch(&self, req: &ProviderRequest) -> Result<CanonicalWeatherRecord, ProviderError> {
        let q = Self::query_param(req)?;
        if req.kind == RequestKind::Historical {
            let url = format!(
                "{BASE_URL}/history.json?key={key}&q={q}&dt={dt}",
                key = self.api_key.expose_secret(),
                dt = history_date(Utc::now()).format("%Y-%m-%d"),
            );
            let payload = get_json(&self.http, ProviderId::WeatherApi, "history.json", &url).await?;
            return normalize_history(payload);
        }
        let days = if req.wants_extended() { 7 } else { 3 };
        let url = format!(
            "{BASE_URL}/forecast.json?key={key}&q={q}&days={days}&aqi=no&alerts=no",
            key = self.api_key.expose_secret(),
        );
        let payload = get_json(&self.http, ProviderId::WeatherApi, "forecast.json", &url).await?;
        normalize(payload, days)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
