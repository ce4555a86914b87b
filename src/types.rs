//! Shared types for the NIMBUS aggregator.
//!
//! These types form the data model used across all modules. Every provider
//! adapter emits exactly one shape, [`CanonicalWeatherRecord`], so the cache,
//! orchestrator and verification engine never see vendor payloads.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// Identifier of an external weather data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProviderId {
    /// Korea Meteorological Administration (domestic specialist).
    #[serde(rename = "kma")]
    Kma,
    /// OpenWeatherMap (general purpose, high quota).
    #[serde(rename = "openweather")]
    OpenWeather,
    /// WeatherAPI.com (UV / historical specialist).
    #[serde(rename = "weatherapi")]
    WeatherApi,
    /// AccuWeather (premium long-range forecasts, tiny free quota).
    #[serde(rename = "accuweather")]
    AccuWeather,
    /// Open-Meteo (keyless, coordinate based).
    #[serde(rename = "open_meteo")]
    OpenMeteo,
}

impl ProviderId {
    /// All known providers (useful for iteration).
    pub const ALL: &'static [ProviderId] = &[
        ProviderId::Kma,
        ProviderId::OpenWeather,
        ProviderId::WeatherApi,
        ProviderId::AccuWeather,
        ProviderId::OpenMeteo,
    ];

    /// Stable lower-case name used in config, logs and JSON.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Kma => "kma",
            ProviderId::OpenWeather => "openweather",
            ProviderId::WeatherApi => "weatherapi",
            ProviderId::AccuWeather => "accuweather",
            ProviderId::OpenMeteo => "open_meteo",
        }
    }

    /// Fixed reliability ranking used when two sources disagree.
    /// Higher is more trusted.
    pub fn reliability(&self) -> u8 {
        match self {
            ProviderId::Kma => 5,
            ProviderId::AccuWeather => 4,
            ProviderId::OpenWeather => 3,
            ProviderId::WeatherApi => 2,
            ProviderId::OpenMeteo => 1,
        }
    }

    /// Whether the vendor needs no API key.
    pub fn is_keyless(&self) -> bool {
        matches!(self, ProviderId::OpenMeteo)
    }
}

/// Reliability of a provider given by name; unknown names rank lowest.
pub fn reliability_for_name(name: &str) -> u8 {
    name.parse::<ProviderId>().map(|p| p.reliability()).unwrap_or(0)
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "kma" => Ok(ProviderId::Kma),
            "openweather" | "openweathermap" | "owm" => Ok(ProviderId::OpenWeather),
            "weatherapi" | "weather_api" => Ok(ProviderId::WeatherApi),
            "accuweather" => Ok(ProviderId::AccuWeather),
            "open_meteo" | "openmeteo" | "open-meteo" => Ok(ProviderId::OpenMeteo),
            _ => Err(anyhow::anyhow!("Unknown provider: {s}")),
        }
    }
}

/// Static description of a configured provider.
///
/// Built once at start-up from configuration and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderDescriptor {
    pub id: ProviderId,
    /// Lower ranks are tried earlier in the default ordering.
    pub priority: u32,
    pub daily_quota: u32,
    pub has_credential: bool,
}

impl ProviderDescriptor {
    pub fn new(id: ProviderId, priority: u32, daily_quota: u32, has_credential: bool) -> Self {
        Self { id, priority, daily_quota, has_credential }
    }

    /// A provider without a credential is never eligible for routing.
    pub fn is_eligible(&self) -> bool {
        self.has_credential
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// A latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Great-circle distance in kilometres.
    pub fn distance_km(&self, other: &Coordinates) -> f64 {
        const EARTH_RADIUS_KM: f64 = 6371.0;
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (other.lon - self.lon).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2},{:.2}", self.lat, self.lon)
    }
}

/// What a caller asked about: a free-text place or a coordinate pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeatherQuery {
    Text(String),
    Coordinates(Coordinates),
}

impl WeatherQuery {
    pub fn text(s: impl Into<String>) -> Self {
        WeatherQuery::Text(s.into())
    }

    pub fn coords(lat: f64, lon: f64) -> Self {
        WeatherQuery::Coordinates(Coordinates::new(lat, lon))
    }

    /// Normalised form used in cache keys: coordinates rounded to two
    /// decimals (~1 km), text trimmed and lower-cased.
    pub fn normalized(&self) -> String {
        match self {
            WeatherQuery::Text(t) => t.trim().to_lowercase(),
            WeatherQuery::Coordinates(c) => c.to_string(),
        }
    }
}

impl fmt::Display for WeatherQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeatherQuery::Text(t) => write!(f, "{t}"),
            WeatherQuery::Coordinates(c) => write!(f, "{c}"),
        }
    }
}

/// The kind of data requested; drives routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Current,
    Forecast,
    AirQuality,
    Warning,
    UvIndex,
    Historical,
    ExtendedForecast,
}

impl RequestKind {
    pub const ALL: &'static [RequestKind] = &[
        RequestKind::Current,
        RequestKind::Forecast,
        RequestKind::AirQuality,
        RequestKind::Warning,
        RequestKind::UvIndex,
        RequestKind::Historical,
        RequestKind::ExtendedForecast,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Current => "current",
            RequestKind::Forecast => "forecast",
            RequestKind::AirQuality => "air_quality",
            RequestKind::Warning => "warning",
            RequestKind::UvIndex => "uv_index",
            RequestKind::Historical => "historical",
            RequestKind::ExtendedForecast => "extended_forecast",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RequestKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "current" | "now" => Ok(RequestKind::Current),
            "forecast" => Ok(RequestKind::Forecast),
            "air_quality" | "airquality" | "aqi" => Ok(RequestKind::AirQuality),
            "warning" | "warnings" | "alerts" => Ok(RequestKind::Warning),
            "uv_index" | "uv" => Ok(RequestKind::UvIndex),
            "historical" | "history" => Ok(RequestKind::Historical),
            "extended_forecast" | "extended" => Ok(RequestKind::ExtendedForecast),
            _ => Err(anyhow::anyhow!("Unknown request kind: {s}")),
        }
    }
}

/// Caller subscription tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallerTier {
    #[default]
    Free,
    Premium,
}

impl std::str::FromStr for CallerTier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "free" => Ok(CallerTier::Free),
            "premium" | "pro" => Ok(CallerTier::Premium),
            _ => Err(anyhow::anyhow!("Unknown caller tier: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Canonical record
// ---------------------------------------------------------------------------

/// Canonical condition vocabulary every vendor code maps into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Clear,
    Clouds,
    Rain,
    Snow,
    Thunderstorm,
    Drizzle,
    Mist,
    Other,
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Condition::Clear => "clear",
            Condition::Clouds => "clouds",
            Condition::Rain => "rain",
            Condition::Snow => "snow",
            Condition::Thunderstorm => "thunderstorm",
            Condition::Drizzle => "drizzle",
            Condition::Mist => "mist",
            Condition::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub name: String,
    /// ISO 3166 alpha-2 code where the vendor provides one, else the
    /// vendor's country name. Absent when nobody reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    pub lat: f64,
    pub lon: f64,
}

/// Current-conditions block. Units: °C, %, hPa, km, m/s, degrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentConditions {
    pub temperature: f64,
    pub feels_like: f64,
    pub humidity: f64,
    pub pressure: Option<f64>,
    pub visibility: Option<f64>,
    pub uv_index: Option<f64>,
    pub wind_speed: f64,
    pub wind_direction: Option<f64>,
    pub condition: Condition,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyForecast {
    pub date: NaiveDate,
    pub min: f64,
    pub max: f64,
    pub condition: Condition,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyPoint {
    pub time: DateTime<Utc>,
    pub temperature: f64,
    pub condition: Condition,
    pub precipitation_chance: Option<f64>,
}

/// Whether a record came from a live fetch or the emergency stale track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    #[default]
    Fresh,
    Stale,
}

/// The only shape any provider adapter may emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalWeatherRecord {
    pub location: Location,
    pub current: CurrentConditions,
    pub forecast: Vec<DailyForecast>,
    pub hourly: Option<Vec<HourlyPoint>>,
    pub sunrise: Option<DateTime<Utc>>,
    pub sunset: Option<DateTime<Utc>>,
    pub source: ProviderId,
    #[serde(default)]
    pub freshness: Freshness,
    pub observed_at: DateTime<Utc>,
    pub cached_at: Option<DateTime<Utc>>,
}

impl CanonicalWeatherRecord {
    pub fn is_stale(&self) -> bool {
        self.freshness == Freshness::Stale
    }

    /// A copy annotated as served from the stale track.
    pub fn into_stale(mut self) -> Self {
        self.freshness = Freshness::Stale;
        self
    }

    /// Provenance label, e.g. `"kma"` or `"kma (stale)"`.
    pub fn source_label(&self) -> String {
        match self.freshness {
            Freshness::Fresh => self.source.to_string(),
            Freshness::Stale => format!("{} (stale)", self.source),
        }
    }

    /// Helper to build a test/sample record with sensible defaults.
    #[cfg(test)]
    pub fn sample(source: ProviderId) -> Self {
        CanonicalWeatherRecord {
            location: Location {
                name: "Seoul".to_string(),
                country: Some("KR".to_string()),
                lat: 37.57,
                lon: 126.98,
            },
            current: CurrentConditions {
                temperature: 18.0,
                feels_like: 17.5,
                humidity: 55.0,
                pressure: Some(1013.0),
                visibility: Some(10.0),
                uv_index: Some(4.0),
                wind_speed: 3.2,
                wind_direction: Some(270.0),
                condition: Condition::Clear,
                description: "clear sky".to_string(),
            },
            forecast: vec![DailyForecast {
                date: NaiveDate::from_ymd_opt(2026, 10, 16).unwrap(),
                min: 12.0,
                max: 21.0,
                condition: Condition::Clouds,
                description: "partly cloudy".to_string(),
            }],
            hourly: None,
            sunrise: None,
            sunset: None,
            source,
            freshness: Freshness::Fresh,
            observed_at: Utc::now(),
            cached_at: None,
        }
    }
}

impl fmt::Display for CanonicalWeatherRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}, {}: {:.1}°C ({}), {:.0}% humidity",
            self.source_label(),
            self.location.name,
            self.location.country.as_deref().unwrap_or("??"),
            self.current.temperature,
            self.current.condition,
            self.current.humidity,
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_id_roundtrip_names() {
        for p in ProviderId::ALL {
            let parsed: ProviderId = p.as_str().parse().unwrap();
            assert_eq!(parsed, *p);
        }
    }

    #[test]
    fn test_provider_id_serde_name_matches_display() {
        let json = serde_json::to_string(&ProviderId::OpenMeteo).unwrap();
        assert_eq!(json, "\"open_meteo\"");
        assert_eq!(ProviderId::OpenMeteo.to_string(), "open_meteo");
    }

    #[test]
    fn test_reliability_unknown_name_is_lowest() {
        assert_eq!(reliability_for_name("some-new-vendor"), 0);
        assert_eq!(reliability_for_name("KMA"), 5);
        assert!(reliability_for_name("accuweather") > reliability_for_name("weatherapi"));
    }

    #[test]
    fn test_query_normalized_rounds_coordinates() {
        let q = WeatherQuery::coords(37.56651, 126.97801);
        assert_eq!(q.normalized(), "37.57,126.98");
    }

    #[test]
    fn test_query_normalized_lowercases_text() {
        let q = WeatherQuery::text("  New York ");
        assert_eq!(q.normalized(), "new york");
    }

    #[test]
    fn test_request_kind_parse() {
        assert_eq!("uv".parse::<RequestKind>().unwrap(), RequestKind::UvIndex);
        assert_eq!("extended-forecast".parse::<RequestKind>().unwrap(), RequestKind::ExtendedForecast);
        assert!("tides".parse::<RequestKind>().is_err());
    }

    #[test]
    fn test_caller_tier_default_free() {
        assert_eq!(CallerTier::default(), CallerTier::Free);
        assert_eq!("premium".parse::<CallerTier>().unwrap(), CallerTier::Premium);
    }

    #[test]
    fn test_distance_seoul_busan() {
        let seoul = Coordinates::new(37.5665, 126.9780);
        let busan = Coordinates::new(35.1796, 129.0756);
        let d = seoul.distance_km(&busan);
        assert!(d > 300.0 && d < 350.0, "got {d}");
    }

    #[test]
    fn test_stale_annotation() {
        let rec = CanonicalWeatherRecord::sample(ProviderId::Kma).into_stale();
        assert!(rec.is_stale());
        assert_eq!(rec.source_label(), "kma (stale)");
        assert_eq!(rec.source, ProviderId::Kma);
    }

    #[test]
    fn test_record_display() {
        let rec = CanonicalWeatherRecord::sample(ProviderId::OpenWeather);
        let s = format!("{rec}");
        assert!(s.contains("openweather"));
        assert!(s.contains("Seoul"));
        assert!(s.contains("18.0°C"));
    }
}
