//! Weather provider adapters.
//!
//! Defines the `WeatherProvider` trait and one implementation per vendor.
//! Every adapter turns a [`ProviderRequest`] into exactly one
//! [`CanonicalWeatherRecord`] stamped with its own id, or a typed
//! [`ProviderError`]; vendor payloads never leave this module.

pub mod accuweather;
pub mod kma;
pub mod open_meteo;
pub mod openweather;
pub mod weatherapi;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::ProviderError;
use crate::location::Classification;
use crate::types::{CanonicalWeatherRecord, ProviderId, RequestKind, WeatherQuery};

/// Everything an adapter needs to answer one query.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRequest {
    pub query: WeatherQuery,
    pub location: Classification,
    pub kind: RequestKind,
}

impl ProviderRequest {
    pub fn new(query: WeatherQuery, location: Classification, kind: RequestKind) -> Self {
        Self { query, location, kind }
    }

    /// Whether the caller asked for the long-range forecast.
    pub fn wants_extended(&self) -> bool {
        self.kind == RequestKind::ExtendedForecast
    }
}

/// Abstraction over external weather vendors.
#[async_trait]
pub trait WeatherProvider: Send + Sync {
    /// The provider this adapter speaks for. Records it returns must carry
    /// the same id as their `source`.
    fn id(&self) -> ProviderId;

    /// Fetch and normalise weather for one request.
    async fn fetch(&self, req: &ProviderRequest) -> Result<CanonicalWeatherRecord, ProviderError>;
}

// ---------------------------------------------------------------------------
// Shared HTTP helpers
// ---------------------------------------------------------------------------

/// Build the HTTP client an adapter owns.
pub(crate) fn build_client(provider: ProviderId, timeout: std::time::Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent("NIMBUS/0.1.0")
        .build()
        .with_context(|| format!("Failed to build {provider} HTTP client"))
}

/// GET a JSON document, classifying transport and status failures.
///
/// `endpoint` is only used for logging; URLs carry API keys and are never
/// logged.
pub(crate) async fn get_json(
    http: &Client,
    provider: ProviderId,
    endpoint: &str,
    url: &str,
) -> Result<Value, ProviderError> {
    let resp = http
        .get(url)
        .send()
        .await
        .map_err(|e| ProviderError::from_reqwest(provider, e))?;

    let status = resp.status();
    if !status.is_success() {
        debug!(provider = %provider, endpoint, %status, "Provider returned error status");
        return Err(ProviderError::from_status(provider, status));
    }

    resp.json::<Value>()
        .await
        .map_err(|e| ProviderError::parse(provider, format!("{endpoint}: {}", e.without_url())))
}

/// Deserialize a vendor payload; missing required fields become parse
/// failures.
pub(crate) fn decode<T: DeserializeOwned>(provider: ProviderId, what: &str, value: Value) -> Result<T, ProviderError> {
    serde_json::from_value(value).map_err(|e| ProviderError::parse(provider, format!("{what}: {e}")))
}

/// Interpret a vendor-local wall-clock time as UTC given the vendor's
/// offset in seconds east of UTC.
pub(crate) fn local_to_utc(naive: NaiveDateTime, offset_secs: i64) -> DateTime<Utc> {
    Utc.from_utc_datetime(&(naive - Duration::seconds(offset_secs)))
}

/// A vendor country field, with blanks treated as missing.
pub(crate) fn vendor_country(raw: Option<String>) -> Option<String> {
    raw.map(|c| c.trim().to_string()).filter(|c| !c.is_empty())
}

/// Convert km/h to m/s.
pub(crate) fn kmh_to_ms(kmh: f64) -> f64 {
    kmh / 3.6
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
