//! API route handlers.
//!
//! All endpoints return JSON. State is the shared `WeatherService`.

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::WeatherError;
use crate::monitoring::HealthReport;
use crate::radar::RadarResult;
use crate::service::{VerifiedWeather, WeatherService};
use crate::types::{CallerTier, CanonicalWeatherRecord, ProviderId, RequestKind, WeatherQuery};

pub type AppState = WeatherService;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// `?location=` or `?lat=&lon=`, plus optional `kind` and `tier`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WeatherParams {
    pub location: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub kind: Option<RequestKind>,
    pub tier: Option<CallerTier>,
}

impl WeatherParams {
    pub fn into_query(self) -> Result<(WeatherQuery, RequestKind, CallerTier), ApiError> {
        let query = match (self.location, self.lat, self.lon) {
            (Some(text), None, None) if !text.trim().is_empty() => WeatherQuery::text(text),
            (None, Some(lat), Some(lon)) => {
                if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                    return Err(ApiError::BadQuery(format!("coordinates out of range: {lat},{lon}")));
                }
                WeatherQuery::coords(lat, lon)
            }
            _ => return Err(ApiError::BadQuery("provide either location or both lat and lon".into())),
        };
        Ok((query, self.kind.unwrap_or(RequestKind::Current), self.tier.unwrap_or_default()))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RadarParams {
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ApiError {
    BadQuery(String),
    RadarDisabled,
    Weather(WeatherError),
}

impl From<WeatherError> for ApiError {
    fn from(e: WeatherError) -> Self {
        ApiError::Weather(e)
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        ApiError::BadQuery(e.body_text())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadQuery(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::RadarDisabled => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Weather(e) => match e {
                WeatherError::UnresolvedLocation(_) => StatusCode::UNPROCESSABLE_ENTITY,
                WeatherError::AllProvidersExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
                WeatherError::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
                WeatherError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn body(&self) -> ErrorBody {
        match self {
            ApiError::BadQuery(msg) => ErrorBody { error: "bad_query".into(), message: msg.clone() },
            ApiError::RadarDisabled => {
                ErrorBody { error: "radar_disabled".into(), message: "Radar lookups are not configured".into() }
            }
            ApiError::Weather(e) => ErrorBody { error: e.code().into(), message: e.to_string() },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /api/weather
pub async fn get_weather(
    State(state): State<AppState>,
    params: Result<Query<WeatherParams>, QueryRejection>,
) -> Result<Json<CanonicalWeatherRecord>, ApiError> {
    let Query(params) = params?;
    let (query, kind, tier) = params.into_query()?;
    let record = state.get_weather(&query, kind, tier).await?;
    Ok(Json(record))
}

/// GET /api/weather/verified
pub async fn get_verified_weather(
    State(state): State<AppState>,
    params: Result<Query<WeatherParams>, QueryRejection>,
) -> Result<Json<VerifiedWeather>, ApiError> {
    let Query(params) = params?;
    let (query, kind, tier) = params.into_query()?;
    let verified = state.get_verified_weather(&query, kind, tier).await?;
    Ok(Json(verified))
}

/// GET /api/radar
pub async fn get_radar(
    State(state): State<AppState>,
    params: Result<Query<RadarParams>, QueryRejection>,
) -> Result<Json<RadarResult>, ApiError> {
    let Query(params) = params?;
    let radar = state.radar().ok_or(ApiError::RadarDisabled)?;
    Ok(Json(radar.get_radar(params.timestamp).await))
}

/// GET /api/health
pub async fn get_health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.health())
}

/// GET /api/recommendations
pub async fn get_recommendations(State(state): State<AppState>) -> Json<BTreeMap<ProviderId, String>> {
    Json(state.recommendations())
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_params_text_query() {
        let p = WeatherParams { location: Some("Seoul".into()), ..Default::default() };
        let (q, kind, tier) = p.into_query().unwrap();
        assert_eq!(q, WeatherQuery::text("Seoul"));
        assert_eq!(kind, RequestKind::Current);
        assert_eq!(tier, CallerTier::Free);
    }

    #[test]
    fn test_params_coordinates() {
        let p = WeatherParams { lat: Some(37.5), lon: Some(127.0), kind: Some(RequestKind::UvIndex), ..Default::default() };
        let (q, kind, _) = p.into_query().unwrap();
        assert_eq!(q, WeatherQuery::coords(37.5, 127.0));
        assert_eq!(kind, RequestKind::UvIndex);
    }

    #[test]
    fn test_params_reject_ambiguous_or_partial() {
        let both = WeatherParams { location: Some("Seoul".into()), lat: Some(1.0), lon: Some(2.0), ..Default::default() };
        assert!(both.into_query().is_err());
        let half = WeatherParams { lat: Some(1.0), ..Default::default() };
        assert!(half.into_query().is_err());
        let blank = WeatherParams { location: Some("  ".into()), ..Default::default() };
        assert!(blank.into_query().is_err());
        let out_of_range = WeatherParams { lat: Some(91.0), lon: Some(0.0), ..Default::default() };
        assert!(out_of_range.into_query().is_err());
    }

    #[test]
    fn test_error_status_mapping() {
        let deadline = ApiError::from(WeatherError::DeadlineExceeded {
            query: "current:seoul".into(),
            deadline: Duration::from_secs(1),
        });
        assert_eq!(deadline.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(deadline.body().error, "deadline_exceeded");

        let internal = ApiError::from(WeatherError::Internal("boom".into()));
        assert_eq!(internal.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_error_body_serializes() {
        let body = ApiError::BadQuery("missing".into()).body();
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("bad_query"));
        assert!(json.contains("missing"));
    }
}
