//! Mock weather provider for integration testing.
//!
//! A deterministic `WeatherProvider` that returns a canned record, counts
//! its invocations and can be switched to failing or slow at runtime. All
//! state is in-memory with no network access.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nimbus::error::{ProviderError, ProviderErrorKind};
use nimbus::providers::{ProviderRequest, WeatherProvider};
use nimbus::service::RegisteredProvider;
use nimbus::types::*;

pub struct MockProvider {
    id: ProviderId,
    temperature: f64,
    calls: AtomicUsize,
    /// If set, every fetch fails with this kind.
    force_error: Mutex<Option<ProviderErrorKind>>,
    delay: Mutex<Option<Duration>>,
}

impl MockProvider {
    pub fn new(id: ProviderId) -> Arc<Self> {
        Self::with_temperature(id, 20.0)
    }

    pub fn with_temperature(id: ProviderId, temperature: f64) -> Arc<Self> {
        Arc::new(Self {
            id,
            temperature,
            calls: AtomicUsize::new(0),
            force_error: Mutex::new(None),
            delay: Mutex::new(None),
        })
    }

    pub fn failing(id: ProviderId) -> Arc<Self> {
        let mock = Self::new(id);
        mock.set_error(ProviderErrorKind::Network);
        mock
    }

    /// Force all subsequent fetches to fail.
    pub fn set_error(&self, kind: ProviderErrorKind) {
        *self.force_error.lock().unwrap() = Some(kind);
    }

    pub fn clear_error(&self) {
        *self.force_error.lock().unwrap() = None;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Register under the given priority and daily quota.
    pub fn register(self: &Arc<Self>, priority: u32, daily_quota: u32) -> RegisteredProvider {
        RegisteredProvider::new(ProviderDescriptor::new(self.id, priority, daily_quota, true), self.clone())
    }

    fn record(&self, req: &ProviderRequest) -> CanonicalWeatherRecord {
        let (lat, lon) = req.location.coordinates().map(|c| (c.lat, c.lon)).unwrap_or((51.5, -0.12));
        CanonicalWeatherRecord {
            location: Location {
                name: req.location.display_name(),
                country: Some(if req.location.is_domestic() { "KR".into() } else { "GB".into() }),
                lat,
                lon,
            },
            current: CurrentConditions {
                temperature: self.temperature,
                feels_like: self.temperature,
                humidity: 60.0,
                pressure: Some(1012.0),
                visibility: Some(10.0),
                uv_index: None,
                wind_speed: 2.5,
                wind_direction: Some(180.0),
                condition: Condition::Clouds,
                description: "overcast".into(),
            },
            forecast: vec![DailyForecast {
                date: NaiveDate::from_ymd_opt(2026, 10, 16).unwrap(),
                min: self.temperature - 4.0,
                max: self.temperature + 3.0,
                condition: Condition::Clouds,
                description: "overcast".into(),
            }],
            hourly: None,
            sunrise: None,
            sunset: None,
            source: self.id,
            freshness: Freshness::Fresh,
            observed_at: Utc::now(),
            cached_at: None,
        }
    }
}

#[async_trait]
impl WeatherProvider for MockProvider {
    fn id(&self) -> ProviderId {
        self.id
    }

    async fn fetch(&self, req: &ProviderRequest) -> Result<CanonicalWeatherRecord, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let forced = *self.force_error.lock().unwrap();
        match forced {
            Some(kind) => Err(ProviderError::new(self.id, kind, "forced failure")),
            None => Ok(self.record(req)),
        }
    }
}
