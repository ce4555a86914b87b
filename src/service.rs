//! Fallback orchestrator.
//!
//! `WeatherService` owns every component and answers queries: cache first,
//! then the routed providers in order (quota-checked, each at most once),
//! then the stale track, then a typed failure. Concurrent requests for the
//! same key share one in-flight fetch. The fetch runs as its own task, so a
//! caller that gives up on its deadline does not cancel it; the result
//! still lands in the cache.

use anyhow::{Context, Result};
use chrono::{FixedOffset, Offset, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheStats, CacheStore};
use crate::config::AppConfig;
use crate::error::{ProviderError, WeatherError};
use crate::location::{Classification, LocationClassifier};
use crate::monitoring::{HealthReport, MonitoringService, MonitoringThresholds};
use crate::providers::accuweather::AccuWeatherProvider;
use crate::providers::kma::KmaProvider;
use crate::providers::open_meteo::OpenMeteoProvider;
use crate::providers::openweather::OpenWeatherProvider;
use crate::providers::weatherapi::WeatherApiProvider;
use crate::providers::{ProviderRequest, WeatherProvider};
use crate::quota::{QuotaState, QuotaTracker};
use crate::radar::{KmaRadarSource, RadarService};
use crate::routing::RoutingStrategy;
use crate::types::{CallerTier, CanonicalWeatherRecord, Freshness, ProviderDescriptor, ProviderId, RequestKind, WeatherQuery};
use crate::verification::{select_best, single_source, verify, VerificationResult};

type SharedFetch = Shared<BoxFuture<'static, Result<Arc<CanonicalWeatherRecord>, WeatherError>>>;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub fresh_ttl: chrono::Duration,
    pub stale_ttl: chrono::Duration,
    pub call_timeout: Duration,
    pub request_timeout: Duration,
    pub cache_max_entries: usize,
    pub maintenance_interval: Duration,
    pub quota_offset: FixedOffset,
    pub thresholds: MonitoringThresholds,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            fresh_ttl: chrono::Duration::minutes(30),
            stale_ttl: chrono::Duration::hours(24),
            call_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            cache_max_entries: 1000,
            maintenance_interval: Duration::from_secs(60),
            quota_offset: FixedOffset::east_opt(9 * 3600).unwrap_or_else(|| Utc.fix()),
            thresholds: MonitoringThresholds::default(),
        }
    }
}

impl ServiceSettings {
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        let s = &cfg.service;
        let m = &cfg.monitoring;
        let quota_offset = FixedOffset::east_opt(s.quota_utc_offset_hours * 3600)
            .with_context(|| format!("Invalid quota_utc_offset_hours: {}", s.quota_utc_offset_hours))?;
        Ok(Self {
            fresh_ttl: chrono::Duration::minutes(s.fresh_ttl_minutes as i64),
            stale_ttl: chrono::Duration::hours(s.stale_ttl_hours as i64),
            call_timeout: Duration::from_secs(s.call_timeout_secs),
            request_timeout: Duration::from_secs(s.request_timeout_secs),
            cache_max_entries: s.cache_max_entries,
            maintenance_interval: Duration::from_secs(s.maintenance_interval_secs.max(1)),
            quota_offset,
            thresholds: MonitoringThresholds {
                latency_window: m.latency_window,
                critical_error_rate: m.critical_error_rate,
                degraded_latency_ms: m.degraded_latency_ms,
                degraded_quota_ratio: m.degraded_quota_ratio,
            },
        })
    }
}

/// A provider adapter together with its static descriptor.
pub struct RegisteredProvider {
    pub descriptor: ProviderDescriptor,
    pub adapter: Arc<dyn WeatherProvider>,
}

impl RegisteredProvider {
    pub fn new(descriptor: ProviderDescriptor, adapter: Arc<dyn WeatherProvider>) -> Self {
        Self { descriptor, adapter }
    }
}

/// A record plus the result of cross-checking it against a second source.
#[derive(Debug, Clone, Serialize)]
pub struct VerifiedWeather {
    pub record: CanonicalWeatherRecord,
    pub verification: VerificationResult,
}

/// Cache key: request kind plus the normalised query.
pub fn cache_key(kind: RequestKind, query: &WeatherQuery) -> String {
    format!("{}:{}", kind.as_str(), query.normalized())
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

struct Maintenance {
    stop: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Clears a key's in-flight entry when its fetch task ends, including by
/// panic or abort.
struct InflightGuard {
    inner: Arc<Inner>,
    key: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.inner.inflight.lock().remove(&self.key);
    }
}

struct Inner {
    settings: ServiceSettings,
    classifier: LocationClassifier,
    routing: RoutingStrategy,
    quota: QuotaTracker,
    cache: CacheStore,
    monitoring: MonitoringService,
    adapters: HashMap<ProviderId, Arc<dyn WeatherProvider>>,
    inflight: Mutex<HashMap<String, SharedFetch>>,
    radar: Option<RadarService>,
    maintenance: Mutex<Option<Maintenance>>,
}

/// The aggregator. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct WeatherService {
    inner: Arc<Inner>,
}

impl WeatherService {
    pub fn new(settings: ServiceSettings, providers: Vec<RegisteredProvider>) -> Result<Self> {
        Self::with_radar(settings, providers, None)
    }

    pub fn with_radar(
        settings: ServiceSettings,
        providers: Vec<RegisteredProvider>,
        radar: Option<RadarService>,
    ) -> Result<Self> {
        let mut descriptors = Vec::with_capacity(providers.len());
        let mut adapters: HashMap<ProviderId, Arc<dyn WeatherProvider>> = HashMap::new();
        for p in providers {
            anyhow::ensure!(
                p.adapter.id() == p.descriptor.id,
                "Adapter for {} registered under descriptor {}",
                p.adapter.id(),
                p.descriptor.id
            );
            anyhow::ensure!(!adapters.contains_key(&p.descriptor.id), "Provider {} registered twice", p.descriptor.id);
            adapters.insert(p.descriptor.id, p.adapter);
            descriptors.push(p.descriptor);
        }

        let routing = RoutingStrategy::new(&descriptors);
        info!(
            registered = descriptors.len(),
            eligible = routing.eligible().len(),
            providers = ?routing.eligible().iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
            "Weather service configured"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                classifier: LocationClassifier::new(),
                routing,
                quota: QuotaTracker::new(&descriptors, settings.quota_offset),
                cache: CacheStore::new(settings.cache_max_entries),
                monitoring: MonitoringService::new(settings.thresholds),
                adapters,
                inflight: Mutex::new(HashMap::new()),
                radar,
                maintenance: Mutex::new(None),
                settings,
            }),
        })
    }

    /// Build every enabled provider from configuration. Providers whose key
    /// env var is unset or empty are left out with a warning.
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        let settings = ServiceSettings::from_config(cfg)?;
        let timeout = settings.call_timeout;
        let mut providers = Vec::new();

        for id in ProviderId::ALL {
            let id = *id;
            let pc = cfg.providers.get(id);
            if !pc.enabled {
                debug!(provider = %id, "Provider disabled in config");
                continue;
            }
            let credential = cfg.credential(id);
            if !id.is_keyless() && credential.is_none() {
                warn!(provider = %id, env = ?pc.api_key_env, "No API key configured, provider not eligible");
            }
            let descriptor = ProviderDescriptor::new(id, pc.priority, pc.daily_quota, true);

            let adapter: Arc<dyn WeatherProvider> = match (id, credential) {
                (ProviderId::OpenMeteo, _) => Arc::new(OpenMeteoProvider::new(timeout)?),
                (ProviderId::Kma, Some(key)) => Arc::new(KmaProvider::new(key, timeout)?),
                (ProviderId::OpenWeather, Some(key)) => Arc::new(OpenWeatherProvider::new(key, timeout)?),
                (ProviderId::WeatherApi, Some(key)) => Arc::new(WeatherApiProvider::new(key, timeout)?),
                (ProviderId::AccuWeather, Some(key)) => Arc::new(AccuWeatherProvider::new(key, timeout)?),
                (_, None) => continue,
            };
            providers.push(RegisteredProvider::new(descriptor, adapter));
        }

        let radar = if cfg.radar.enabled {
            let source = KmaRadarSource::new(cfg.radar.base_url.clone(), timeout)
                .context("Failed to initialise radar source")?;
            Some(RadarService::new(
                Arc::new(source),
                chrono::Duration::minutes(cfg.radar.step_minutes.max(1)),
                cfg.radar.max_attempts,
            ))
        } else {
            None
        };

        Self::with_radar(settings, providers, radar)
    }

    // -- Lifecycle --------------------------------------------------------

    /// Start the maintenance task (cache sweep, quota rollover, nightly
    /// metric reset). Idempotent. Must be called inside a Tokio runtime.
    pub fn init(&self) {
        let mut slot = self.inner.maintenance.lock();
        if slot.is_some() {
            return;
        }
        let (stop, mut stop_rx) = broadcast::channel(1);
        let inner = Arc::clone(&self.inner);
        let every = self.inner.settings.maintenance_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => inner.run_maintenance(),
                    _ = stop_rx.recv() => {
                        debug!("Maintenance task received shutdown signal");
                        break;
                    }
                }
            }
        });

        *slot = Some(Maintenance { stop, handle });
        info!(interval_secs = every.as_secs(), "Weather service initialised");
    }

    /// Stop the maintenance task and wait for it to finish.
    pub async fn shutdown(&self) {
        let maintenance = self.inner.maintenance.lock().take();
        if let Some(m) = maintenance {
            let _ = m.stop.send(());
            if let Err(e) = m.handle.await {
                warn!(error = %e, "Maintenance task ended abnormally");
            }
        }
        info!("Weather service shut down");
    }

    /// One maintenance pass, as run by the background task.
    pub fn run_maintenance(&self) {
        self.inner.run_maintenance();
    }

    // -- Queries ----------------------------------------------------------

    /// Weather for a query, bounded by the default request timeout.
    pub async fn get_weather(
        &self,
        query: &WeatherQuery,
        kind: RequestKind,
        tier: CallerTier,
    ) -> Result<CanonicalWeatherRecord, WeatherError> {
        self.get_weather_with_deadline(query, kind, tier, self.inner.settings.request_timeout).await
    }

    pub async fn get_weather_with_deadline(
        &self,
        query: &WeatherQuery,
        kind: RequestKind,
        tier: CallerTier,
        deadline: Duration,
    ) -> Result<CanonicalWeatherRecord, WeatherError> {
        let key = cache_key(kind, query);

        if let Some(hit) = self.inner.cache.get_fresh(&key) {
            debug!(key = %key, source = %hit.source, "Cache hit");
            return Ok((*hit).clone());
        }

        let classification = self.inner.classifier.classify(query);
        if let Classification::UnresolvedDomestic { text } = &classification {
            warn!(query = %text, "Domestic location not in gazetteer");
            return Err(WeatherError::UnresolvedLocation(text.clone()));
        }

        let fetch = self.join_or_start(&key, ProviderRequest::new(query.clone(), classification, kind), tier);
        match tokio::time::timeout(deadline, fetch).await {
            Ok(result) => result.map(|record| (*record).clone()),
            Err(_) => {
                if let Some(stale) = self.inner.cache.get_stale(&key) {
                    warn!(key = %key, deadline_ms = deadline.as_millis() as u64, "Deadline reached, serving stale data");
                    return Ok((*stale).clone().into_stale());
                }
                warn!(key = %key, deadline_ms = deadline.as_millis() as u64, "Deadline reached with no data");
                Err(WeatherError::DeadlineExceeded { query: key, deadline })
            }
        }
    }

    /// Weather cross-checked against a second provider.
    pub async fn get_verified_weather(
        &self,
        query: &WeatherQuery,
        kind: RequestKind,
        tier: CallerTier,
    ) -> Result<VerifiedWeather, WeatherError> {
        let primary = self.get_weather(query, kind, tier).await?;
        let req = ProviderRequest::new(query.clone(), self.inner.classifier.classify(query), kind);
        let secondary = self.inner.secondary_fetch(&req, tier, primary.source).await;

        let (record, verification) = match secondary {
            Some(second) => {
                let verification = verify(&primary, &second);
                info!(
                    primary = %primary.source,
                    secondary = %second.source,
                    confidence = %verification.confidence,
                    discrepancies = verification.discrepancies.len(),
                    "Verified weather"
                );
                (select_best(&primary, &second).clone(), verification)
            }
            None => {
                debug!(primary = %primary.source, "No second source available for verification");
                let verification = single_source(&primary);
                (primary, verification)
            }
        };
        Ok(VerifiedWeather { record, verification })
    }

    fn join_or_start(&self, key: &str, req: ProviderRequest, tier: CallerTier) -> SharedFetch {
        let mut inflight = self.inner.inflight.lock();
        if let Some(existing) = inflight.get(key) {
            debug!(key, "Joining in-flight fetch");
            return existing.clone();
        }

        let inner = Arc::clone(&self.inner);
        let task_key = key.to_string();
        let handle = tokio::spawn(async move {
            let _guard = InflightGuard { inner: Arc::clone(&inner), key: task_key.clone() };
            inner.fetch_with_fallback(&task_key, &req, tier).await
        });

        let shared = handle
            .map(|joined| joined.unwrap_or_else(|e| Err(WeatherError::Internal(format!("fetch task failed: {e}")))))
            .boxed()
            .shared();
        inflight.insert(key.to_string(), shared.clone());
        shared
    }

    // -- Observability ----------------------------------------------------

    pub fn health(&self) -> HealthReport {
        self.inner.monitoring.health(&self.inner.quota.snapshot(), self.inner.cache.stats())
    }

    pub fn recommendations(&self) -> BTreeMap<ProviderId, String> {
        self.inner.monitoring.recommendations(&self.inner.quota.snapshot())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub fn quota_state(&self, provider: ProviderId) -> Option<QuotaState> {
        self.inner.quota.state(provider)
    }

    pub fn radar(&self) -> Option<&RadarService> {
        self.inner.radar.as_ref()
    }
}

impl Inner {
    async fn fetch_with_fallback(
        &self,
        key: &str,
        req: &ProviderRequest,
        tier: CallerTier,
    ) -> Result<Arc<CanonicalWeatherRecord>, WeatherError> {
        let candidates = self.routing.select(&req.location, req.kind, tier);
        debug!(key, candidates = ?candidates.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), "Routing");

        let mut attempts: Vec<ProviderError> = Vec::new();
        for descriptor in &candidates {
            let id = descriptor.id;
            let Some(adapter) = self.adapters.get(&id) else {
                continue;
            };
            if !self.quota.try_acquire(id) {
                info!(
                    provider = %id,
                    resets_in_secs = self.quota.time_until_reset(id).as_secs(),
                    "Quota exhausted, skipping provider"
                );
                continue;
            }

            match self.call(adapter.as_ref(), req).await {
                Ok(record) => {
                    let record = Arc::new(record);
                    self.cache.set_both_at(
                        key,
                        Arc::clone(&record),
                        self.settings.fresh_ttl,
                        self.settings.stale_ttl,
                        Utc::now(),
                    );
                    info!(key, provider = %id, failed_before = attempts.len(), "Weather fetched");
                    return Ok(record);
                }
                Err(e) => {
                    warn!(key, provider = %id, error = %e, "Provider failed, falling back");
                    attempts.push(e);
                }
            }
        }

        if let Some(stale) = self.cache.get_stale(key) {
            warn!(key, failed = attempts.len(), source = %stale.source, "All providers failed, serving stale data");
            return Ok(Arc::new((*stale).clone().into_stale()));
        }

        error!(key, failed = attempts.len(), "All providers exhausted");
        Err(WeatherError::AllProvidersExhausted { query: key.to_string(), attempts })
    }

    /// Fetch from the first provider after `primary` in routing order that
    /// has quota and succeeds. Not cached.
    async fn secondary_fetch(
        &self,
        req: &ProviderRequest,
        tier: CallerTier,
        primary: ProviderId,
    ) -> Option<CanonicalWeatherRecord> {
        for descriptor in self.routing.select(&req.location, req.kind, tier) {
            let id = descriptor.id;
            if id == primary {
                continue;
            }
            let Some(adapter) = self.adapters.get(&id) else {
                continue;
            };
            if !self.quota.try_acquire(id) {
                continue;
            }
            match self.call(adapter.as_ref(), req).await {
                Ok(record) => return Some(record),
                Err(e) => warn!(provider = %id, error = %e, "Verification source failed"),
            }
        }
        None
    }

    /// One adapter invocation: bounded by the call timeout, checked for
    /// provenance, and recorded in monitoring.
    async fn call(&self, adapter: &dyn WeatherProvider, req: &ProviderRequest) -> Result<CanonicalWeatherRecord, ProviderError> {
        let id = adapter.id();
        let started = Instant::now();

        let outcome = match tokio::time::timeout(self.settings.call_timeout, adapter.fetch(req)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::timeout(id, self.settings.call_timeout)),
        };
        let outcome = outcome.and_then(|mut record| {
            if record.source != id {
                return Err(ProviderError::parse(id, format!("record claims source {}", record.source)));
            }
            record.freshness = Freshness::Fresh;
            record.cached_at = Some(Utc::now());
            Ok(record)
        });

        let latency_ms = started.elapsed().as_millis() as u64;
        self.monitoring.record(id, outcome.is_ok(), latency_ms);
        outcome
    }

    fn run_maintenance(&self) {
        let swept = self.cache.sweep();
        let rolled = self.quota.roll_over_expired();
        for id in &rolled {
            self.monitoring.reset(*id);
        }
        if swept > 0 || !rolled.is_empty() {
            info!(swept, rolled = ?rolled, "Maintenance pass");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderErrorKind;
    use crate::providers::stub::StubProvider;

    fn settings() -> ServiceSettings {
        ServiceSettings { call_timeout: Duration::from_millis(200), ..Default::default() }
    }

    fn register(stub: Arc<StubProvider>, priority: u32, quota: u32) -> RegisteredProvider {
        RegisteredProvider::new(ProviderDescriptor::new(stub.id, priority, quota, true), stub)
    }

    fn london() -> WeatherQuery {
        WeatherQuery::text("London")
    }

    #[test]
    fn test_cache_key_includes_kind() {
        assert_eq!(cache_key(RequestKind::Current, &WeatherQuery::text(" Seoul ")), "current:seoul");
        assert_eq!(
            cache_key(RequestKind::Forecast, &WeatherQuery::coords(37.5665, 126.978)),
            "forecast:37.57,126.98"
        );
    }

    #[test]
    fn test_mismatched_registration_rejected() {
        let stub = Arc::new(StubProvider::ok(ProviderId::OpenWeather));
        let bad = RegisteredProvider::new(ProviderDescriptor::new(ProviderId::WeatherApi, 1, 10, true), stub);
        assert!(WeatherService::new(settings(), vec![bad]).is_err());
    }

    #[tokio::test]
    async fn test_first_success_short_circuits() {
        let ow = Arc::new(StubProvider::ok(ProviderId::OpenWeather));
        let wa = Arc::new(StubProvider::ok(ProviderId::WeatherApi));
        let svc = WeatherService::new(settings(), vec![register(ow.clone(), 1, 10), register(wa.clone(), 2, 10)]).unwrap();

        let rec = svc.get_weather(&london(), RequestKind::Current, CallerTier::Free).await.unwrap();
        assert_eq!(rec.source, ProviderId::OpenWeather);
        assert!(rec.cached_at.is_some());
        assert_eq!(ow.calls(), 1);
        assert_eq!(wa.calls(), 0);
        assert_eq!(svc.quota_state(ProviderId::WeatherApi).unwrap().used, 0);
    }

    #[tokio::test]
    async fn test_domestic_stale_entry_served_when_all_fail() {
        let kma = Arc::new(StubProvider::failing(ProviderId::Kma));
        let ow = Arc::new(StubProvider::failing(ProviderId::OpenWeather));
        let svc = WeatherService::new(settings(), vec![register(kma.clone(), 1, 10), register(ow.clone(), 2, 10)]).unwrap();

        let busan = WeatherQuery::text("부산");
        let key = cache_key(RequestKind::Current, &busan);
        let two_hours_ago = Utc::now() - chrono::Duration::hours(2);
        let mut seeded = CanonicalWeatherRecord::sample(ProviderId::Kma);
        seeded.location.name = "Busan".into();
        seeded.observed_at = two_hours_ago;
        svc.inner.cache.set_both_at(
            &key,
            Arc::new(seeded),
            svc.inner.settings.fresh_ttl,
            svc.inner.settings.stale_ttl,
            two_hours_ago,
        );

        let rec = svc.get_weather(&busan, RequestKind::Current, CallerTier::Free).await.unwrap();
        assert!(rec.is_stale());
        assert_eq!(rec.source, ProviderId::Kma);
        assert_eq!(rec.source_label(), "kma (stale)");
        assert_eq!(rec.location.name, "Busan");
        assert_eq!(kma.calls(), 1);
        assert_eq!(ow.calls(), 1);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_providers_and_quota() {
        let ow = Arc::new(StubProvider::ok(ProviderId::OpenWeather));
        let svc = WeatherService::new(settings(), vec![register(ow.clone(), 1, 10)]).unwrap();

        svc.get_weather(&london(), RequestKind::Current, CallerTier::Free).await.unwrap();
        svc.get_weather(&WeatherQuery::text("london "), RequestKind::Current, CallerTier::Free).await.unwrap();
        assert_eq!(ow.calls(), 1);
        assert_eq!(svc.quota_state(ProviderId::OpenWeather).unwrap().used, 1);
        assert_eq!(svc.cache_stats().hits, 1);
    }

    #[tokio::test]
    async fn test_quota_exhausted_provider_skipped_without_error() {
        let ow = Arc::new(StubProvider::ok(ProviderId::OpenWeather));
        let wa = Arc::new(StubProvider::ok(ProviderId::WeatherApi));
        let svc = WeatherService::new(settings(), vec![register(ow.clone(), 1, 0), register(wa.clone(), 2, 10)]).unwrap();

        let rec = svc.get_weather(&london(), RequestKind::Current, CallerTier::Free).await.unwrap();
        assert_eq!(rec.source, ProviderId::WeatherApi);
        assert_eq!(ow.calls(), 0);
        let health = svc.health();
        assert!(health.providers.iter().all(|p| p.failures == 0));
    }

    #[tokio::test]
    async fn test_exhausted_lists_attempts_in_order() {
        let ow = Arc::new(StubProvider::failing(ProviderId::OpenWeather));
        let wa = Arc::new(StubProvider::failing(ProviderId::WeatherApi));
        let svc = WeatherService::new(settings(), vec![register(ow, 1, 10), register(wa, 2, 10)]).unwrap();

        let err = svc.get_weather(&london(), RequestKind::Current, CallerTier::Free).await.unwrap_err();
        match err {
            WeatherError::AllProvidersExhausted { query, attempts } => {
                assert_eq!(query, "current:london");
                let ids: Vec<_> = attempts.iter().map(|a| a.provider).collect();
                assert_eq!(ids, vec![ProviderId::OpenWeather, ProviderId::WeatherApi]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_slow_provider_times_out_and_falls_back() {
        let ow = Arc::new(StubProvider::ok(ProviderId::OpenWeather).with_delay(Duration::from_secs(2)));
        let wa = Arc::new(StubProvider::ok(ProviderId::WeatherApi));
        let svc = WeatherService::new(settings(), vec![register(ow, 1, 10), register(wa, 2, 10)]).unwrap();

        let rec = svc.get_weather(&london(), RequestKind::Current, CallerTier::Free).await.unwrap();
        assert_eq!(rec.source, ProviderId::WeatherApi);
    }

    #[tokio::test]
    async fn test_wrong_source_rejected() {
        let mut liar = StubProvider::ok(ProviderId::OpenWeather);
        liar.outcome = Ok(CanonicalWeatherRecord::sample(ProviderId::AccuWeather));
        let svc = WeatherService::new(settings(), vec![register(Arc::new(liar), 1, 10)]).unwrap();

        let err = svc.get_weather(&london(), RequestKind::Current, CallerTier::Free).await.unwrap_err();
        match err {
            WeatherError::AllProvidersExhausted { attempts, .. } => {
                assert_eq!(attempts[0].kind, ProviderErrorKind::Parse);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unresolved_domestic_consumes_no_quota() {
        let kma = Arc::new(StubProvider::ok(ProviderId::Kma));
        let svc = WeatherService::new(settings(), vec![register(kma.clone(), 1, 10)]).unwrap();

        let err = svc
            .get_weather(&WeatherQuery::text("없는동네"), RequestKind::Current, CallerTier::Free)
            .await
            .unwrap_err();
        assert!(matches!(err, WeatherError::UnresolvedLocation(_)));
        assert_eq!(kma.calls(), 0);
        assert_eq!(svc.quota_state(ProviderId::Kma).unwrap().used, 0);
    }

    #[tokio::test]
    async fn test_deadline_without_stale_data() {
        let ow = Arc::new(StubProvider::ok(ProviderId::OpenWeather).with_delay(Duration::from_millis(150)));
        let svc = WeatherService::new(settings(), vec![register(ow, 1, 10)]).unwrap();

        let err = svc
            .get_weather_with_deadline(&london(), RequestKind::Current, CallerTier::Free, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, WeatherError::DeadlineExceeded { .. }));

        // the abandoned fetch still completes and fills the cache
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(svc.cache_stats().size, 1);
    }

    #[tokio::test]
    async fn test_verified_weather_uses_second_source() {
        let ow = Arc::new(StubProvider::ok(ProviderId::OpenWeather));
        let mut accu = StubProvider::ok(ProviderId::AccuWeather);
        if let Ok(r) = accu.outcome.as_mut() {
            r.location.country = Some("GB".into());
            r.current.temperature += 6.0;
        }
        let accu = Arc::new(accu);
        let svc = WeatherService::new(settings(), vec![register(ow, 1, 10), register(accu.clone(), 2, 10)]).unwrap();

        let v = svc.get_verified_weather(&london(), RequestKind::Current, CallerTier::Free).await.unwrap();
        assert_eq!(v.verification.sources, vec![ProviderId::OpenWeather, ProviderId::AccuWeather]);
        assert_eq!(v.verification.discrepancies.len(), 1);
        assert_eq!(v.record.source, ProviderId::AccuWeather);
        assert_eq!(accu.calls(), 1);
    }

    #[tokio::test]
    async fn test_verified_weather_single_source() {
        let ow = Arc::new(StubProvider::ok(ProviderId::OpenWeather));
        let svc = WeatherService::new(settings(), vec![register(ow, 1, 10)]).unwrap();

        let v = svc.get_verified_weather(&london(), RequestKind::Current, CallerTier::Free).await.unwrap();
        assert!(!v.verification.verified);
        assert_eq!(v.record.source, ProviderId::OpenWeather);
    }

    /// Panics on its first fetch, then behaves.
    struct PanicOnceProvider {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl WeatherProvider for PanicOnceProvider {
        fn id(&self) -> ProviderId {
            ProviderId::OpenWeather
        }

        async fn fetch(&self, _req: &ProviderRequest) -> Result<CanonicalWeatherRecord, ProviderError> {
            if self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                panic!("adapter bug");
            }
            Ok(CanonicalWeatherRecord::sample(ProviderId::OpenWeather))
        }
    }

    #[tokio::test]
    async fn test_panicked_fetch_does_not_poison_key() {
        let adapter = Arc::new(PanicOnceProvider { calls: Default::default() });
        let descriptor = ProviderDescriptor::new(ProviderId::OpenWeather, 1, 10, true);
        let svc = WeatherService::new(settings(), vec![RegisteredProvider::new(descriptor, adapter)]).unwrap();

        let err = svc.get_weather(&london(), RequestKind::Current, CallerTier::Free).await.unwrap_err();
        assert!(matches!(err, WeatherError::Internal(_)));
        assert!(svc.inner.inflight.lock().is_empty());

        let rec = svc.get_weather(&london(), RequestKind::Current, CallerTier::Free).await.unwrap();
        assert_eq!(rec.source, ProviderId::OpenWeather);
    }

    #[tokio::test]
    async fn test_init_and_shutdown() {
        let ow = Arc::new(StubProvider::ok(ProviderId::OpenWeather));
        let svc = WeatherService::new(
            ServiceSettings { maintenance_interval: Duration::from_millis(10), ..settings() },
            vec![register(ow, 1, 10)],
        )
        .unwrap();
        svc.init();
        svc.init();
        tokio::time::sleep(Duration::from_millis(30)).await;
        svc.shutdown().await;
        assert!(svc.inner.maintenance.lock().is_none());
    }
}
