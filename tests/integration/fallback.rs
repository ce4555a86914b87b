//! End-to-end scenarios for the fallback orchestrator: routing order,
//! quota skips, stale degradation, coalescing and caller deadlines.

use std::time::Duration;

use nimbus::error::{ProviderErrorKind, WeatherError};
use nimbus::service::{ServiceSettings, WeatherService};
use nimbus::types::{CallerTier, Freshness, ProviderId, RequestKind, WeatherQuery};

use crate::mock_provider::MockProvider;

fn settings() -> ServiceSettings {
    ServiceSettings { call_timeout: Duration::from_millis(500), ..Default::default() }
}

fn london() -> WeatherQuery {
    WeatherQuery::text("London")
}

#[tokio::test]
async fn test_fallback_to_second_provider() {
    let a = MockProvider::failing(ProviderId::OpenWeather);
    let b = MockProvider::new(ProviderId::WeatherApi);
    let svc = WeatherService::new(settings(), vec![a.register(1, 100), b.register(2, 100)]).unwrap();

    let rec = svc.get_weather(&london(), RequestKind::Current, CallerTier::Free).await.unwrap();
    assert_eq!(rec.source, ProviderId::WeatherApi);
    assert_eq!(rec.freshness, Freshness::Fresh);
    assert_eq!(a.calls(), 1);
    assert_eq!(b.calls(), 1);
    assert_eq!(svc.quota_state(ProviderId::OpenWeather).unwrap().used, 1);
    assert_eq!(svc.quota_state(ProviderId::WeatherApi).unwrap().used, 1);

    let health = svc.health();
    let ow = health.providers.iter().find(|p| p.provider == ProviderId::OpenWeather).unwrap();
    assert_eq!(ow.failures, 1);
}

#[tokio::test]
async fn test_stale_served_when_all_providers_fail() {
    let a = MockProvider::new(ProviderId::OpenWeather);
    let svc = WeatherService::new(
        ServiceSettings { fresh_ttl: chrono::Duration::milliseconds(50), ..settings() },
        vec![a.register(1, 100)],
    )
    .unwrap();

    let first = svc.get_weather(&london(), RequestKind::Current, CallerTier::Free).await.unwrap();
    assert!(!first.is_stale());

    a.set_error(ProviderErrorKind::RateLimited);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = svc.get_weather(&london(), RequestKind::Current, CallerTier::Free).await.unwrap();
    assert!(second.is_stale());
    assert_eq!(second.source, ProviderId::OpenWeather);
    assert_eq!(second.source_label(), "openweather (stale)");
    assert_eq!(second.current.temperature, first.current.temperature);
    assert_eq!(a.calls(), 2);
}

#[tokio::test]
async fn test_domestic_stale_served_when_all_providers_fail() {
    let kma = MockProvider::new(ProviderId::Kma);
    let ow = MockProvider::new(ProviderId::OpenWeather);
    let svc = WeatherService::new(
        ServiceSettings { fresh_ttl: chrono::Duration::milliseconds(50), ..settings() },
        vec![kma.register(1, 100), ow.register(2, 100)],
    )
    .unwrap();
    let busan = WeatherQuery::text("부산");

    let first = svc.get_weather(&busan, RequestKind::Current, CallerTier::Free).await.unwrap();
    assert_eq!(first.source, ProviderId::Kma);

    kma.set_error(ProviderErrorKind::Network);
    ow.set_error(ProviderErrorKind::Timeout);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = svc.get_weather(&busan, RequestKind::Current, CallerTier::Free).await.unwrap();
    assert!(second.is_stale());
    assert_eq!(second.source_label(), "kma (stale)");
    assert_eq!(second.location.country.as_deref(), Some("KR"));
    assert_eq!(kma.calls(), 2);
    assert_eq!(ow.calls(), 1);
}

#[tokio::test]
async fn test_exhausted_without_stale_data() {
    let a = MockProvider::failing(ProviderId::OpenWeather);
    let b = MockProvider::failing(ProviderId::OpenMeteo);
    let svc = WeatherService::new(settings(), vec![a.register(1, 100), b.register(2, 100)]).unwrap();

    match svc.get_weather(&london(), RequestKind::Current, CallerTier::Free).await {
        Err(WeatherError::AllProvidersExhausted { query, attempts }) => {
            assert_eq!(query, "current:london");
            assert_eq!(attempts.len(), 2);
            assert!(attempts.iter().all(|e| e.kind == ProviderErrorKind::Network));
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_coalesce() {
    let a = MockProvider::new(ProviderId::OpenWeather);
    a.set_delay(Duration::from_millis(150));
    let svc = WeatherService::new(settings(), vec![a.register(1, 100)]).unwrap();

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let svc = svc.clone();
            tokio::spawn(async move { svc.get_weather(&london(), RequestKind::Current, CallerTier::Free).await })
        })
        .collect();

    for h in handles {
        let rec = h.await.unwrap().unwrap();
        assert_eq!(rec.source, ProviderId::OpenWeather);
    }
    assert_eq!(a.calls(), 1);
    assert_eq!(svc.quota_state(ProviderId::OpenWeather).unwrap().used, 1);
}

#[tokio::test]
async fn test_unresolved_location_consumes_no_quota() {
    let kma = MockProvider::new(ProviderId::Kma);
    let ow = MockProvider::new(ProviderId::OpenWeather);
    let svc = WeatherService::new(settings(), vec![kma.register(1, 100), ow.register(2, 100)]).unwrap();

    let err = svc
        .get_weather(&WeatherQuery::text("가상의마을"), RequestKind::Current, CallerTier::Free)
        .await
        .unwrap_err();
    assert!(matches!(err, WeatherError::UnresolvedLocation(_)));
    assert_eq!(kma.calls() + ow.calls(), 0);
    assert_eq!(svc.quota_state(ProviderId::Kma).unwrap().used, 0);
    assert_eq!(svc.quota_state(ProviderId::OpenWeather).unwrap().used, 0);
}

#[tokio::test]
async fn test_quota_exhaustion_skips_provider() {
    let a = MockProvider::new(ProviderId::OpenWeather);
    let b = MockProvider::new(ProviderId::WeatherApi);
    let svc = WeatherService::new(settings(), vec![a.register(1, 1), b.register(2, 100)]).unwrap();

    let first = svc.get_weather(&london(), RequestKind::Current, CallerTier::Free).await.unwrap();
    assert_eq!(first.source, ProviderId::OpenWeather);

    // different key so the cache does not answer
    let second = svc.get_weather(&WeatherQuery::text("Paris"), RequestKind::Current, CallerTier::Free).await.unwrap();
    assert_eq!(second.source, ProviderId::WeatherApi);
    assert_eq!(a.calls(), 1);

    let health = svc.health();
    let ow = health.providers.iter().find(|p| p.provider == ProviderId::OpenWeather).unwrap();
    assert_eq!(ow.failures, 0);
    assert_eq!(ow.daily_used, 1);
}

#[tokio::test]
async fn test_domestic_query_routes_to_kma() {
    let kma = MockProvider::new(ProviderId::Kma);
    let ow = MockProvider::new(ProviderId::OpenWeather);
    let svc = WeatherService::new(settings(), vec![ow.register(1, 100), kma.register(2, 100)]).unwrap();

    let rec = svc.get_weather(&WeatherQuery::text("서울"), RequestKind::Current, CallerTier::Free).await.unwrap();
    assert_eq!(rec.source, ProviderId::Kma);
    assert_eq!(rec.location.country.as_deref(), Some("KR"));
    assert_eq!(ow.calls(), 0);
}

#[tokio::test]
async fn test_deadline_serves_stale() {
    let a = MockProvider::new(ProviderId::OpenWeather);
    let svc = WeatherService::new(
        ServiceSettings { fresh_ttl: chrono::Duration::milliseconds(50), ..settings() },
        vec![a.register(1, 100)],
    )
    .unwrap();

    svc.get_weather(&london(), RequestKind::Current, CallerTier::Free).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    a.set_delay(Duration::from_millis(300));

    let rec = svc
        .get_weather_with_deadline(&london(), RequestKind::Current, CallerTier::Free, Duration::from_millis(30))
        .await
        .unwrap();
    assert!(rec.is_stale());
}

#[tokio::test]
async fn test_verified_weather_flags_disagreement() {
    let a = MockProvider::with_temperature(ProviderId::OpenWeather, 20.0);
    let b = MockProvider::with_temperature(ProviderId::WeatherApi, 28.0);
    let svc = WeatherService::new(settings(), vec![a.register(1, 100), b.register(2, 100)]).unwrap();

    let v = svc.get_verified_weather(&london(), RequestKind::Current, CallerTier::Free).await.unwrap();
    assert_eq!(v.verification.discrepancies.len(), 1);
    assert!(v.verification.verified);
    // OpenWeather outranks WeatherAPI
    assert_eq!(v.record.source, ProviderId::OpenWeather);
    assert_eq!(b.calls(), 1);
}

#[tokio::test]
async fn test_recovered_provider_used_again() {
    let a = MockProvider::failing(ProviderId::OpenWeather);
    let b = MockProvider::new(ProviderId::WeatherApi);
    let svc = WeatherService::new(settings(), vec![a.register(1, 100), b.register(2, 100)]).unwrap();

    let first = svc.get_weather(&london(), RequestKind::Current, CallerTier::Free).await.unwrap();
    assert_eq!(first.source, ProviderId::WeatherApi);

    a.clear_error();
    let rec = svc.get_weather(&london(), RequestKind::Forecast, CallerTier::Free).await.unwrap();
    assert_eq!(rec.source, ProviderId::OpenWeather);
}
