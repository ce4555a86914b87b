//! Provider routing.
//!
//! Maps (location class, request kind, caller tier) to an ordered,
//! deduplicated list of eligible providers. The table is pure: it holds the
//! immutable provider descriptors and nothing else, so identical inputs
//! always yield identical output.

use crate::location::Classification;
use crate::types::{CallerTier, ProviderDescriptor, ProviderId, RequestKind};

/// Providers that take a coordinate pair (directly, via a derived grid
/// cell or via a geoposition lookup), ranked by data-quality reputation for
/// domestic locations. AccuWeather sits late because of its small quota.
const DOMESTIC_COORDINATE_RANKING: &[ProviderId] = &[
    ProviderId::Kma,
    ProviderId::OpenWeather,
    ProviderId::WeatherApi,
    ProviderId::AccuWeather,
    ProviderId::OpenMeteo,
];

/// Providers that only make sense for domestic locations.
const DOMESTIC_ONLY: &[ProviderId] = &[ProviderId::Kma];

#[derive(Debug, Clone)]
pub struct RoutingStrategy {
    /// Eligible descriptors sorted by priority (then id for stability).
    eligible: Vec<ProviderDescriptor>,
}

impl RoutingStrategy {
    /// Build from the configured providers. Providers without a credential
    /// are dropped here, before any ranking happens.
    pub fn new(descriptors: &[ProviderDescriptor]) -> Self {
        let mut eligible: Vec<ProviderDescriptor> =
            descriptors.iter().filter(|d| d.is_eligible()).cloned().collect();
        eligible.sort_by_key(|d| (d.priority, d.id));
        eligible.dedup_by_key(|d| d.id);
        Self { eligible }
    }

    /// Ordered provider preference list for one request.
    pub fn select(
        &self,
        classification: &Classification,
        kind: RequestKind,
        tier: CallerTier,
    ) -> Vec<ProviderDescriptor> {
        let domestic = classification.is_domestic();

        let order: Vec<ProviderId> = match (domestic, kind) {
            (true, RequestKind::AirQuality | RequestKind::Warning) => {
                let mut o = vec![ProviderId::Kma];
                o.extend_from_slice(DOMESTIC_COORDINATE_RANKING);
                o
            }
            (true, RequestKind::ExtendedForecast) if tier == CallerTier::Premium => {
                let mut o = vec![ProviderId::Kma, ProviderId::AccuWeather];
                o.extend_from_slice(DOMESTIC_COORDINATE_RANKING);
                o
            }
            (true, _) => DOMESTIC_COORDINATE_RANKING.to_vec(),
            (false, RequestKind::Current | RequestKind::Forecast) => {
                self.with_first(ProviderId::OpenWeather)
            }
            (_, RequestKind::UvIndex | RequestKind::Historical) => {
                self.with_first(ProviderId::WeatherApi)
            }
            (_, RequestKind::ExtendedForecast) if tier == CallerTier::Premium => {
                self.with_first(ProviderId::AccuWeather)
            }
            _ => self.default_order(),
        };

        self.resolve(&order)
    }

    /// Every eligible provider, in priority order.
    pub fn eligible(&self) -> &[ProviderDescriptor] {
        &self.eligible
    }

    fn default_order(&self) -> Vec<ProviderId> {
        self.eligible
            .iter()
            .map(|d| d.id)
            .filter(|id| !DOMESTIC_ONLY.contains(id))
            .collect()
    }

    fn with_first(&self, first: ProviderId) -> Vec<ProviderId> {
        let mut o = vec![first];
        o.extend(self.default_order());
        o
    }

    /// Dedupe and map ids back to eligible descriptors, dropping anything
    /// not eligible.
    fn resolve(&self, order: &[ProviderId]) -> Vec<ProviderDescriptor> {
        let mut out: Vec<ProviderDescriptor> = Vec::with_capacity(order.len());
        for id in order {
            if out.iter().any(|d| d.id == *id) {
                continue;
            }
            if let Some(d) = self.eligible.iter().find(|d| d.id == *id) {
                out.push(d.clone());
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::ResolvedLocation;
    use crate::types::Coordinates;

    fn all_descriptors() -> Vec<ProviderDescriptor> {
        vec![
            ProviderDescriptor::new(ProviderId::Kma, 1, 10_000, true),
            ProviderDescriptor::new(ProviderId::OpenWeather, 2, 1_000, true),
            ProviderDescriptor::new(ProviderId::WeatherApi, 3, 30_000, true),
            ProviderDescriptor::new(ProviderId::AccuWeather, 4, 50, true),
            ProviderDescriptor::new(ProviderId::OpenMeteo, 5, 10_000, true),
        ]
    }

    fn domestic() -> Classification {
        Classification::Domestic(ResolvedLocation {
            name: "Seoul".into(),
            coordinates: Coordinates::new(37.57, 126.98),
        })
    }

    fn international() -> Classification {
        Classification::International { text: Some("London".into()), coordinates: None }
    }

    fn ids(list: &[ProviderDescriptor]) -> Vec<ProviderId> {
        list.iter().map(|d| d.id).collect()
    }

    use ProviderId::*;

    #[test]
    fn test_domestic_warning_kma_first() {
        let r = RoutingStrategy::new(&all_descriptors());
        let order = r.select(&domestic(), RequestKind::Warning, CallerTier::Free);
        assert_eq!(ids(&order), vec![Kma, OpenWeather, WeatherApi, AccuWeather, OpenMeteo]);
    }

    #[test]
    fn test_domestic_current_coordinate_providers() {
        let r = RoutingStrategy::new(&all_descriptors());
        let order = r.select(&domestic(), RequestKind::Current, CallerTier::Premium);
        assert_eq!(ids(&order), vec![Kma, OpenWeather, WeatherApi, AccuWeather, OpenMeteo]);
    }

    #[test]
    fn test_domestic_extended_forecast_premium_reaches_long_range() {
        let r = RoutingStrategy::new(&all_descriptors());
        let premium = r.select(&domestic(), RequestKind::ExtendedForecast, CallerTier::Premium);
        assert_eq!(ids(&premium), vec![Kma, AccuWeather, OpenWeather, WeatherApi, OpenMeteo]);
        let free = r.select(&domestic(), RequestKind::ExtendedForecast, CallerTier::Free);
        assert_eq!(ids(&free), vec![Kma, OpenWeather, WeatherApi, AccuWeather, OpenMeteo]);
    }

    #[test]
    fn test_domestic_rule_precedes_uv_rule() {
        let r = RoutingStrategy::new(&all_descriptors());
        let order = r.select(&domestic(), RequestKind::UvIndex, CallerTier::Free);
        assert_eq!(order[0].id, Kma);
    }

    #[test]
    fn test_international_current_general_provider_first() {
        let r = RoutingStrategy::new(&all_descriptors());
        let order = r.select(&international(), RequestKind::Current, CallerTier::Free);
        assert_eq!(ids(&order), vec![OpenWeather, WeatherApi, AccuWeather, OpenMeteo]);
    }

    #[test]
    fn test_international_never_routes_domestic_specialist() {
        let r = RoutingStrategy::new(&all_descriptors());
        for kind in RequestKind::ALL {
            for tier in [CallerTier::Free, CallerTier::Premium] {
                let order = r.select(&international(), *kind, tier);
                assert!(!ids(&order).contains(&Kma), "{kind} {tier:?}");
            }
        }
    }

    #[test]
    fn test_historical_specialist_first() {
        let r = RoutingStrategy::new(&all_descriptors());
        let order = r.select(&international(), RequestKind::Historical, CallerTier::Free);
        assert_eq!(ids(&order), vec![WeatherApi, OpenWeather, AccuWeather, OpenMeteo]);
    }

    #[test]
    fn test_extended_forecast_premium_only() {
        let r = RoutingStrategy::new(&all_descriptors());
        let premium = r.select(&international(), RequestKind::ExtendedForecast, CallerTier::Premium);
        assert_eq!(premium[0].id, AccuWeather);
        let free = r.select(&international(), RequestKind::ExtendedForecast, CallerTier::Free);
        assert_eq!(ids(&free), vec![OpenWeather, WeatherApi, AccuWeather, OpenMeteo]);
    }

    #[test]
    fn test_missing_credential_filtered() {
        let mut d = all_descriptors();
        d[0].has_credential = false; // kma
        let r = RoutingStrategy::new(&d);
        let order = r.select(&domestic(), RequestKind::Warning, CallerTier::Free);
        assert_eq!(ids(&order), vec![OpenWeather, WeatherApi, AccuWeather, OpenMeteo]);
    }

    #[test]
    fn test_priority_drives_default_order() {
        let mut d = all_descriptors();
        d[4].priority = 0; // open-meteo first
        let r = RoutingStrategy::new(&d);
        let order = r.select(&international(), RequestKind::AirQuality, CallerTier::Free);
        assert_eq!(ids(&order), vec![OpenMeteo, OpenWeather, WeatherApi, AccuWeather]);
    }

    #[test]
    fn test_select_is_pure() {
        let r = RoutingStrategy::new(&all_descriptors());
        for kind in RequestKind::ALL {
            let a = r.select(&domestic(), *kind, CallerTier::Free);
            let b = r.select(&domestic(), *kind, CallerTier::Free);
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_no_duplicates() {
        let r = RoutingStrategy::new(&all_descriptors());
        for kind in RequestKind::ALL {
            let order = ids(&r.select(&domestic(), *kind, CallerTier::Premium));
            let mut dedup = order.clone();
            dedup.sort();
            dedup.dedup();
            assert_eq!(order.len(), dedup.len());
        }
    }
}
