//! Provider monitoring.
//!
//! Accumulates per-provider counters from every adapter invocation and
//! derives a system health verdict, alert strings and per-provider
//! recommendations. Daily usage is read from the quota tracker snapshot
//! passed in at report time rather than duplicated here.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use tracing::{debug, warn};

use crate::cache::CacheStats;
use crate::quota::QuotaState;
use crate::types::ProviderId;

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitoringThresholds {
    /// Rolling latency window size (samples).
    pub latency_window: usize,
    /// Error rate above which a provider makes the system critical.
    pub critical_error_rate: f64,
    /// Average latency above which a provider makes the system degraded.
    pub degraded_latency_ms: f64,
    /// Quota usage ratio above which a provider makes the system degraded.
    pub degraded_quota_ratio: f64,
}

impl Default for MonitoringThresholds {
    fn default() -> Self {
        Self {
            latency_window: 100,
            critical_error_rate: 0.5,
            degraded_latency_ms: 5000.0,
            degraded_quota_ratio: 0.9,
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ProviderMetric {
    requests: u64,
    successes: u64,
    failures: u64,
    latencies: VecDeque<u64>,
    last_used: Option<DateTime<Utc>>,
}

impl ProviderMetric {
    fn new(window: usize) -> Self {
        Self {
            requests: 0,
            successes: 0,
            failures: 0,
            latencies: VecDeque::with_capacity(window),
            last_used: None,
        }
    }

    fn average_latency_ms(&self) -> f64 {
        if self.latencies.is_empty() {
            0.0
        } else {
            self.latencies.iter().sum::<u64>() as f64 / self.latencies.len() as f64
        }
    }

    fn error_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.failures as f64 / self.requests as f64
        }
    }
}

/// Point-in-time view of one provider's metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderMetricSnapshot {
    pub provider: ProviderId,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub average_latency_ms: f64,
    pub error_rate: f64,
    pub last_used: Option<DateTime<Utc>>,
    pub daily_used: u32,
    pub daily_limit: u32,
    /// Share of the daily budget consumed; a zero limit counts as spent,
    /// an untracked provider as unused.
    pub quota_ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub overall: HealthStatus,
    pub providers: Vec<ProviderMetricSnapshot>,
    pub cache: CacheStats,
    pub alerts: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

/// Per-provider counters shared by every in-flight query.
#[derive(Debug)]
pub struct MonitoringService {
    thresholds: MonitoringThresholds,
    metrics: Mutex<HashMap<ProviderId, ProviderMetric>>,
}

impl Default for MonitoringService {
    fn default() -> Self {
        Self::new(MonitoringThresholds::default())
    }
}

impl MonitoringService {
    pub fn new(thresholds: MonitoringThresholds) -> Self {
        Self { thresholds, metrics: Mutex::new(HashMap::new()) }
    }

    pub fn thresholds(&self) -> &MonitoringThresholds {
        &self.thresholds
    }

    /// Record one adapter invocation.
    pub fn record(&self, provider: ProviderId, success: bool, latency_ms: u64) {
        let window = self.thresholds.latency_window.max(1);
        let mut metrics = self.metrics.lock();
        let m = metrics.entry(provider).or_insert_with(|| ProviderMetric::new(window));
        m.requests += 1;
        if success {
            m.successes += 1;
        } else {
            m.failures += 1;
        }
        if m.latencies.len() == window {
            m.latencies.pop_front();
        }
        m.latencies.push_back(latency_ms);
        m.last_used = Some(Utc::now());
        debug!(provider = %provider, success, latency_ms, requests = m.requests, "Recorded provider call");
    }

    /// Drop a provider's counters (nightly reset alongside its quota).
    pub fn reset(&self, provider: ProviderId) {
        self.metrics.lock().remove(&provider);
    }

    pub fn reset_all(&self) {
        self.metrics.lock().clear();
    }

    /// Snapshot of every provider that has been called or has a quota.
    pub fn snapshot(&self, quotas: &HashMap<ProviderId, QuotaState>) -> Vec<ProviderMetricSnapshot> {
        let metrics = self.metrics.lock();
        let mut ids: Vec<ProviderId> = metrics.keys().chain(quotas.keys()).copied().collect();
        ids.sort();
        ids.dedup();

        ids.into_iter()
            .map(|id| {
                let quota = quotas.get(&id);
                let (daily_used, daily_limit) = quota.map(|q| (q.used, q.limit)).unwrap_or((0, 0));
                let quota_ratio = quota.map(QuotaState::usage_ratio).unwrap_or(0.0);
                match metrics.get(&id) {
                    Some(m) => ProviderMetricSnapshot {
                        provider: id,
                        requests: m.requests,
                        successes: m.successes,
                        failures: m.failures,
                        average_latency_ms: m.average_latency_ms(),
                        error_rate: m.error_rate(),
                        last_used: m.last_used,
                        daily_used,
                        daily_limit,
                        quota_ratio,
                    },
                    None => ProviderMetricSnapshot {
                        provider: id,
                        requests: 0,
                        successes: 0,
                        failures: 0,
                        average_latency_ms: 0.0,
                        error_rate: 0.0,
                        last_used: None,
                        daily_used,
                        daily_limit,
                        quota_ratio,
                    },
                }
            })
            .collect()
    }

    /// Derive the overall verdict and alerts.
    pub fn health(&self, quotas: &HashMap<ProviderId, QuotaState>, cache: CacheStats) -> HealthReport {
        let providers = self.snapshot(quotas);
        let t = &self.thresholds;
        let mut overall = HealthStatus::Healthy;
        let mut alerts = Vec::new();

        for p in &providers {
            if p.error_rate > t.critical_error_rate {
                overall = overall.max(HealthStatus::Critical);
                alerts.push(format!(
                    "{}: error rate {:.0}% exceeds {:.0}%",
                    p.provider,
                    p.error_rate * 100.0,
                    t.critical_error_rate * 100.0
                ));
            }
            if p.average_latency_ms > t.degraded_latency_ms {
                overall = overall.max(HealthStatus::Degraded);
                alerts.push(format!(
                    "{}: average latency {:.0}ms exceeds {:.0}ms",
                    p.provider, p.average_latency_ms, t.degraded_latency_ms
                ));
            }
            if p.quota_ratio > t.degraded_quota_ratio {
                overall = overall.max(HealthStatus::Degraded);
                alerts.push(format!(
                    "{}: quota usage {}/{} ({:.0}%)",
                    p.provider,
                    p.daily_used,
                    p.daily_limit,
                    p.quota_ratio * 100.0
                ));
            }
        }

        if overall != HealthStatus::Healthy {
            warn!(overall = %overall, alerts = alerts.len(), "Provider health degraded");
        }

        HealthReport { overall, providers, cache, alerts, generated_at: Utc::now() }
    }

    /// One suggestion per provider, strongest signal first.
    pub fn recommendations(&self, quotas: &HashMap<ProviderId, QuotaState>) -> BTreeMap<ProviderId, String> {
        let t = &self.thresholds;
        self.snapshot(quotas)
            .into_iter()
            .map(|p| {
                let suggestion = if p.error_rate > t.critical_error_rate {
                    format!(
                        "Disable temporarily: {:.0}% of {} requests failed",
                        p.error_rate * 100.0,
                        p.requests
                    )
                } else if p.quota_ratio > t.degraded_quota_ratio {
                    "Increase cache TTL to conserve the remaining daily quota".to_string()
                } else if p.average_latency_ms > t.degraded_latency_ms {
                    format!("Throttle requests: average latency {:.0}ms", p.average_latency_ms)
                } else {
                    "Operating optimally".to_string()
                };
                (p.provider, suggestion)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
