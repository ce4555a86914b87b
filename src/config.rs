//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs. Every
//! section is optional and falls back to defaults. Secrets (API keys) are
//! referenced by env-var name in the config and resolved at runtime via
//! `std::env::var`, then held as `SecretString`.

use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;

use crate::types::ProviderId;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub radar: RadarConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub fresh_ttl_minutes: u64,
    pub stale_ttl_hours: u64,
    /// Per adapter call.
    pub call_timeout_secs: u64,
    /// Default caller deadline for a whole query.
    pub request_timeout_secs: u64,
    pub cache_max_entries: usize,
    pub maintenance_interval_secs: u64,
    /// Where "local midnight" falls for quota rollover.
    pub quota_utc_offset_hours: i32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            fresh_ttl_minutes: 30,
            stale_ttl_hours: 24,
            call_timeout_secs: 5,
            request_timeout_secs: 10,
            cache_max_entries: 1000,
            maintenance_interval_secs: 60,
            quota_utc_offset_hours: 9,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub priority: u32,
    pub daily_quota: u32,
    /// Name of the env var holding the API key. Keyless providers leave
    /// this unset.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl ProviderConfig {
    fn new(priority: u32, daily_quota: u32, api_key_env: Option<&str>) -> Self {
        Self { enabled: true, priority, daily_quota, api_key_env: api_key_env.map(str::to_string) }
    }
}

fn default_true() -> bool {
    true
}

fn default_kma() -> ProviderConfig {
    ProviderConfig::new(1, 10_000, Some("KMA_API_KEY"))
}

fn default_openweather() -> ProviderConfig {
    ProviderConfig::new(2, 1_000, Some("OPENWEATHER_API_KEY"))
}

fn default_weatherapi() -> ProviderConfig {
    ProviderConfig::new(3, 30_000, Some("WEATHERAPI_API_KEY"))
}

fn default_accuweather() -> ProviderConfig {
    ProviderConfig::new(4, 50, Some("ACCUWEATHER_API_KEY"))
}

fn default_open_meteo() -> ProviderConfig {
    ProviderConfig::new(5, 10_000, None)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProvidersConfig {
    #[serde(default = "default_kma")]
    pub kma: ProviderConfig,
    #[serde(default = "default_openweather")]
    pub openweather: ProviderConfig,
    #[serde(default = "default_weatherapi")]
    pub weatherapi: ProviderConfig,
    #[serde(default = "default_accuweather")]
    pub accuweather: ProviderConfig,
    #[serde(default = "default_open_meteo")]
    pub open_meteo: ProviderConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            kma: default_kma(),
            openweather: default_openweather(),
            weatherapi: default_weatherapi(),
            accuweather: default_accuweather(),
            open_meteo: default_open_meteo(),
        }
    }
}

impl ProvidersConfig {
    pub fn get(&self, id: ProviderId) -> &ProviderConfig {
        match id {
            ProviderId::Kma => &self.kma,
            ProviderId::OpenWeather => &self.openweather,
            ProviderId::WeatherApi => &self.weatherapi,
            ProviderId::AccuWeather => &self.accuweather,
            ProviderId::OpenMeteo => &self.open_meteo,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RadarConfig {
    pub enabled: bool,
    pub base_url: String,
    pub step_minutes: i64,
    pub max_attempts: u32,
}

impl Default for RadarConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://www.kma.go.kr/repositary/image/rdr/img".to_string(),
            step_minutes: 10,
            max_attempts: 12,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MonitoringConfig {
    pub latency_window: usize,
    pub critical_error_rate: f64,
    pub degraded_latency_ms: f64,
    pub degraded_quota_ratio: f64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            latency_window: 100,
            critical_error_rate: 0.5,
            degraded_latency_ms: 5000.0,
            degraded_quota_ratio: 0.9,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { enabled: true, host: "0.0.0.0".to_string(), port: 8080 }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// The API key for a provider, if its env var is configured and set
    /// to a non-empty value.
    pub fn credential(&self, id: ProviderId) -> Option<SecretString> {
        let env = self.providers.get(id).api_key_env.as_deref()?;
        Self::resolve_env(env)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(SecretString::new)
    }
}
