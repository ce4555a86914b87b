//! Error taxonomy.
//!
//! `ProviderError` never escapes the orchestrator: it is converted into a
//! fallback attempt and only shows up again inside
//! [`WeatherError::AllProvidersExhausted`]. Quota exhaustion is not an error
//! at all; it is logged and the provider is skipped.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::types::ProviderId;

/// Why a single adapter call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    Network,
    Auth,
    RateLimited,
    NotFound,
    Parse,
    Timeout,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderErrorKind::Network => "network",
            ProviderErrorKind::Auth => "auth",
            ProviderErrorKind::RateLimited => "rate limited",
            ProviderErrorKind::NotFound => "not found",
            ProviderErrorKind::Parse => "parse",
            ProviderErrorKind::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// One adapter's call failed.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("Provider error ({provider}, {kind}): {message}")]
pub struct ProviderError {
    pub provider: ProviderId,
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(provider: ProviderId, kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self { provider, kind, message: message.into() }
    }

    pub fn network(provider: ProviderId, message: impl Into<String>) -> Self {
        Self::new(provider, ProviderErrorKind::Network, message)
    }

    pub fn parse(provider: ProviderId, message: impl Into<String>) -> Self {
        Self::new(provider, ProviderErrorKind::Parse, message)
    }

    pub fn not_found(provider: ProviderId, message: impl Into<String>) -> Self {
        Self::new(provider, ProviderErrorKind::NotFound, message)
    }

    pub fn timeout(provider: ProviderId, after: Duration) -> Self {
        Self::new(
            provider,
            ProviderErrorKind::Timeout,
            format!("no response within {}ms", after.as_millis()),
        )
    }

    /// Classify a transport-level reqwest failure. The request URL is
    /// stripped from the message since it may carry an API key.
    pub fn from_reqwest(provider: ProviderId, err: reqwest::Error) -> Self {
        let err = err.without_url();
        if err.is_timeout() {
            Self::new(provider, ProviderErrorKind::Timeout, err.to_string())
        } else if err.is_decode() {
            Self::parse(provider, err.to_string())
        } else {
            Self::network(provider, err.to_string())
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(provider: ProviderId, status: reqwest::StatusCode) -> Self {
        let kind = match status.as_u16() {
            401 | 403 => ProviderErrorKind::Auth,
            404 => ProviderErrorKind::NotFound,
            429 => ProviderErrorKind::RateLimited,
            _ => ProviderErrorKind::Network,
        };
        Self::new(provider, kind, format!("HTTP {status}"))
    }
}

/// Errors surfaced to callers of the aggregator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WeatherError {
    /// Every eligible provider failed or was over quota and no stale
    /// cache entry exists.
    #[error("All providers exhausted for '{query}' ({} attempt(s) failed)", .attempts.len())]
    AllProvidersExhausted { query: String, attempts: Vec<ProviderError> },

    /// A domestic text query could not be matched in the gazetteer.
    #[error("Unresolved location: {0}")]
    UnresolvedLocation(String),

    /// The caller's deadline elapsed and there was no stale data to serve.
    #[error("Deadline of {}ms exceeded for '{query}'", .deadline.as_millis())]
    DeadlineExceeded { query: String, deadline: Duration },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WeatherError {
    /// Short machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            WeatherError::AllProvidersExhausted { .. } => "all_providers_exhausted",
            WeatherError::UnresolvedLocation(_) => "unresolved_location",
            WeatherError::DeadlineExceeded { .. } => "deadline_exceeded",
            WeatherError::Internal(_) => "internal",
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
