//! Radar frame lookup.
//!
//! Radar composites are published on a fixed cadence but not always on
//! time. A request is floored to the cadence step and probed backwards one
//! step at a time until a frame is found or the attempt budget runs out.
//! Running out is a normal outcome (`NoData`), not an error.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::providers::build_client;
use crate::types::ProviderId;

/// Found frames kept in memory (two days at the default step).
const MEMO_CAPACITY: usize = 288;
const KST_OFFSET_SECS: i64 = 9 * 3600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RadarFrame {
    pub observed_at: DateTime<Utc>,
    pub image_url: String,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RadarResult {
    Frame(RadarFrame),
    NoData { requested_at: DateTime<Utc>, attempts: u32 },
}

/// A backend that can say whether a frame exists for an exact timestamp.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RadarSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` means "no frame published for this time".
    async fn probe(&self, at: DateTime<Utc>) -> Result<Option<RadarFrame>, ProviderError>;
}

/// Floor a timestamp to a multiple of `step` since the epoch.
pub fn floor_to_step(at: DateTime<Utc>, step: Duration) -> DateTime<Utc> {
    let step_secs = step.num_seconds().max(1);
    let ts = at.timestamp();
    DateTime::from_timestamp(ts - ts.rem_euclid(step_secs), 0).unwrap_or(at)
}

pub struct RadarService {
    source: Arc<dyn RadarSource>,
    step: Duration,
    max_attempts: u32,
    memo: Mutex<BTreeMap<DateTime<Utc>, RadarFrame>>,
}

impl RadarService {
    pub fn new(source: Arc<dyn RadarSource>, step: Duration, max_attempts: u32) -> Self {
        Self { source, step, max_attempts: max_attempts.max(1), memo: Mutex::new(BTreeMap::new()) }
    }

    /// Latest frame at or before `at` (default: now).
    pub async fn get_radar(&self, at: Option<DateTime<Utc>>) -> RadarResult {
        let requested = at.unwrap_or_else(Utc::now);
        let start = floor_to_step(requested, self.step);

        for attempt in 0..self.max_attempts {
            let probe_at = start - self.step * attempt as i32;

            let memoised = self.memo.lock().get(&probe_at).cloned();
            if let Some(frame) = memoised {
                debug!(timestamp = %probe_at, "Radar frame served from memo");
                return RadarResult::Frame(frame);
            }

            match self.source.probe(probe_at).await {
                Ok(Some(frame)) => {
                    debug!(source = self.source.name(), timestamp = %probe_at, attempt, "Radar frame found");
                    self.remember(probe_at, frame.clone());
                    return RadarResult::Frame(frame);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(source = self.source.name(), timestamp = %probe_at, error = %e, "Radar probe failed");
                }
            }
        }

        debug!(source = self.source.name(), requested = %requested, attempts = self.max_attempts, "No radar data");
        RadarResult::NoData { requested_at: requested, attempts: self.max_attempts }
    }

    fn remember(&self, at: DateTime<Utc>, frame: RadarFrame) {
        let mut memo = self.memo.lock();
        memo.insert(at, frame);
        while memo.len() > MEMO_CAPACITY {
            memo.pop_first();
        }
    }
}

// ---------------------------------------------------------------------------
// KMA radar composite
// ---------------------------------------------------------------------------

/// Probes KMA composite images whose names carry the KST time as
/// `YYYYMMDDHHmm`.
pub struct KmaRadarSource {
    http: Client,
    base_url: String,
}

impl KmaRadarSource {
    pub fn new(base_url: impl Into<String>, timeout: std::time::Duration) -> anyhow::Result<Self> {
        Ok(Self { http: build_client(ProviderId::Kma, timeout)?, base_url: base_url.into() })
    }

    pub fn frame_url(&self, at: DateTime<Utc>) -> String {
        let kst = at.naive_utc() + Duration::seconds(KST_OFFSET_SECS);
        format!("{}/RDR_CMP_WRC_{}.png", self.base_url.trim_end_matches('/'), kst.format("%Y%m%d%H%M"))
    }
}

#[async_trait]
impl RadarSource for KmaRadarSource {
    fn name(&self) -> &'static str {
        "kma-radar"
    }

    async fn probe(&self, at: DateTime<Utc>) -> Result<Option<RadarFrame>, ProviderError> {
        let url = self.frame_url(at);
        let resp = self
            .http
            .head(&url)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(ProviderId::Kma, e))?;
        match resp.status() {
            s if s.is_success() => Ok(Some(RadarFrame { observed_at: at, image_url: url, source: self.name().to_string() })),
            StatusCode::NOT_FOUND => Ok(None),
            s => Err(ProviderError::from_status(ProviderId::Kma, s)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
