//! Per-provider daily quota tracking.
//!
//! Each provider has a daily request budget that rolls over at local
//! midnight. Rollover is lazy: whichever operation first observes
//! `now >= reset_at` zeroes the counter and advances the boundary. All
//! state sits behind one mutex so check-and-increment is atomic across
//! concurrent queries.

use chrono::{DateTime, Duration, FixedOffset, Timelike, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::types::{ProviderDescriptor, ProviderId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaState {
    pub used: u32,
    pub limit: u32,
    pub reset_at: DateTime<Utc>,
}

impl QuotaState {
    fn new(limit: u32, reset_at: DateTime<Utc>) -> Self {
        Self { used: 0, limit, reset_at }
    }

    /// Fraction of the daily budget consumed (0.0–1.0).
    pub fn usage_ratio(&self) -> f64 {
        if self.limit == 0 {
            1.0
        } else {
            self.used as f64 / self.limit as f64
        }
    }

    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used)
    }

    /// Returns true if a rollover happened.
    fn roll_over(&mut self, now: DateTime<Utc>, offset: FixedOffset) -> bool {
        if now < self.reset_at {
            return false;
        }
        self.used = 0;
        self.reset_at = next_local_midnight(now, offset);
        true
    }
}

/// Tracks daily usage for every configured provider.
#[derive(Debug)]
pub struct QuotaTracker {
    offset: FixedOffset,
    states: Mutex<HashMap<ProviderId, QuotaState>>,
}

impl QuotaTracker {
    /// Create a tracker for the given providers. `offset` defines where
    /// "local midnight" falls.
    pub fn new(descriptors: &[ProviderDescriptor], offset: FixedOffset) -> Self {
        Self::new_at(descriptors, offset, Utc::now())
    }

    pub fn new_at(descriptors: &[ProviderDescriptor], offset: FixedOffset, now: DateTime<Utc>) -> Self {
        let reset_at = next_local_midnight(now, offset);
        let states = descriptors
            .iter()
            .map(|d| (d.id, QuotaState::new(d.daily_quota, reset_at)))
            .collect();
        Self { offset, states: Mutex::new(states) }
    }

    /// Whether the provider has budget left. Unknown providers never do.
    pub fn can_use(&self, provider: ProviderId) -> bool {
        self.can_use_at(provider, Utc::now())
    }

    pub fn can_use_at(&self, provider: ProviderId, now: DateTime<Utc>) -> bool {
        let mut states = self.states.lock();
        match states.get_mut(&provider) {
            Some(state) => {
                self.roll_over_logged(provider, state, now);
                state.used < state.limit
            }
            None => false,
        }
    }

    /// Count one attempted call. Saturates at the limit; callers that go
    /// through [`try_acquire`](Self::try_acquire) never reach it.
    pub fn record_use(&self, provider: ProviderId) {
        self.record_use_at(provider, Utc::now());
    }

    pub fn record_use_at(&self, provider: ProviderId, now: DateTime<Utc>) {
        let mut states = self.states.lock();
        if let Some(state) = states.get_mut(&provider) {
            self.roll_over_logged(provider, state, now);
            state.used = state.used.saturating_add(1).min(state.limit);
        }
    }

    /// Check and count one call in a single critical section. Returns
    /// false (and counts nothing) when the budget is spent.
    pub fn try_acquire(&self, provider: ProviderId) -> bool {
        self.try_acquire_at(provider, Utc::now())
    }

    pub fn try_acquire_at(&self, provider: ProviderId, now: DateTime<Utc>) -> bool {
        let mut states = self.states.lock();
        let Some(state) = states.get_mut(&provider) else {
            return false;
        };
        self.roll_over_logged(provider, state, now);
        if state.used >= state.limit {
            return false;
        }
        state.used += 1;
        debug!(provider = %provider, used = state.used, limit = state.limit, "Quota consumed");
        true
    }

    /// Time left until the provider's counter resets.
    pub fn time_until_reset(&self, provider: ProviderId) -> std::time::Duration {
        self.time_until_reset_at(provider, Utc::now())
    }

    pub fn time_until_reset_at(&self, provider: ProviderId, now: DateTime<Utc>) -> std::time::Duration {
        let mut states = self.states.lock();
        let reset_at = match states.get_mut(&provider) {
            Some(state) => {
                self.roll_over_logged(provider, state, now);
                state.reset_at
            }
            None => next_local_midnight(now, self.offset),
        };
        (reset_at - now).to_std().unwrap_or_default()
    }

    /// Roll over every provider whose boundary has passed. Returns the
    /// providers that were reset so their metrics can be reset too.
    pub fn roll_over_expired(&self) -> Vec<ProviderId> {
        self.roll_over_expired_at(Utc::now())
    }

    pub fn roll_over_expired_at(&self, now: DateTime<Utc>) -> Vec<ProviderId> {
        let mut states = self.states.lock();
        let mut rolled: Vec<ProviderId> = states
            .iter_mut()
            .filter_map(|(id, state)| self.roll_over_logged(*id, state, now).then_some(*id))
            .collect();
        rolled.sort();
        rolled
    }

    pub fn state(&self, provider: ProviderId) -> Option<QuotaState> {
        self.states.lock().get(&provider).copied()
    }

    /// Copy of every provider's state, for monitoring.
    pub fn snapshot(&self) -> HashMap<ProviderId, QuotaState> {
        self.states.lock().clone()
    }

    fn roll_over_logged(&self, provider: ProviderId, state: &mut QuotaState, now: DateTime<Utc>) -> bool {
        let previous = state.used;
        let rolled = state.roll_over(now, self.offset);
        if rolled {
            info!(provider = %provider, previous_used = previous, next_reset = %state.reset_at, "Quota rolled over");
        }
        rolled
    }
}

/// The first local midnight strictly after `now`.
pub fn next_local_midnight(now: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
    let local = now.with_timezone(&offset);
    let since_midnight = Duration::seconds(local.num_seconds_from_midnight() as i64)
        + Duration::nanoseconds(local.nanosecond() as i64);
    now - since_midnight + Duration::days(1)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
