//! Two-track weather cache.
//!
//! Every successful fetch is written to a short-TTL "fresh" track and a
//! long-TTL "stale" track at the same time. Normal reads only look at the
//! fresh track; the stale track is the emergency path used when every
//! provider has failed. Expiry is checked on read, a periodic sweep bounds
//! memory, and a hard entry ceiling evicts the least recently accessed key.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::types::CanonicalWeatherRecord;

#[derive(Debug, Clone)]
struct CacheEntry {
    record: Arc<CanonicalWeatherRecord>,
    inserted_at: DateTime<Utc>,
    ttl: Duration,
}

impl CacheEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now - self.inserted_at < self.ttl
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Number of keys held (stale track is a superset of fresh).
    pub size: usize,
    pub evictions: u64,
}

impl CacheStats {
    /// Hit rate as a fraction (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    fresh: HashMap<String, CacheEntry>,
    stale: HashMap<String, CacheEntry>,
    last_access: HashMap<String, DateTime<Utc>>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheInner {
    fn remove_key(&mut self, key: &str) {
        self.fresh.remove(key);
        self.stale.remove(key);
        self.last_access.remove(key);
    }

    fn evict_lru(&mut self) -> Option<String> {
        let victim = self
            .last_access
            .iter()
            .min_by_key(|(_, at)| **at)
            .map(|(k, _)| k.clone())?;
        self.remove_key(&victim);
        self.evictions += 1;
        Some(victim)
    }
}

/// Thread-safe in-memory cache of canonical records.
#[derive(Debug)]
pub struct CacheStore {
    max_entries: usize,
    inner: Mutex<CacheInner>,
}

impl CacheStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Fresh read. Counts towards hit/miss statistics.
    pub fn get_fresh(&self, key: &str) -> Option<Arc<CanonicalWeatherRecord>> {
        self.get_fresh_at(key, Utc::now())
    }

    pub fn get_fresh_at(&self, key: &str, now: DateTime<Utc>) -> Option<Arc<CanonicalWeatherRecord>> {
        let mut inner = self.inner.lock();
        let lookup = inner.fresh.get(key).map(|e| (e.is_live(now), Arc::clone(&e.record)));
        let found = match lookup {
            Some((true, record)) => Some(record),
            Some((false, _)) => {
                inner.fresh.remove(key);
                None
            }
            None => None,
        };
        match found {
            Some(record) => {
                inner.hits += 1;
                inner.last_access.insert(key.to_string(), now);
                Some(record)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Emergency read of the long-TTL track. Does not touch statistics.
    pub fn get_stale(&self, key: &str) -> Option<Arc<CanonicalWeatherRecord>> {
        self.get_stale_at(key, Utc::now())
    }

    pub fn get_stale_at(&self, key: &str, now: DateTime<Utc>) -> Option<Arc<CanonicalWeatherRecord>> {
        let mut inner = self.inner.lock();
        let lookup = inner.stale.get(key).map(|e| (e.is_live(now), Arc::clone(&e.record)));
        match lookup {
            Some((true, record)) => Some(record),
            Some((false, _)) => {
                inner.remove_key(key);
                None
            }
            None => None,
        }
    }

    /// Write a record to both tracks.
    pub fn set_both(&self, key: &str, record: CanonicalWeatherRecord, fresh_ttl: Duration, stale_ttl: Duration) {
        self.set_both_at(key, Arc::new(record), fresh_ttl, stale_ttl, Utc::now());
    }

    pub fn set_both_at(
        &self,
        key: &str,
        record: Arc<CanonicalWeatherRecord>,
        fresh_ttl: Duration,
        stale_ttl: Duration,
        now: DateTime<Utc>,
    ) {
        let mut inner = self.inner.lock();
        let is_new = !inner.stale.contains_key(key);
        if is_new && inner.stale.len() >= self.max_entries {
            if let Some(victim) = inner.evict_lru() {
                debug!(evicted = %victim, "Cache at capacity, evicted least recently used key");
            }
        }
        inner.fresh.insert(
            key.to_string(),
            CacheEntry { record: Arc::clone(&record), inserted_at: now, ttl: fresh_ttl },
        );
        inner.stale.insert(key.to_string(), CacheEntry { record, inserted_at: now, ttl: stale_ttl });
        inner.last_access.insert(key.to_string(), now);
    }

    /// Remove expired entries from both tracks. Returns how many keys were
    /// dropped entirely.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock();
        inner.fresh.retain(|_, e| e.is_live(now));
        let before = inner.stale.len();
        inner.stale.retain(|_, e| e.is_live(now));
        let CacheInner { stale, last_access, .. } = &mut *inner;
        last_access.retain(|k, _| stale.contains_key(k));
        before - inner.stale.len()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            size: inner.stale.len(),
            evictions: inner.evictions,
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.fresh.clear();
        inner.stale.clear();
        inner.last_access.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
