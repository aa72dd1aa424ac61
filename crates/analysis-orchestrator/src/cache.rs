//! Bounded, time-expiring store of completed analyses.
//!
//! Entries expire lazily on lookup once older than the TTL. When the store grows
//! past its cap, the entry with the oldest `cached_at` is evicted (insertion order,
//! not access order).

use analysis_core::{
    AnalysisResult, Period, PriceSeries, StockSnapshot, Ticker, UserFriendlyError, UserProfile,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Fingerprint of a (ticker, profile) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn cache_key(ticker: &Ticker, profile: &UserProfile) -> CacheKey {
    CacheKey(format!(
        "{}:{}:{}:{}",
        ticker,
        profile.risk_tolerance.as_str(),
        profile.horizon.as_str(),
        profile.objective.as_str()
    ))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedRecord {
    pub snapshot: StockSnapshot,
    pub analysis: AnalysisResult,
    /// Present only when the historical join succeeded
    #[serde(default)]
    pub history: Option<BTreeMap<Period, PriceSeries>>,
    /// Why `history` is missing, replayed on every hit
    #[serde(default)]
    pub history_error: Option<UserFriendlyError>,
    pub cached_at: DateTime<Utc>,
}

impl CachedRecord {
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        now - self.cached_at
    }
}

/// Internal cache entry with insertion sequence for stable eviction order
struct CacheEntry {
    record: CachedRecord,
    seq: u64,
}

pub struct AnalysisCache {
    entries: HashMap<CacheKey, CacheEntry>,
    ttl: Duration,
    max_entries: usize,
    next_seq: u64,
}

impl AnalysisCache {
    pub fn new(ttl: std::time::Duration, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::minutes(10)),
            max_entries: max_entries.max(1),
            next_seq: 0,
        }
    }

    pub fn get(&mut self, key: &CacheKey) -> Option<&CachedRecord> {
        self.get_at(key, Utc::now())
    }

    /// Lookup against an explicit clock. Expired entries are removed and reported as a miss.
    pub fn get_at(&mut self, key: &CacheKey, now: DateTime<Utc>) -> Option<&CachedRecord> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry.record.age_at(now) > self.ttl,
            None => return None,
        };

        if expired {
            tracing::debug!("Cache entry {} expired, evicting", key);
            self.entries.remove(key);
            return None;
        }

        self.entries.get(key).map(|entry| &entry.record)
    }

    /// Insert or overwrite `key`. Returns the key evicted to stay within the cap, if any.
    pub fn put(&mut self, key: CacheKey, record: CachedRecord) -> Option<CacheKey> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(key, CacheEntry { record, seq });

        if self.entries.len() <= self.max_entries {
            return None;
        }

        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| (entry.record.cached_at, entry.seq))
            .map(|(key, _)| key.clone())?;

        tracing::debug!("Cache over capacity ({}), evicting {}", self.max_entries, oldest);
        self.entries.remove(&oldest);
        Some(oldest)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Compact age for notices: `42s`, `3m`, `2h`.
pub fn format_age(age: Duration) -> String {
    let secs = age.num_seconds().max(0);
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else {
        format!("{}h", secs / 3600)
    }
}

pub fn cache_notice(age: Duration) -> String {
    format!("Loaded from recent analysis cache ({} old)", format_age(age))
}
