//! Resolved-URL TTL cache
//!
//! Entries are keyed by `(source, source_id)` and carry the per-source TTL
//! chosen at resolve time. An entry past 80% of its TTL is still served but
//! flagged for proactive refresh; an entry past its full TTL is never
//! served. The map is bounded; overflow evicts the least recently used
//! entry.

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Default bound on cached URLs across all sources
pub const DEFAULT_CACHE_CAPACITY: usize = 4096;

/// Fraction of the TTL after which a background refresh is scheduled
const REFRESH_FRACTION: f64 = 0.8;

/// A cached resolved URL
#[derive(Debug, Clone)]
pub struct CachedUrl {
    pub url: String,
    pub fetched_at: Instant,
    /// `None` means the entry never expires (local files, direct HTTP)
    pub ttl: Option<Duration>,
    last_access: Instant,
}

impl CachedUrl {
    fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    /// Entry is inside its hard TTL
    pub fn is_fresh(&self) -> bool {
        match self.ttl {
            None => true,
            Some(ttl) => self.age() < ttl,
        }
    }

    /// Entry has crossed the proactive-refresh threshold
    pub fn wants_refresh(&self) -> bool {
        match self.ttl {
            None => false,
            Some(ttl) => self.age().as_secs_f64() > ttl.as_secs_f64() * REFRESH_FRACTION,
        }
    }
}

/// Thread-safe bounded TTL cache of resolved URLs
pub struct UrlCache {
    entries: DashMap<(String, String), CachedUrl>,
    capacity: usize,
}

impl UrlCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
        }
    }

    /// Look up a fresh entry, updating its recency.
    ///
    /// Returns `(url, wants_refresh)`; a hard-expired entry is removed and
    /// reported as a miss.
    pub fn get(&self, source: &str, source_id: &str) -> Option<(String, bool)> {
        let key = (source.to_string(), source_id.to_string());
        let mut expired = false;
        let result = self.entries.get_mut(&key).and_then(|mut entry| {
            if entry.is_fresh() {
                entry.last_access = Instant::now();
                Some((entry.url.clone(), entry.wants_refresh()))
            } else {
                expired = true;
                None
            }
        });
        if expired {
            self.entries.remove(&key);
        }
        result
    }

    /// Insert or replace an entry, evicting the LRU entry on overflow
    pub fn insert(&self, source: &str, source_id: &str, url: String, ttl: Option<Duration>) {
        let key = (source.to_string(), source_id.to_string());
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict_lru();
        }
        let now = Instant::now();
        self.entries.insert(
            key,
            CachedUrl {
                url,
                fetched_at: now,
                ttl,
                last_access: now,
            },
        );
    }

    /// Drop an entry (expired token URL, failed playback)
    pub fn invalidate(&self, source: &str, source_id: &str) {
        self.entries
            .remove(&(source.to_string(), source_id.to_string()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_lru(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().last_access)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

impl Default for UrlCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}
