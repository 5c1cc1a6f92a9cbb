//! In-process fast cache in front of the lookup index.
//!
//! Entries are disposable: anything evicted or expired is re-derived from the index.

use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lru::LruCache;
use metrics::counter;
use serde::Serialize;
use time::OffsetDateTime;

use crate::domain::entities::Identity;
use crate::domain::keys::LookupKey;

use super::config::FastCacheConfig;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";

const METRIC_CACHE_HIT: &str = "offsite_cache_hit_total";
const METRIC_CACHE_MISS: &str = "offsite_cache_miss_total";
const METRIC_CACHE_EVICT: &str = "offsite_cache_evict_total";

/// Cached answer for a key; misses are remembered too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedIdentity {
    Found(Identity),
    Missing,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CachedIdentity,
    expires_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct FastCache {
    config: FastCacheConfig,
    entries: RwLock<LruCache<LookupKey, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl FastCache {
    pub fn new(config: FastCacheConfig) -> Self {
        let entries = LruCache::new(config.capacity_non_zero());
        Self {
            config,
            entries: RwLock::new(entries),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &LookupKey) -> Option<CachedIdentity> {
        self.get_at(key, OffsetDateTime::now_utc())
    }

    /// Look up `key` as of `now`; an expired entry is dropped and reported as a miss.
    pub fn get_at(&self, key: &LookupKey, now: OffsetDateTime) -> Option<CachedIdentity> {
        if !self.config.enabled {
            return None;
        }

        let mut entries = rw_write(&self.entries, SOURCE, "get");
        let value = match entries.get(key).map(|entry| (entry.value, entry.expires_at)) {
            Some((value, expires_at)) if expires_at > now => Some(value),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        };
        drop(entries);

        match value {
            Some(_) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_CACHE_HIT).increment(1);
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_CACHE_MISS).increment(1);
            }
        }
        value
    }

    pub fn put_found(&self, key: LookupKey, identity: Identity) {
        let ttl = self.config.positive_ttl;
        self.put(key, CachedIdentity::Found(identity), Some(ttl));
    }

    /// Remember a miss for `key`. A live positive entry is never downgraded.
    pub fn put_missing(&self, key: LookupKey) {
        if !self.config.enabled {
            return;
        }

        let now = OffsetDateTime::now_utc();
        let expires_at = now + self.config.effective_ttl(Some(self.config.negative_ttl));
        let mut entries = rw_write(&self.entries, SOURCE, "put_missing");
        let answered = entries.peek(&key).is_some_and(|entry| {
            matches!(entry.value, CachedIdentity::Found(_)) && entry.expires_at > now
        });
        if answered {
            return;
        }
        let evicted = entries
            .push(
                key.clone(),
                CacheEntry {
                    value: CachedIdentity::Missing,
                    expires_at,
                },
            )
            .filter(|(evicted_key, _)| *evicted_key != key);
        drop(entries);
        self.record_eviction(evicted.is_some());
    }

    /// Store a value; `None` stores it for the maximum lifetime.
    pub fn put(&self, key: LookupKey, value: CachedIdentity, ttl: Option<Duration>) {
        if !self.config.enabled {
            return;
        }

        let expires_at = OffsetDateTime::now_utc() + self.config.effective_ttl(ttl);
        let evicted = rw_write(&self.entries, SOURCE, "put")
            .push(key.clone(), CacheEntry { value, expires_at })
            .filter(|(evicted_key, _)| *evicted_key != key);
        self.record_eviction(evicted.is_some());
    }

    fn record_eviction(&self, evicted: bool) {
        if evicted {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_CACHE_EVICT).increment(1);
        }
    }

    pub fn clear(&self) {
        rw_write(&self.entries, SOURCE, "clear").clear();
    }

    /// Drop every entry whose expiry is at or before `now`, returning how many went.
    pub fn purge_expired(&self, now: OffsetDateTime) -> usize {
        let mut entries = rw_write(&self.entries, SOURCE, "purge_expired");
        let expired: Vec<LookupKey> = entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
