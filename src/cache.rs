//! Bounded, TTL-keyed store of cloneable responses.
//!
//! Every read hands out a fresh copy of the stored response, never the
//! original buffer, so concurrent consumers cannot interfere. Entries
//! expire after their TTL; expired entries may still be served when the
//! caller permits stale reads (collapsed waiters and the placeholder path
//! do). Capacity is bounded by entry count with LRU eviction.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::monitoring;
use crate::response::Response;

struct CacheEntry {
    response: Response,
    expires_at: Instant,
}

impl CacheEntry {
    fn expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-process response cache.
pub struct ResponseCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl ResponseCache {
    /// Create a cache bounded to `max_size` entries.
    pub fn new(max_size: usize) -> Self {
        let capacity = NonZeroUsize::new(max_size.max(1)).expect("capacity is at least one");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Fetch a copy of the cached response for `key`.
    ///
    /// A fresh entry always yields a copy. An expired entry yields a copy
    /// only when `allow_stale` is set; otherwise it is deleted and the
    /// call records a miss.
    pub fn get(&self, key: &str, allow_stale: bool) -> Option<Response> {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get(key) else {
            monitoring::cache_lookup(monitoring::CACHE_MISS);
            return None;
        };

        if !entry.expired() {
            match entry.response.try_copy() {
                Ok(copy) => {
                    debug!(key, "cache hit");
                    monitoring::cache_lookup(monitoring::CACHE_HIT);
                    return Some(copy);
                }
                Err(_) => {
                    monitoring::cache_lookup(monitoring::CACHE_MISS);
                    return None;
                }
            }
        }

        if allow_stale {
            if let Ok(copy) = entry.response.try_copy() {
                debug!(key, "cache stale hit");
                monitoring::cache_lookup(monitoring::CACHE_STALE);
                return Some(copy);
            }
            monitoring::cache_lookup(monitoring::CACHE_MISS);
            return None;
        }

        debug!(key, "cache entry expired");
        monitoring::cache_lookup(monitoring::CACHE_EXPIRED);
        entries.pop(key);
        None
    }

    /// Store a copy of `response` under `key` for `ttl`.
    ///
    /// When the response cannot be copied (its stream was consumed) the
    /// set is skipped silently and recorded as a miss-on-write.
    pub fn set(&self, key: &str, response: &Response, ttl: Duration) {
        let copy = match response.try_copy() {
            Ok(copy) => copy,
            Err(_) => {
                debug!(key, "skipping cache write for non-copyable response");
                monitoring::cache_lookup(monitoring::CACHE_WRITE_SKIPPED);
                return;
            }
        };
        let entry = CacheEntry {
            response: copy,
            expires_at: Instant::now() + ttl,
        };
        self.entries.lock().put(key.to_string(), entry);
    }

    /// Remove an entry explicitly.
    pub fn invalidate(&self, key: &str) {
        self.entries.lock().pop(key);
    }

    /// Number of live entries, for tests and diagnostics.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
