//! Response cache with per-entry TTL.
//!
//! Entries expire independently; an expired entry is never returned and is
//! evicted when a lookup finds it. The LRU bound only caps memory, expiry is
//! what bounds staleness.

use std::{
    num::NonZeroUsize,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::{call::CacheKey, core::RawPayload};

/// A cached tool response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub payload: RawPayload,
    pub created_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    #[inline]
    pub fn expires_at(&self) -> Instant {
        self.created_at + self.ttl
    }

    #[inline]
    pub fn is_valid_at(&self, now: Instant) -> bool {
        now < self.expires_at()
    }

    /// Time left before expiry.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at().saturating_duration_since(now)
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Live (unexpired) entries
    pub size: usize,
}

/// Thread-safe TTL cache bounded by an LRU cap.
pub struct CacheStore {
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
    capacity: NonZeroUsize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStore {
    const DEFAULT_MAX_ENTRIES: usize = 10_000;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_MAX_ENTRIES)
    }

    /// A capacity of zero is raised to one.
    pub fn with_capacity(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Return the entry for `key` if it has not expired.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let now = Instant::now();
        let found = {
            let mut entries = self.entries.lock();
            match entries.get(key) {
                Some(entry) if entry.is_valid_at(now) => Some(entry.clone()),
                Some(_) => {
                    entries.pop(key);
                    None
                }
                None => None,
            }
        };

        match found {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Like [`get`](Self::get) but leaves the hit/miss counters and the LRU
    /// order untouched.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        let now = Instant::now();
        self.entries
            .lock()
            .peek(key)
            .filter(|entry| entry.is_valid_at(now))
            .cloned()
    }

    /// Store `payload` under `key`, replacing any previous entry. A zero TTL
    /// stores nothing.
    pub fn put(&self, key: CacheKey, payload: RawPayload, ttl: Duration) {
        if ttl.is_zero() {
            self.entries.lock().pop(&key);
            return;
        }
        let entry = CacheEntry {
            payload,
            created_at: Instant::now(),
            ttl,
        };
        let evicted = self.entries.lock().push(key.clone(), entry);
        if let Some((evicted_key, _)) = evicted {
            if evicted_key != key {
                tracing::debug!(key = %evicted_key, "Cache full, evicted least recently used entry");
            }
        }
    }

    /// Remove one entry. Returns whether it existed.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.entries.lock().pop(key).is_some()
    }

    /// Remove every entry of one tool. Returns the number removed.
    pub fn invalidate_tool(&self, service: &str, tool: &str) -> usize {
        let mut entries = self.entries.lock();
        let doomed: Vec<CacheKey> = entries
            .iter()
            .filter(|(key, _)| key.belongs_to(service, tool))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        doomed.len()
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired: Vec<CacheKey> = entries
            .iter()
            .filter(|(_, entry)| !entry.is_valid_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    /// Remove all entries and reset the hit/miss counters.
    pub fn clear(&self) {
        self.entries.lock().clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        self.purge_expired();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.entries.lock().len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::params;

    fn key(id: &str) -> CacheKey {
        CacheKey::new("resume", "score", &params! { "id" => id })
    }

    fn payload(v: i64) -> RawPayload {
        Arc::new(json!({ "score": v }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_within_ttl() {
        let cache = CacheStore::new();
        cache.put(key("a"), payload(1), Duration::from_secs(600));

        tokio::time::advance(Duration::from_secs(599)).await;
        let entry = cache.get(&key("a")).expect("entry should still be valid");
        assert_eq!(*entry.payload, json!({ "score": 1 }));
        assert_eq!(entry.remaining(Instant::now()), Duration::from_secs(1));

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.size), (1, 0, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peek_does_not_count() {
        let cache = CacheStore::new();
        assert!(cache.peek(&key("a")).is_none());
        cache.put(key("a"), payload(1), Duration::from_millis(100));
        assert!(cache.peek(&key("a")).is_some());

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(cache.peek(&key("a")).is_none());

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_absent_and_evicted() {
        let cache = CacheStore::new();
        cache.put(key("a"), payload(1), Duration::from_millis(1));

        tokio::time::advance(Duration::from_millis(5)).await;
        assert!(cache.get(&key("a")).is_none());
        assert!(cache.is_empty());

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.size), (0, 1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_boundary_is_exclusive() {
        let cache = CacheStore::new();
        cache.put(key("a"), payload(1), Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cache.get(&key("a")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_overwrites_and_restamps() {
        let cache = CacheStore::new();
        cache.put(key("a"), payload(1), Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.put(key("a"), payload(2), Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(8)).await;

        let entry = cache.get(&key("a")).expect("restamped entry");
        assert_eq!(*entry.payload, json!({ "score": 2 }));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_zero_ttl_is_not_stored() {
        let cache = CacheStore::new();
        cache.put(key("a"), payload(1), Duration::ZERO);
        assert!(cache.get(&key("a")).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache = CacheStore::new();
        cache.put(key("a"), payload(1), Duration::from_secs(60));
        cache.put(key("b"), payload(2), Duration::from_secs(60));
        let _ = cache.get(&key("a"));

        assert!(cache.invalidate(&key("a")));
        assert!(!cache.invalidate(&key("a")));
        assert!(cache.get(&key("a")).is_none());
        assert_eq!(cache.len(), 1);

        cache.clear();
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.size), (0, 0, 0));
    }

    #[test]
    fn test_invalidate_tool() {
        let cache = CacheStore::new();
        cache.put(key("a"), payload(1), Duration::from_secs(60));
        cache.put(key("b"), payload(2), Duration::from_secs(60));
        let other = CacheKey::new("github", "fetch_repos", &params! { "username" => "alice" });
        cache.put(other.clone(), payload(3), Duration::from_secs(60));

        assert_eq!(cache.invalidate_tool("resume", "score"), 2);
        assert!(cache.get(&other).is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_lru_cap() {
        let cache = CacheStore::with_capacity(2);
        cache.put(key("a"), payload(1), Duration::from_secs(60));
        cache.put(key("b"), payload(2), Duration::from_secs(60));
        // Touch "a" so "b" is the least recently used
        assert!(cache.get(&key("a")).is_some());
        cache.put(key("c"), payload(3), Duration::from_secs(60));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key("b")).is_none());
        assert!(cache.get(&key("a")).is_some());
        assert!(cache.get(&key("c")).is_some());
        assert_eq!(cache.capacity(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_size_counts_live_entries_only() {
        let cache = CacheStore::new();
        cache.put(key("short"), payload(1), Duration::from_millis(10));
        cache.put(key("long"), payload(2), Duration::from_secs(60));
        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(cache.stats().size, 1);
    }
}
