//! Keyed TTL cache with single-flight fills
//!
//! Backs both the bearer-token cache (one fixed key) and the device-record
//! cache (one key per device). Each key owns an async slot lock: the first
//! caller to miss runs the fetch while later callers for the same key wait
//! on the slot and then read the stored value. Different keys never wait
//! on each other.
//!
//! Expired entries are never served; they are dropped on the next access
//! (or by [`TtlCache::evict_expired`]). Failed fetches store nothing.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;

/// A cached value with its absolute expiry
#[derive(Debug, Clone)]
pub struct CachedEntry<T> {
    value: T,
    expires_at: Instant,
}

impl<T> CachedEntry<T> {
    /// Create an entry that expires `ttl` from now
    pub fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    /// An entry is a hit strictly before its expiry instant
    pub fn is_fresh_at(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    /// Check freshness against the current time
    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(Instant::now())
    }

    /// The cached value
    pub fn value(&self) -> &T {
        &self.value
    }

    /// When this entry stops being served
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }
}

type Slot<T> = Arc<Mutex<Option<CachedEntry<T>>>>;

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Lookups answered from a fresh entry
    pub hits: AtomicU64,
    /// Lookups that had to run the fetch
    pub misses: AtomicU64,
    /// Expired or invalidated entries removed
    pub evictions: AtomicU64,
    /// Fetches that returned an error
    pub fetch_failures: AtomicU64,
}

impl CacheStats {
    /// Get current cache hit count
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get current cache miss count
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Get current eviction count
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Get current failed-fetch count
    pub fn fetch_failures(&self) -> u64 {
        self.fetch_failures.load(Ordering::Relaxed)
    }

    /// Calculate hit rate as a fraction (0.0-1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Thread-safe keyed cache with a fixed TTL per instance
pub struct TtlCache<T> {
    slots: DashMap<String, Slot<T>>,
    ttl: Duration,
    stats: CacheStats,
}

impl<T> TtlCache<T>
where
    T: Clone + Send + Sync,
{
    /// Create an empty cache whose entries live for `ttl`
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            ttl,
            stats: CacheStats::default(),
        }
    }

    fn slot(&self, key: &str) -> Slot<T> {
        if let Some(slot) = self.slots.get(key) {
            return Arc::clone(slot.value());
        }
        Arc::clone(
            self.slots
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .value(),
        )
    }

    /// Return the fresh value for `key`, or run `fetch` and store its result.
    ///
    /// Concurrent callers for the same key are serialised on the key's slot,
    /// so at most one `fetch` runs per key at a time and waiters observe the
    /// value it stored. On error nothing is stored and the error is returned
    /// to this caller only; the next caller runs its own fetch.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: &str, fetch: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;

        if let Some(entry) = guard.as_ref() {
            if entry.is_fresh() {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.value.clone());
            }
            *guard = None;
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        match fetch().await {
            Ok(value) => {
                *guard = Some(CachedEntry::new(value.clone(), self.ttl));
                Ok(value)
            }
            Err(e) => {
                self.stats.fetch_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Read a fresh value without fetching. Waits for an in-flight fill.
    pub async fn get(&self, key: &str) -> Option<T> {
        let slot = self.slots.get(key).map(|s| Arc::clone(s.value()))?;
        let guard = slot.lock().await;
        guard
            .as_ref()
            .filter(|entry| entry.is_fresh())
            .map(|entry| entry.value.clone())
    }

    /// Drop the entry for `key` if `predicate` accepts its value.
    ///
    /// Returns `true` if an entry was removed. Passing the stale value's
    /// identity in the predicate avoids discarding a replacement that
    /// another caller stored in the meantime.
    pub async fn invalidate_if<P>(&self, key: &str, predicate: P) -> bool
    where
        P: FnOnce(&T) -> bool,
    {
        let Some(slot) = self.slots.get(key).map(|s| Arc::clone(s.value())) else {
            return false;
        };
        let mut guard = slot.lock().await;
        if guard.as_ref().is_some_and(|entry| predicate(&entry.value)) {
            *guard = None;
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Remove idle slots whose entry is expired or empty (background maintenance).
    ///
    /// Slots that are locked or referenced by an in-flight lookup are kept.
    pub fn evict_expired(&self) {
        let now = Instant::now();
        let mut evicted = 0u64;
        self.slots.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            let Ok(guard) = slot.try_lock() else {
                return true;
            };
            match guard.as_ref() {
                Some(entry) if entry.is_fresh_at(now) => true,
                Some(_) => {
                    evicted += 1;
                    false
                }
                None => false,
            }
        });
        if evicted > 0 {
            self.stats.evictions.fetch_add(evicted, Ordering::Relaxed);
        }
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits(),
            misses: self.stats.misses(),
            evictions: self.stats.evictions(),
            fetch_failures: self.stats.fetch_failures(),
            keys: self.slots.len(),
            hit_rate: self.stats.hit_rate(),
            ttl_secs: self.ttl.as_secs(),
        }
    }
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStatsSnapshot {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses
    pub misses: u64,
    /// Total evictions
    pub evictions: u64,
    /// Total failed fetches (never cached)
    pub fetch_failures: u64,
    /// Number of tracked keys
    pub keys: usize,
    /// Hit rate (0.0-1.0)
    pub hit_rate: f64,
    /// Configured TTL in seconds
    pub ttl_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_fetch<'a>(
        calls: &'a AtomicUsize,
        value: &'static str,
    ) -> impl Future<Output = Result<String, String>> + 'a {
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(value.to_string())
        }
    }

    #[test]
    fn entry_is_hit_strictly_before_expiry() {
        let entry = CachedEntry::new(1, Duration::from_secs(60));
        assert!(entry.is_fresh_at(entry.expires_at() - Duration::from_secs(1)));
        assert!(!entry.is_fresh_at(entry.expires_at()));
        assert!(!entry.is_fresh_at(entry.expires_at() + Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn second_lookup_within_ttl_does_not_fetch() {
        let cache = TtlCache::new(Duration::from_secs(300));
        let calls = AtomicUsize::new(0);

        let first = cache
            .get_or_fetch("device-1", || counting_fetch(&calls, "a"))
            .await
            .unwrap();
        let second = cache
            .get_or_fetch("device-1", || counting_fetch(&calls, "b"))
            .await
            .unwrap();

        assert_eq!(first, "a");
        assert_eq!(second, "a");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn expired_entry_is_refetched_once() {
        let cache = TtlCache::new(Duration::from_millis(10));
        let calls = AtomicUsize::new(0);

        cache
            .get_or_fetch("k", || counting_fetch(&calls, "old"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let refreshed = cache
            .get_or_fetch("k", || counting_fetch(&calls, "new"))
            .await
            .unwrap();

        assert_eq!(refreshed, "new");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached() {
        let cache: TtlCache<String> = TtlCache::new(Duration::from_secs(300));
        let calls = AtomicUsize::new(0);

        let err = cache
            .get_or_fetch("k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>("boom")
            })
            .await;
        assert_eq!(err, Err("boom"));
        assert_eq!(cache.get("k").await, None);

        let ok = cache
            .get_or_fetch("k", || counting_fetch(&calls, "recovered"))
            .await
            .unwrap();
        assert_eq!(ok, "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().fetch_failures, 1);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let cache = TtlCache::new(Duration::from_secs(300));
        let calls = AtomicUsize::new(0);

        cache.get_or_fetch("a", || counting_fetch(&calls, "A")).await.unwrap();
        let b = cache
            .get_or_fetch("b", || counting_fetch(&calls, "B"))
            .await
            .unwrap();

        assert_eq!(b, "B");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().keys, 2);
    }

    #[tokio::test]
    async fn concurrent_misses_for_same_key_fetch_once() {
        let cache = Arc::new(TtlCache::new(Duration::from_secs(300)));
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    cache
                        .get_or_fetch("shared", || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok::<_, String>("value".to_string())
                        })
                        .await
                })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            assert_eq!(result.unwrap().unwrap(), "value");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_fill_does_not_block_other_keys() {
        let cache = Arc::new(TtlCache::new(Duration::from_secs(300)));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let slow_cache = Arc::clone(&cache);
        let slow = tokio::spawn(async move {
            slow_cache
                .get_or_fetch("slow", || async move {
                    let _ = release_rx.await;
                    Ok::<_, String>("slow".to_string())
                })
                .await
        });

        // The "slow" slot stays locked until released; "fast" must still complete.
        let fast = tokio::time::timeout(
            Duration::from_secs(1),
            cache.get_or_fetch("fast", || async { Ok::<_, String>("fast".to_string()) }),
        )
        .await
        .expect("fast key waited on slow key");
        assert_eq!(fast.unwrap(), "fast");

        release_tx.send(()).unwrap();
        assert_eq!(slow.await.unwrap().unwrap(), "slow");
    }

    #[tokio::test]
    async fn invalidate_if_respects_predicate() {
        let cache = TtlCache::new(Duration::from_secs(300));
        cache
            .get_or_fetch("token", || async { Ok::<_, String>("t1".to_string()) })
            .await
            .unwrap();

        assert!(!cache.invalidate_if("token", |v| v == "t0").await);
        assert_eq!(cache.get("token").await.as_deref(), Some("t1"));

        assert!(cache.invalidate_if("token", |v| v == "t1").await);
        assert_eq!(cache.get("token").await, None);
        assert!(!cache.invalidate_if("missing", |_| true).await);
    }

    #[tokio::test]
    async fn evict_expired_keeps_fresh_entries() {
        let cache = TtlCache::new(Duration::from_millis(10));
        cache
            .get_or_fetch("short", || async { Ok::<_, String>(1) })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let long = TtlCache::new(Duration::from_secs(60));
        long.get_or_fetch("long", || async { Ok::<_, String>(2) })
            .await
            .unwrap();

        cache.evict_expired();
        long.evict_expired();

        assert_eq!(cache.stats().keys, 0);
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(long.get("long").await, Some(2));
    }
}
