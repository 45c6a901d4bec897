//! Best-effort cache for aggregate counts.
//!
//! The cache is never authoritative. Every value it holds can be rebuilt by
//! summing shards, so callers treat a missing entry, an error or a lost
//! compare-and-swap race as "fall back to the store".

use crate::error::CounterResult;
use async_trait::async_trait;
use moka::future::Cache as MokaCache;
use moka::ops::compute::{CompResult, Op};
use moka::Expiry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

/// Opaque version stamp handed out by [`CounterCache::get`] for use with
/// [`CounterCache::compare_and_swap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CasToken(u64);

impl CasToken {
    pub fn new(version: u64) -> Self {
        Self(version)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// A cached aggregate along with the token needed to replace it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedCount {
    pub value: u64,
    pub token: CasToken,
}

/// Key/value cache with expiry and compare-and-swap.
#[async_trait]
pub trait CounterCache: Send + Sync {
    async fn get(&self, key: &str) -> CounterResult<Option<CachedCount>>;

    /// Unconditionally store `value`, expiring after `ttl`.
    async fn set(&self, key: &str, value: u64, ttl: Duration) -> CounterResult<()>;

    /// Replace the value only if the entry still carries `token`.
    ///
    /// Returns `false` when the entry changed, expired or was removed since
    /// the token was issued. The entry keeps its original expiry.
    async fn compare_and_swap(&self, key: &str, token: CasToken, value: u64)
        -> CounterResult<bool>;

    async fn delete(&self, key: &str) -> CounterResult<()>;

    /// Atomically add `delta` to an existing entry, flooring at zero.
    ///
    /// Returns the new value, or `None` if the key is not cached.
    async fn increment_by(&self, key: &str, delta: i64) -> CounterResult<Option<u64>>;
}

/// Add a signed delta to a count, saturating at both ends.
pub fn apply_delta(current: u64, delta: i64) -> u64 {
    if delta >= 0 {
        current.saturating_add(delta.unsigned_abs())
    } else {
        current.saturating_sub(delta.unsigned_abs())
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    value: u64,
    version: u64,
    ttl: Duration,
    /// Whether the write that produced this slot restarts its expiry clock
    refresh_ttl: bool,
}

struct SlotExpiry;

impl Expiry<String, Slot> for SlotExpiry {
    fn expire_after_create(&self, _key: &String, slot: &Slot, _created_at: Instant) -> Option<Duration> {
        Some(slot.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        slot: &Slot,
        _updated_at: Instant,
        duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        if slot.refresh_ttl {
            Some(slot.ttl)
        } else {
            duration_until_expiry
        }
    }
}

/// In-process [`CounterCache`] backed by `moka`.
///
/// Each entry carries its own TTL and a version drawn from a cache-wide
/// sequence, which doubles as the CAS token. Every write to a key, including
/// plain sets and deletes, goes through moka's per-key compute API. moka
/// serializes those calls per key, so a compare-and-swap that matched its
/// token cannot land on top of a later set or delete. `clear` is the one
/// exception and only exists to simulate a flush.
pub struct MokaCounterCache {
    inner: MokaCache<String, Slot>,
    versions: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MokaCounterCache {
    pub fn new(max_entries: u64) -> Self {
        let inner = MokaCache::builder()
            .max_capacity(max_entries)
            .expire_after(SlotExpiry)
            .build();

        Self {
            inner,
            versions: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Drop every entry, as if the cache service had been flushed.
    pub fn clear(&self) {
        self.inner.invalidate_all();
    }

    pub async fn stats(&self) -> CacheStats {
        self.inner.run_pending_tasks().await;
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.inner.entry_count() as usize,
        }
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Default for MokaCounterCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl CounterCache for MokaCounterCache {
    async fn get(&self, key: &str) -> CounterResult<Option<CachedCount>> {
        match self.inner.get(key).await {
            Some(slot) => {
                trace!(key = key, "Cache hit");
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(CachedCount {
                    value: slot.value,
                    token: CasToken::new(slot.version),
                }))
            }
            None => {
                trace!(key = key, "Cache miss");
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: u64, ttl: Duration) -> CounterResult<()> {
        let slot = Slot {
            value,
            version: self.next_version(),
            ttl,
            refresh_ttl: true,
        };
        self.inner
            .entry(key.to_string())
            .and_compute_with(|_| std::future::ready(Op::Put(slot)))
            .await;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        token: CasToken,
        value: u64,
    ) -> CounterResult<bool> {
        let version = self.next_version();
        let result = self
            .inner
            .entry(key.to_string())
            .and_compute_with(|current| {
                let op = match current {
                    Some(entry) if entry.value().version == token.as_u64() => Op::Put(Slot {
                        value,
                        version,
                        refresh_ttl: false,
                        ..entry.into_value()
                    }),
                    _ => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;

        Ok(matches!(result, CompResult::ReplacedWith(_)))
    }

    async fn delete(&self, key: &str) -> CounterResult<()> {
        self.inner
            .entry(key.to_string())
            .and_compute_with(|current| {
                let op = if current.is_some() { Op::Remove } else { Op::Nop };
                std::future::ready(op)
            })
            .await;
        Ok(())
    }

    async fn increment_by(&self, key: &str, delta: i64) -> CounterResult<Option<u64>> {
        let version = self.next_version();
        let result = self
            .inner
            .entry(key.to_string())
            .and_compute_with(|current| {
                let op = match current {
                    Some(entry) => {
                        let slot = entry.into_value();
                        Op::Put(Slot {
                            value: apply_delta(slot.value, delta),
                            version,
                            refresh_ttl: false,
                            ..slot
                        })
                    }
                    None => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;

        match result {
            CompResult::ReplacedWith(entry) => Ok(Some(entry.value().value)),
            _ => Ok(None),
        }
    }
}

/// A cache that never holds anything.
///
/// Selected when caching is switched off; every read falls through to the
/// shards and every adjustment reports the key as missing.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledCache;

#[async_trait]
impl CounterCache for DisabledCache {
    async fn get(&self, _key: &str) -> CounterResult<Option<CachedCount>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: u64, _ttl: Duration) -> CounterResult<()> {
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        _key: &str,
        _token: CasToken,
        _value: u64,
    ) -> CounterResult<bool> {
        Ok(false)
    }

    async fn delete(&self, _key: &str) -> CounterResult<()> {
        Ok(())
    }

    async fn increment_by(&self, _key: &str, _delta: i64) -> CounterResult<Option<u64>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn test_apply_delta_saturates() {
        assert_eq!(apply_delta(5, 3), 8);
        assert_eq!(apply_delta(5, -3), 2);
        assert_eq!(apply_delta(2, -3), 0);
        assert_eq!(apply_delta(u64::MAX, 1), u64::MAX);
        assert_eq!(apply_delta(0, i64::MIN), 0);
    }

    #[tokio::test]
    async fn test_get_set_and_stats() {
        let cache = MokaCounterCache::new(10);

        assert_eq!(cache.get("c1").await.unwrap(), None);
        cache.set("c1", 42, TTL).await.unwrap();
        assert_eq!(cache.get("c1").await.unwrap().map(|c| c.value), Some(42));

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
    }

    #[tokio::test]
    async fn test_entries_expire_after_their_own_ttl() {
        let cache = MokaCounterCache::new(10);

        cache.set("short", 1, Duration::from_millis(50)).await.unwrap();
        cache.set("long", 2, TTL).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(cache.get("short").await.unwrap(), None);
        assert_eq!(cache.get("long").await.unwrap().map(|c| c.value), Some(2));
    }

    #[tokio::test]
    async fn test_compare_and_swap_requires_current_token() {
        let cache = MokaCounterCache::new(10);
        cache.set("c1", 10, TTL).await.unwrap();

        let first = cache.get("c1").await.unwrap().unwrap();
        assert!(cache.compare_and_swap("c1", first.token, 11).await.unwrap());

        // The token was consumed by the successful swap.
        assert!(!cache.compare_and_swap("c1", first.token, 99).await.unwrap());

        let second = cache.get("c1").await.unwrap().unwrap();
        assert_eq!(second.value, 11);
        assert_ne!(second.token, first.token);
    }

    #[tokio::test]
    async fn test_compare_and_swap_on_missing_key_fails() {
        let cache = MokaCounterCache::new(10);
        assert!(!cache
            .compare_and_swap("c1", CasToken::new(1), 5)
            .await
            .unwrap());
        assert_eq!(cache.get("c1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_invalidates_outstanding_tokens() {
        let cache = MokaCounterCache::new(10);
        cache.set("c1", 1, TTL).await.unwrap();
        let stale = cache.get("c1").await.unwrap().unwrap();

        cache.set("c1", 1, TTL).await.unwrap();
        assert!(!cache.compare_and_swap("c1", stale.token, 2).await.unwrap());
    }

    #[tokio::test]
    async fn test_increment_by_only_touches_existing_keys() {
        let cache = MokaCounterCache::new(10);

        assert_eq!(cache.increment_by("c1", 3).await.unwrap(), None);
        assert_eq!(cache.get("c1").await.unwrap(), None);

        cache.set("c1", 2, TTL).await.unwrap();
        assert_eq!(cache.increment_by("c1", 3).await.unwrap(), Some(5));
        assert_eq!(cache.increment_by("c1", -10).await.unwrap(), Some(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_delete_is_not_undone_by_racing_swap() {
        let cache = Arc::new(MokaCounterCache::new(10));

        for round in 0..200u64 {
            cache.set("c1", round, TTL).await.unwrap();
            let token = cache.get("c1").await.unwrap().unwrap().token;

            let swapper = {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.compare_and_swap("c1", token, round + 1).await })
            };
            cache.delete("c1").await.unwrap();
            swapper.await.unwrap().unwrap();

            assert_eq!(cache.get("c1").await.unwrap(), None, "round {}", round);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_set_is_not_overwritten_by_racing_swap() {
        let cache = Arc::new(MokaCounterCache::new(10));

        for round in 0..200u64 {
            cache.set("c1", 0, TTL).await.unwrap();
            let token = cache.get("c1").await.unwrap().unwrap().token;

            let swapper = {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.compare_and_swap("c1", token, 1).await })
            };
            cache.set("c1", 100 + round, TTL).await.unwrap();
            swapper.await.unwrap().unwrap();

            // Either the swap ran first and was overwritten, or it ran
            // second against a stale token.
            let value = cache.get("c1").await.unwrap().unwrap().value;
            assert_eq!(value, 100 + round, "round {}", round);
        }
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let cache = MokaCounterCache::new(10);
        cache.set("c1", 1, TTL).await.unwrap();
        cache.set("c2", 2, TTL).await.unwrap();

        cache.delete("c1").await.unwrap();
        cache.delete("c1").await.unwrap();
        assert_eq!(cache.get("c1").await.unwrap(), None);

        cache.clear();
        assert_eq!(cache.get("c2").await.unwrap(), None);
        assert_eq!(cache.stats().await.size, 0);
    }

    #[tokio::test]
    async fn test_disabled_cache_holds_nothing() {
        let cache = DisabledCache;
        cache.set("c1", 5, TTL).await.unwrap();
        assert_eq!(cache.get("c1").await.unwrap(), None);
        assert!(!cache
            .compare_and_swap("c1", CasToken::new(0), 1)
            .await
            .unwrap());
        assert_eq!(cache.increment_by("c1", 1).await.unwrap(), None);
    }
}
