use crate::cache::{apply_delta, CounterCache};
use crate::config::CacheConfig;
use crate::error::CounterResult;
use crate::metrics::CacheMetrics;
use crate::store::CounterStore;
use crate::types::{Counter, ShardKey};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// What happened to the cached aggregate after a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAdjustment {
    /// The cached value was updated to this amount.
    Applied(u64),
    /// Nothing was cached; the next read rebuilds the aggregate.
    Missing,
    /// Every attempt lost a race, so the entry was removed.
    Evicted,
}

impl CacheAdjustment {
    /// The value to report to the caller, `0` when nothing was applied.
    pub fn value(&self) -> u64 {
        match self {
            CacheAdjustment::Applied(value) => *value,
            CacheAdjustment::Missing | CacheAdjustment::Evicted => 0,
        }
    }

    /// Best estimate of the new aggregate, projecting `delta` onto `prior`
    /// when the cache could not be updated.
    pub fn resolve(&self, prior: u64, delta: i64) -> u64 {
        match self {
            CacheAdjustment::Applied(value) => *value,
            CacheAdjustment::Missing | CacheAdjustment::Evicted => apply_delta(prior, delta),
        }
    }
}

/// Reads and maintains the cached aggregate of each counter.
///
/// The authoritative value is always the sum of a counter's shards; the cache
/// only short-circuits that sum. Cache failures are logged and otherwise
/// absorbed.
pub struct CountAggregator<S, C: ?Sized> {
    store: Arc<S>,
    cache: Arc<C>,
    ttl: Duration,
    cas_max_attempts: u32,
    key_prefix: String,
    metrics: Arc<CacheMetrics>,
}

impl<S, C> CountAggregator<S, C>
where
    S: CounterStore,
    C: CounterCache + ?Sized,
{
    pub fn new(
        store: Arc<S>,
        cache: Arc<C>,
        config: &CacheConfig,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            store,
            cache,
            ttl: config.count_ttl(),
            cas_max_attempts: config.cas_max_attempts.max(1),
            key_prefix: config.key_prefix.clone(),
            metrics,
        }
    }

    pub fn cache_key(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix, name)
    }

    /// Resolve the aggregate for `counter`, rebuilding and caching it on a miss.
    pub async fn count(&self, counter: &Counter) -> CounterResult<u64> {
        let key = self.cache_key(&counter.name);

        match self.cache.get(&key).await {
            Ok(Some(cached)) => {
                self.metrics.record_hit();
                debug!(counter = %counter.name, count = cached.value, "Aggregate served from cache");
                return Ok(cached.value);
            }
            Ok(None) => self.metrics.record_miss(),
            Err(e) => {
                self.metrics.record_error();
                self.metrics.record_miss();
                warn!(counter = %counter.name, error = %e, "Cache read failed, summing shards");
            }
        }

        let total = self.sum_shards(&counter.name, counter.num_shards).await?;
        self.metrics.record_reconstruction(counter.num_shards);

        if let Err(e) = self.cache.set(&key, total, self.ttl).await {
            self.metrics.record_error();
            warn!(counter = %counter.name, error = %e, "Failed to cache rebuilt aggregate");
        }

        Ok(total)
    }

    /// Sum shard indices `0..num_shards`, treating absent shards as zero.
    pub async fn sum_shards(&self, name: &str, num_shards: u32) -> CounterResult<u64> {
        let mut total: u64 = 0;
        for index in 0..num_shards {
            if let Some(shard) = self.store.get_shard(&ShardKey::new(name, index)).await? {
                total = total.saturating_add(shard.count);
            }
        }
        Ok(total)
    }

    /// Seed the aggregate of a freshly created counter.
    pub async fn prime(&self, name: &str) {
        if let Err(e) = self.cache.set(&self.cache_key(name), 0, self.ttl).await {
            self.metrics.record_error();
            warn!(counter = name, error = %e, "Failed to prime cached aggregate");
        }
    }

    /// Drop the cached aggregate so the next read rebuilds it.
    pub async fn evict(&self, name: &str) {
        if let Err(e) = self.cache.delete(&self.cache_key(name)).await {
            self.metrics.record_error();
            warn!(counter = name, error = %e, "Failed to evict cached aggregate");
        }
    }

    /// Apply `delta` to the cached aggregate with optimistic retries.
    ///
    /// The result floors at zero. If nothing is cached the adjustment is
    /// skipped. If every attempt loses a race the entry is deleted so that no
    /// stale value outlives the mutation.
    pub async fn adjust(&self, name: &str, delta: i64) -> CacheAdjustment {
        let key = self.cache_key(name);

        for attempt in 1..=self.cas_max_attempts {
            let cached = match self.cache.get(&key).await {
                Ok(Some(cached)) => cached,
                Ok(None) => {
                    self.metrics.record_adjust_missing();
                    warn!(counter = name, delta, "Aggregate not cached, skipping adjustment");
                    return CacheAdjustment::Missing;
                }
                Err(e) => {
                    self.metrics.record_error();
                    debug!(counter = name, attempt, error = %e, "Cache read failed during adjustment");
                    continue;
                }
            };

            let next = apply_delta(cached.value, delta);
            match self.cache.compare_and_swap(&key, cached.token, next).await {
                Ok(true) => {
                    debug!(counter = name, delta, count = next, attempt, "Cached aggregate adjusted");
                    return CacheAdjustment::Applied(next);
                }
                Ok(false) => self.metrics.record_cas_conflict(),
                Err(e) => {
                    self.metrics.record_error();
                    debug!(counter = name, attempt, error = %e, "Cache swap failed during adjustment");
                }
            }

            tokio::task::yield_now().await;
        }

        self.metrics.record_cas_exhausted();
        error!(
            counter = name,
            delta,
            attempts = self.cas_max_attempts,
            "Could not adjust cached aggregate, evicting it"
        );
        self.evict(name).await;
        CacheAdjustment::Evicted
    }
}
