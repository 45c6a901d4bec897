//! The sharded counter service.
//!
//! A counter's value is spread over `num_shards` independently writable shard
//! records. Writers pick a shard at random so that no single record becomes a
//! hotspot; readers get the sum, served from the aggregate cache when it is
//! warm and rebuilt from the shards when it is not.

mod delete;
mod mutate;

use crate::aggregate::CountAggregator;
use crate::cache::CounterCache;
use crate::config::{Config, ServiceConfig, ShardHintPolicy};
use crate::error::{CounterError, CounterResult};
use crate::metrics::Metrics;
use crate::queue::TaskQueue;
use crate::store::{CounterStore, Txn};
use crate::types::Counter;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Orchestrates counter lifecycle, shard mutations and the cached aggregate.
///
/// The service holds no counter state of its own; every instance sharing the
/// same store, cache and queue sees the same counters.
pub struct ShardedCounterService<S, C: ?Sized, Q: ?Sized> {
    store: Arc<S>,
    aggregator: CountAggregator<S, C>,
    queue: Arc<Q>,
    config: ServiceConfig,
    metrics: Arc<Metrics>,
}

impl<S, C, Q> ShardedCounterService<S, C, Q>
where
    S: CounterStore,
    C: CounterCache + ?Sized,
    Q: TaskQueue + ?Sized,
{
    pub fn new(
        config: &Config,
        store: Arc<S>,
        cache: Arc<C>,
        queue: Arc<Q>,
        metrics: Arc<Metrics>,
    ) -> CounterResult<Self> {
        config.service.validate()?;

        let aggregator = CountAggregator::new(
            Arc::clone(&store),
            cache,
            &config.cache,
            Arc::clone(&metrics.cache),
        );

        Ok(Self {
            store,
            aggregator,
            queue,
            config: config.service.clone(),
            metrics,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Create a counter with the configured number of initial shards.
    ///
    /// Fails with `AlreadyExists` if a record of that name exists in any
    /// status, including one still being deleted.
    pub async fn create(&self, name: &str) -> CounterResult<Counter> {
        validate_name(name)?;
        let num_shards = self.config.num_initial_shards;

        let counter = self
            .store
            .transact_counter(name, |existing| {
                if existing.is_some() {
                    return Err(CounterError::AlreadyExists(name.to_string()));
                }
                let counter = Counter::new(name, num_shards);
                Ok(Txn::Commit(counter.clone(), counter))
            })
            .await?;

        self.aggregator.prime(name).await;
        self.metrics.counters.record_create();
        info!(counter = name, num_shards, "Created counter");

        Ok(counter)
    }

    /// Look up a counter and resolve its approximate count.
    ///
    /// Returns `None` if the counter does not exist.
    pub async fn get_counter(&self, name: &str) -> CounterResult<Option<Counter>> {
        validate_name(name)?;

        let Some(mut counter) = self.store.get_counter(name).await? else {
            debug!(counter = name, "Counter not found");
            return Ok(None);
        };

        counter.approximate_count = self.aggregator.count(&counter).await?;
        Ok(Some(counter))
    }

    /// Sum a counter's shards directly, bypassing the cached aggregate.
    pub async fn reconstruct_count(&self, name: &str) -> CounterResult<Option<u64>> {
        validate_name(name)?;

        let Some(counter) = self.store.get_counter(name).await? else {
            return Ok(None);
        };
        self.aggregator
            .sum_shards(name, counter.num_shards)
            .await
            .map(Some)
    }

    /// Grow a counter by `additional` shard indices.
    ///
    /// Existing shards keep their counts; the new indices materialize on
    /// their first increment.
    pub async fn add_shards(&self, name: &str, additional: u32) -> CounterResult<Counter> {
        validate_name(name)?;
        if additional == 0 {
            return Err(CounterError::InvalidArgument(
                "number of shards to add must be greater than 0".to_string(),
            ));
        }

        let mut counter = self
            .store
            .transact_counter(name, |existing| {
                let mut counter = match existing {
                    None => return Err(CounterError::NotFound(name.to_string())),
                    Some(counter) if counter.is_deleting() => {
                        return Err(CounterError::CounterDeleting(name.to_string()))
                    }
                    Some(counter) => counter,
                };
                let num_shards = counter.num_shards.checked_add(additional).ok_or_else(|| {
                    CounterError::InvalidArgument(format!(
                        "cannot add {} shards to {} existing",
                        additional, counter.num_shards
                    ))
                })?;
                counter.set_num_shards(num_shards);
                Ok(Txn::Commit(counter.clone(), counter))
            })
            .await?;

        self.metrics.counters.record_shards_added(additional);
        info!(
            counter = name,
            added = additional,
            num_shards = counter.num_shards,
            "Added shards"
        );

        counter.approximate_count = self.aggregator.count(&counter).await?;
        Ok(counter)
    }

    /// Read the counter for a mutation, rejecting missing and deleting ones.
    async fn load_mutable(&self, name: &str) -> CounterResult<Counter> {
        match self.get_counter(name).await? {
            None => Err(CounterError::NotFound(name.to_string())),
            Some(counter) if counter.is_deleting() => {
                Err(CounterError::CounterDeleting(name.to_string()))
            }
            Some(counter) => Ok(counter),
        }
    }

    /// Re-read `loaded` after a shard write and check it is still the live,
    /// available record.
    ///
    /// A counter that is now deleting fails with `CounterDeleting`; one that
    /// was purged, or purged and created again, fails with `NotFound`. A
    /// failed read is logged and the write is kept.
    async fn confirm_live(&self, loaded: &Counter) -> CounterResult<()> {
        let name = loaded.name.as_str();
        match self.store.get_counter(name).await {
            Ok(Some(current)) if current.is_deleting() => {
                warn!(counter = name, "Counter started deleting during a shard write");
                Err(CounterError::CounterDeleting(name.to_string()))
            }
            Ok(Some(current)) if current.created_at == loaded.created_at => Ok(()),
            Ok(_) => {
                warn!(counter = name, "Counter was deleted during a shard write");
                Err(CounterError::NotFound(name.to_string()))
            }
            Err(e) => {
                warn!(counter = name, error = %e, "Could not re-check counter after a shard write");
                Ok(())
            }
        }
    }

    /// Fresh read of the shard count used to size the random pick.
    async fn resolve_shard_count(&self, name: &str) -> CounterResult<u32> {
        match self.store.get_counter(name).await {
            Ok(Some(counter)) => Ok(counter.num_shards.max(1)),
            Ok(None) => Err(CounterError::NotFound(name.to_string())),
            Err(e) => match self.config.shard_hint_policy {
                ShardHintPolicy::Strict => Err(e),
                ShardHintPolicy::DefaultOnError => {
                    warn!(
                        counter = name,
                        error = %e,
                        fallback = self.config.num_initial_shards,
                        "Could not read shard count, using configured default"
                    );
                    Ok(self.config.num_initial_shards.max(1))
                }
            },
        }
    }
}

fn validate_name(name: &str) -> CounterResult<()> {
    if name.trim().is_empty() {
        return Err(CounterError::InvalidArgument(
            "counter name must not be blank".to_string(),
        ));
    }
    Ok(())
}

/// Uniform random shard index in `0..num_shards`.
fn pick_shard(num_shards: u32) -> u32 {
    rand::thread_rng().gen_range(0..num_shards.max(1))
}
