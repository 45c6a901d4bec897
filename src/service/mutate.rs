use super::{pick_shard, validate_name, ShardedCounterService};
use crate::cache::CounterCache;
use crate::error::{CounterError, CounterResult};
use crate::queue::TaskQueue;
use crate::store::{CounterStore, Txn};
use crate::types::{Counter, CounterShard, ShardKey};
use tracing::{debug, error, trace, warn};

impl<S, C, Q> ShardedCounterService<S, C, Q>
where
    S: CounterStore,
    C: CounterCache + ?Sized,
    Q: TaskQueue + ?Sized,
{
    /// Add `amount` to one randomly chosen shard.
    ///
    /// The cached aggregate is adjusted only after the shard write has
    /// committed. If the counter was deleted while the write was in flight,
    /// the write is taken back and the call fails. The returned counter
    /// carries the adjusted count.
    pub async fn increment(&self, name: &str, amount: u64) -> CounterResult<Counter> {
        validate_name(name)?;
        if amount == 0 {
            return Err(CounterError::InvalidAmount(
                "increment amount must be greater than 0".to_string(),
            ));
        }
        let delta = i64::try_from(amount).map_err(|_| {
            CounterError::InvalidAmount(format!("increment amount {} is too large", amount))
        })?;

        let mut counter = self.load_mutable(name).await?;
        let num_shards = self.resolve_shard_count(name).await?;
        let key = ShardKey::new(name, pick_shard(num_shards));

        let shard_count = self
            .store
            .transact_shard(&key, |existing| {
                let mut shard = existing.unwrap_or_else(|| CounterShard::new(key.clone()));
                let count = shard.count.checked_add(amount).ok_or_else(|| {
                    CounterError::InvalidAmount(format!(
                        "incrementing shard {} by {} would overflow",
                        key, amount
                    ))
                })?;
                shard.set_count(count);
                Ok(Txn::Commit(shard, count))
            })
            .await?;

        if let Err(e) = self.confirm_live(&counter).await {
            self.revert_increment(&key, amount).await;
            return Err(e);
        }

        trace!(counter = name, shard = key.index, count = shard_count, "Shard incremented");
        self.metrics.counters.record_increment(amount);

        let adjustment = self.aggregator.adjust(name, delta).await;
        counter.approximate_count = adjustment.resolve(counter.approximate_count, delta);
        debug!(counter = name, amount, count = counter.approximate_count, "Incremented counter");

        Ok(counter)
    }

    /// Remove one unit from the counter.
    ///
    /// A counter whose aggregate is already zero is returned unchanged.
    pub async fn decrement(&self, name: &str) -> CounterResult<Counter> {
        self.decrement_by(name, 1).await
    }

    /// Remove up to `amount` units, one single-shard transaction per unit.
    ///
    /// `amount` may not exceed the configured `max_decrement_amount`. No more
    /// units are removed than the aggregate believes exist, so the count
    /// never goes below zero.
    pub async fn decrement_by(&self, name: &str, amount: u64) -> CounterResult<Counter> {
        validate_name(name)?;
        if amount == 0 {
            return Err(CounterError::InvalidAmount(
                "decrement amount must be greater than 0".to_string(),
            ));
        }
        if amount > self.config.max_decrement_amount {
            return Err(CounterError::InvalidAmount(format!(
                "decrement amount {} exceeds the limit of {}",
                amount, self.config.max_decrement_amount
            )));
        }

        let mut counter = self.load_mutable(name).await?;
        if counter.approximate_count == 0 {
            self.metrics.counters.record_noop_decrement();
            warn!(counter = name, "Counter is already at zero, nothing to decrement");
            return Ok(counter);
        }

        let num_shards = self.resolve_shard_count(name).await?;
        let units = amount.min(counter.approximate_count);
        let mut removed = 0u64;

        for _ in 0..units {
            match self.decrement_one(name, num_shards).await {
                Ok(index) => {
                    trace!(counter = name, shard = index, "Shard decremented");
                    removed += 1;
                    let adjustment = self.aggregator.adjust(name, -1).await;
                    counter.approximate_count =
                        adjustment.resolve(counter.approximate_count, -1);
                }
                Err(CounterError::ConsistencyAnomaly { .. }) if removed > 0 => {
                    warn!(
                        counter = name,
                        requested = units,
                        removed,
                        "Shards drained before the requested amount was removed"
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        self.metrics.counters.record_decrement(removed);
        debug!(counter = name, removed, count = counter.approximate_count, "Decremented counter");

        Ok(counter)
    }

    /// Take one unit from a random shard, scanning every shard in index
    /// order if the random pick has nothing to give.
    ///
    /// Returns the index of the shard that was decremented.
    async fn decrement_one(&self, name: &str, num_shards: u32) -> CounterResult<u32> {
        let first = pick_shard(num_shards);
        if self.decrement_shard(&ShardKey::new(name, first)).await? {
            return Ok(first);
        }

        self.metrics.counters.record_scan_fallback();
        warn!(
            counter = name,
            shard = first,
            num_shards,
            "Random shard not decrementable, scanning all shards"
        );

        for index in 0..num_shards {
            if self.decrement_shard(&ShardKey::new(name, index)).await? {
                return Ok(index);
            }
        }

        self.metrics.counters.record_consistency_anomaly();
        error!(
            counter = name,
            num_shards, "Aggregate is positive but no shard could be decremented"
        );
        self.aggregator.evict(name).await;

        Err(CounterError::ConsistencyAnomaly {
            counter: name.to_string(),
            num_shards,
        })
    }

    /// Take `amount` back off a shard written for a counter that is gone.
    ///
    /// A shard left at zero is removed rather than kept as an empty record.
    async fn revert_increment(&self, key: &ShardKey, amount: u64) {
        let reverted = self
            .store
            .transact_shard(key, |existing| match existing {
                Some(mut shard) => match shard.count.saturating_sub(amount) {
                    0 => Ok(Txn::Remove(())),
                    left => {
                        shard.set_count(left);
                        Ok(Txn::Commit(shard, ()))
                    }
                },
                None => Ok(Txn::Keep(())),
            })
            .await;

        match reverted {
            Ok(()) => debug!(
                counter = %key.counter_name,
                shard = key.index,
                amount,
                "Reverted increment"
            ),
            Err(e) => error!(
                counter = %key.counter_name,
                shard = key.index,
                amount,
                error = %e,
                "Failed to revert increment on a deleted counter"
            ),
        }
    }

    /// Single-shard decrement transaction.
    ///
    /// Returns `false` without writing when the shard is absent or at zero.
    async fn decrement_shard(&self, key: &ShardKey) -> CounterResult<bool> {
        self.store
            .transact_shard(key, |existing| match existing {
                Some(mut shard) if shard.count > 0 => {
                    shard.set_count(shard.count - 1);
                    Ok(Txn::Commit(shard, true))
                }
                _ => Ok(Txn::Keep(false)),
            })
            .await
    }
}
