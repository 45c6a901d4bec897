//! Fault injection and cache-flush patterns

use async_trait::async_trait;
use sharded_counter::error::{CounterError, CounterResult};
use sharded_counter::store::{CounterStore, MemoryStore, Txn};
use sharded_counter::types::{Counter, CounterShard, ShardKey};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

/// When a test wipes the aggregate cache relative to each mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPattern {
    Never,
    BeforeAndAfter,
    BeforeOnly,
    AfterOnly,
}

impl FlushPattern {
    pub fn before(&self) -> bool {
        matches!(self, FlushPattern::BeforeAndAfter | FlushPattern::BeforeOnly)
    }

    pub fn after(&self) -> bool {
        matches!(self, FlushPattern::BeforeAndAfter | FlushPattern::AfterOnly)
    }
}

/// What another caller does to a counter while a shard write is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardWriteRace {
    MarkDeleting,
    Purge,
    PurgeAndRecreate,
}

/// A [`MemoryStore`] that fails selected operations on demand.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    counter_reads: AtomicU64,
    failing_read: AtomicU64,
    shard_delete_failures: AtomicU32,
    shard_write_race: Mutex<Option<ShardWriteRace>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `n`th counter read from now on fail once (1-based).
    pub fn fail_counter_read(&self, n: u64) {
        let reads = self.counter_reads.load(Ordering::SeqCst);
        self.failing_read.store(reads + n, Ordering::SeqCst);
    }

    /// Make the next `n` shard deletions fail.
    pub fn fail_shard_deletes(&self, n: u32) {
        self.shard_delete_failures.store(n, Ordering::SeqCst);
    }

    /// Apply `race` to the counter right before the next shard transaction.
    pub fn race_next_shard_write(&self, race: ShardWriteRace) {
        *self.shard_write_race.lock().unwrap() = Some(race);
    }

    async fn run_race(&self, name: &str, race: ShardWriteRace) -> CounterResult<()> {
        let Some(counter) = self.inner.get_counter(name).await? else {
            return Ok(());
        };

        if race == ShardWriteRace::MarkDeleting {
            return self
                .inner
                .transact_counter(name, |existing| match existing {
                    Some(mut counter) => {
                        counter.mark_deleting();
                        Ok(Txn::Commit(counter, ()))
                    }
                    None => Ok(Txn::Keep(())),
                })
                .await;
        }

        for index in 0..counter.num_shards {
            self.inner.delete_shard(&ShardKey::new(name, index)).await?;
        }
        self.inner.delete_counter(name).await?;
        if race == ShardWriteRace::PurgeAndRecreate {
            self.inner.put_counter(Counter::new(name, counter.num_shards));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for FlakyStore {
    async fn get_counter(&self, name: &str) -> CounterResult<Option<Counter>> {
        let read = self.counter_reads.fetch_add(1, Ordering::SeqCst) + 1;
        if read == self.failing_read.load(Ordering::SeqCst) {
            return Err(CounterError::Storage("counter read timed out".to_string()));
        }
        self.inner.get_counter(name).await
    }

    async fn get_shard(&self, key: &ShardKey) -> CounterResult<Option<CounterShard>> {
        self.inner.get_shard(key).await
    }

    async fn transact_counter<T, F>(&self, name: &str, work: F) -> CounterResult<T>
    where
        T: Send,
        F: FnMut(Option<Counter>) -> CounterResult<Txn<Counter, T>> + Send,
    {
        self.inner.transact_counter(name, work).await
    }

    async fn transact_shard<T, F>(&self, key: &ShardKey, work: F) -> CounterResult<T>
    where
        T: Send,
        F: FnMut(Option<CounterShard>) -> CounterResult<Txn<CounterShard, T>> + Send,
    {
        let race = self.shard_write_race.lock().unwrap().take();
        if let Some(race) = race {
            self.run_race(&key.counter_name, race).await?;
        }
        self.inner.transact_shard(key, work).await
    }

    async fn delete_counter(&self, name: &str) -> CounterResult<()> {
        self.inner.delete_counter(name).await
    }

    async fn delete_shard(&self, key: &ShardKey) -> CounterResult<()> {
        let remaining = self.shard_delete_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.shard_delete_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(CounterError::Storage(format!("failed to delete {}", key)));
        }
        self.inner.delete_shard(key).await
    }
}
