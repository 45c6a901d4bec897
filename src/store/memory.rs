use super::{CounterStore, Txn};
use crate::error::{CounterError, CounterResult};
use crate::types::{Counter, CounterShard, ShardKey};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// A record tagged with the store-wide version it was written at.
#[derive(Debug, Clone)]
struct Versioned<R> {
    version: u64,
    record: R,
}

/// In-memory storage backend with optimistic single-key transactions.
///
/// Every write is stamped with a version drawn from one store-wide sequence,
/// so a version is never reused even after a key is deleted and recreated.
/// A transaction commits only if the key still carries the version it read;
/// otherwise the body is re-run against the fresh record, up to
/// `max_attempts` times.
pub struct MemoryStore {
    counters: DashMap<String, Versioned<Counter>>,
    shards: DashMap<ShardKey, Versioned<CounterShard>>,
    versions: AtomicU64,
    max_attempts: u32,
}

impl MemoryStore {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            counters: DashMap::new(),
            shards: DashMap::new(),
            versions: AtomicU64::new(0),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Number of shard records currently materialized for `counter_name`.
    pub fn shard_record_count(&self, counter_name: &str) -> usize {
        self.shards
            .iter()
            .filter(|entry| entry.key().counter_name == counter_name)
            .count()
    }

    /// Write a counter record outside of any transaction.
    ///
    /// Intended for seeding fixtures; production paths go through
    /// [`CounterStore::transact_counter`].
    pub fn put_counter(&self, counter: Counter) {
        let version = self.next_version();
        self.counters.insert(
            counter.name.clone(),
            Versioned {
                version,
                record: counter,
            },
        );
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn transact<K, R, T, F>(
        &self,
        map: &DashMap<K, Versioned<R>>,
        key: &K,
        mut work: F,
    ) -> CounterResult<T>
    where
        K: Eq + Hash + Clone + Display,
        R: Clone,
        F: FnMut(Option<R>) -> CounterResult<Txn<R, T>>,
    {
        for attempt in 1..=self.max_attempts {
            let (expected, current) = match map.get(key) {
                Some(entry) => (Some(entry.version), Some(entry.record.clone())),
                None => (None, None),
            };

            let committed = match work(current)? {
                Txn::Keep(output) => return Ok(output),
                Txn::Commit(record, output) => {
                    let version = self.next_version();
                    let written = match map.entry(key.clone()) {
                        Entry::Occupied(mut occupied)
                            if Some(occupied.get().version) == expected =>
                        {
                            occupied.insert(Versioned { version, record });
                            true
                        }
                        Entry::Vacant(vacant) if expected.is_none() => {
                            vacant.insert(Versioned { version, record });
                            true
                        }
                        _ => false,
                    };
                    written.then_some(output)
                }
                Txn::Remove(output) => {
                    let removed = match map.entry(key.clone()) {
                        Entry::Occupied(occupied)
                            if Some(occupied.get().version) == expected =>
                        {
                            occupied.remove();
                            true
                        }
                        Entry::Vacant(_) => expected.is_none(),
                        _ => false,
                    };
                    removed.then_some(output)
                }
            };

            if let Some(output) = committed {
                trace!(key = %key, attempt, "transaction committed");
                return Ok(output);
            }

            trace!(key = %key, attempt, "transaction conflict, retrying");
            tokio::task::yield_now().await;
        }

        Err(CounterError::TransactionConflict {
            key: key.to_string(),
            attempts: self.max_attempts,
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(10)
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get_counter(&self, name: &str) -> CounterResult<Option<Counter>> {
        Ok(self.counters.get(name).map(|entry| entry.record.clone()))
    }

    async fn get_shard(&self, key: &ShardKey) -> CounterResult<Option<CounterShard>> {
        Ok(self.shards.get(key).map(|entry| entry.record.clone()))
    }

    async fn transact_counter<T, F>(&self, name: &str, work: F) -> CounterResult<T>
    where
        T: Send,
        F: FnMut(Option<Counter>) -> CounterResult<Txn<Counter, T>> + Send,
    {
        self.transact(&self.counters, &name.to_string(), work).await
    }

    async fn transact_shard<T, F>(&self, key: &ShardKey, work: F) -> CounterResult<T>
    where
        T: Send,
        F: FnMut(Option<CounterShard>) -> CounterResult<Txn<CounterShard, T>> + Send,
    {
        self.transact(&self.shards, key, work).await
    }

    async fn delete_counter(&self, name: &str) -> CounterResult<()> {
        self.counters.remove(name);
        Ok(())
    }

    async fn delete_shard(&self, key: &ShardKey) -> CounterResult<()> {
        self.shards.remove(key);
        Ok(())
    }
}
