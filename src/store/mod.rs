//! Durable storage contract for counter and shard records.
//!
//! A backend must offer strongly consistent single-key reads and single-key
//! atomic transactions. Transactions are expressed as a closure over the
//! current record; the backend re-runs the closure when it loses an
//! optimistic-concurrency race, so closures must be free of side effects.

pub mod memory;

use crate::error::CounterResult;
use crate::types::{Counter, CounterShard, ShardKey};
use async_trait::async_trait;

pub use memory::MemoryStore;

/// Outcome of a single-key transaction body.
#[derive(Debug, Clone, PartialEq)]
pub enum Txn<R, T> {
    /// Persist `R` atomically and hand `T` back once the commit has landed.
    Commit(R, T),
    /// Leave the record untouched and return `T`.
    Keep(T),
    /// Delete the record atomically and return `T` once the removal has landed.
    Remove(T),
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Strongly consistent read of a counter record.
    async fn get_counter(&self, name: &str) -> CounterResult<Option<Counter>>;

    /// Strongly consistent read of a shard record.
    async fn get_shard(&self, key: &ShardKey) -> CounterResult<Option<CounterShard>>;

    /// Run `work` as an atomic read-modify-write on one counter record.
    ///
    /// An `Err` returned by `work` aborts the transaction without writing.
    async fn transact_counter<T, F>(&self, name: &str, work: F) -> CounterResult<T>
    where
        T: Send,
        F: FnMut(Option<Counter>) -> CounterResult<Txn<Counter, T>> + Send;

    /// Run `work` as an atomic read-modify-write on one shard record.
    async fn transact_shard<T, F>(&self, key: &ShardKey, work: F) -> CounterResult<T>
    where
        T: Send,
        F: FnMut(Option<CounterShard>) -> CounterResult<Txn<CounterShard, T>> + Send;

    /// Remove a counter record. Removing an absent record is a no-op.
    async fn delete_counter(&self, name: &str) -> CounterResult<()>;

    /// Remove a shard record. Removing an absent record is a no-op.
    async fn delete_shard(&self, key: &ShardKey) -> CounterResult<()>;
}
