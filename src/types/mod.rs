//! Core data types for counters and their shards.

pub mod counter;
pub mod shard;

pub use counter::{Counter, CounterStatus};
pub use shard::{CounterShard, ShardKey};
