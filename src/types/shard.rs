use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Separator between the counter name and the shard index in a shard identifier.
pub const SHARD_KEY_SEPARATOR: char = '-';

/// Composite identity of a shard: counter name plus a 0-based index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardKey {
    pub counter_name: String,
    pub index: u32,
}

impl ShardKey {
    pub fn new(counter_name: impl Into<String>, index: u32) -> Self {
        Self {
            counter_name: counter_name.into(),
            index,
        }
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.counter_name, SHARD_KEY_SEPARATOR, self.index)
    }
}

/// One independently writable partition of a counter's value.
///
/// Shards are materialized lazily on their first increment; an index with no
/// record counts as zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterShard {
    pub key: ShardKey,
    pub count: u64,
    pub updated_at: SystemTime,
}

impl CounterShard {
    pub fn new(key: ShardKey) -> Self {
        Self {
            key,
            count: 0,
            updated_at: SystemTime::now(),
        }
    }

    /// Set a new count and record when it happened.
    pub fn set_count(&mut self, count: u64) {
        self.count = count;
        self.updated_at = SystemTime::now();
    }

    /// Time of the last persisted mutation.
    pub fn last_modified(&self) -> SystemTime {
        self.updated_at
    }
}
