use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use strum::{Display, EnumString};

/// Lifecycle of a counter.
///
/// `Available` counters accept increments, decrements and shard growth.
/// `Deleting` is terminal: only the deletion job touches the counter afterwards.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CounterStatus {
    #[default]
    Available,
    Deleting,
}

/// Metadata record for a logical counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    /// Caller-chosen, globally unique and immutable name
    pub name: String,
    /// Number of shard indices in use; only ever grows
    pub num_shards: u32,
    pub status: CounterStatus,
    /// Aggregate resolved from the cache or the shards on read.
    /// Never persisted as an authoritative value.
    #[serde(skip)]
    pub approximate_count: u64,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl Counter {
    pub fn new(name: impl Into<String>, num_shards: u32) -> Self {
        let now = SystemTime::now();
        Self {
            name: name.into(),
            num_shards,
            status: CounterStatus::Available,
            approximate_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_deleting(&self) -> bool {
        self.status == CounterStatus::Deleting
    }

    /// Flip the counter into the terminal `Deleting` state.
    pub fn mark_deleting(&mut self) {
        self.status = CounterStatus::Deleting;
        self.touch();
    }

    pub fn set_num_shards(&mut self, num_shards: u32) {
        self.num_shards = num_shards;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = SystemTime::now();
    }
}
