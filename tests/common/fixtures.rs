//! Service harnesses
//!
//! Each harness wires a `ShardedCounterService` to a fresh in-memory store,
//! a cache and a channel queue, keeping handles to all of them so tests can
//! inspect storage, flush the cache and drain deletion jobs by hand.

use sharded_counter::cache::{CounterCache, DisabledCache, MokaCounterCache};
use sharded_counter::config::{Config, ServiceConfig, WorkerConfig};
use sharded_counter::queue::{channel, ChannelTaskQueue, DeletionJob, DeletionWorker, TaskReceiver};
use sharded_counter::store::{CounterStore, MemoryStore};
use sharded_counter::{Metrics, ShardedCounterService};
use std::sync::Arc;

/// A cache whose contents a test can wipe, simulating a cache-service flush.
pub trait Flushable {
    fn flush(&self);
}

impl Flushable for MokaCounterCache {
    fn flush(&self) {
        self.clear();
    }
}

impl Flushable for DisabledCache {
    fn flush(&self) {}
}

pub struct Harness<S, C> {
    pub service: Arc<ShardedCounterService<S, C, ChannelTaskQueue>>,
    pub store: Arc<S>,
    pub cache: Arc<C>,
    pub receiver: TaskReceiver,
    pub metrics: Arc<Metrics>,
}

impl<S, C> Harness<S, C>
where
    S: CounterStore + 'static,
    C: CounterCache + Flushable + 'static,
{
    pub fn build(config: &Config, store: S, cache: C) -> Self {
        let store = Arc::new(store);
        let cache = Arc::new(cache);
        let metrics = Arc::new(Metrics::new());
        let (queue, receiver) = channel(config.worker.channel_capacity);

        let service = ShardedCounterService::new(
            config,
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::new(queue),
            Arc::clone(&metrics),
        )
        .expect("test config should be valid");

        Self {
            service: Arc::new(service),
            store,
            cache,
            receiver,
            metrics,
        }
    }

    pub fn flush_cache(&self) {
        self.cache.flush();
    }

    /// Run every queued deletion job through the handler, as the dispatcher
    /// would. Returns the jobs that were processed.
    pub async fn drain_deletions(&mut self) -> Vec<DeletionJob> {
        let mut jobs = Vec::new();
        while let Some(job) = self.receiver.try_recv() {
            self.service
                .on_task_queue_counter_deletion(&job.counter_name)
                .await;
            jobs.push(job);
        }
        jobs
    }

    /// Hand the job receiver to a background worker.
    pub fn spawn_worker(&mut self, config: &WorkerConfig) -> DeletionWorker {
        let (_, idle) = channel(1);
        let receiver = std::mem::replace(&mut self.receiver, idle);
        DeletionWorker::spawn(
            Arc::clone(&self.service),
            receiver,
            config,
            Arc::clone(&self.metrics.deletion),
        )
    }

    /// Approximate count as seen by readers, panicking if the counter is gone.
    pub async fn count(&self, name: &str) -> u64 {
        self.service
            .get_counter(name)
            .await
            .expect("get_counter failed")
            .unwrap_or_else(|| panic!("counter {} should exist", name))
            .approximate_count
    }
}

pub fn config_with_shards(num_shards: u32) -> Config {
    Config {
        service: ServiceConfig::with_initial_shards(num_shards),
        ..Config::default()
    }
}

pub fn cached_harness(num_shards: u32) -> Harness<MemoryStore, MokaCounterCache> {
    Harness::build(
        &config_with_shards(num_shards),
        MemoryStore::default(),
        MokaCounterCache::default(),
    )
}

pub fn uncached_harness(num_shards: u32) -> Harness<MemoryStore, DisabledCache> {
    let mut config = config_with_shards(num_shards);
    config.cache.enabled = false;
    Harness::build(&config, MemoryStore::default(), DisabledCache)
}
