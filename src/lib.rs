pub mod aggregate;
pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod service;
pub mod store;
pub mod types;

pub use aggregate::{CacheAdjustment, CountAggregator};
pub use cache::{CacheStats, CounterCache, DisabledCache, MokaCounterCache};
pub use config::{CliArgs, Config};
pub use error::{CounterError, CounterResult};
pub use metrics::Metrics;
pub use queue::{ChannelTaskQueue, DeletionJob, DeletionWorker, TaskQueue};
pub use service::ShardedCounterService;
pub use store::{CounterStore, MemoryStore};
pub use types::{Counter, CounterShard, CounterStatus, ShardKey};

use anyhow::{Context, Result};
use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Service wired over the in-process backends.
pub type LocalCounterService =
    ShardedCounterService<MemoryStore, dyn CounterCache, ChannelTaskQueue>;

/// Load to drive against a single counter.
#[derive(Debug, Clone)]
pub struct Workload {
    pub counter: String,
    pub increments: u64,
    pub decrements: u64,
    pub concurrency: usize,
    /// Delete the counter and wait for the purge once the load has run
    pub delete_after: bool,
}

impl Default for Workload {
    fn default() -> Self {
        Self {
            counter: "workload".to_string(),
            increments: 1_000,
            decrements: 0,
            concurrency: 8,
            delete_after: false,
        }
    }
}

/// Outcome of [`run`].
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadReport {
    pub counter: String,
    pub num_shards: u32,
    /// Aggregate as seen by readers
    pub final_count: u64,
    /// Aggregate rebuilt from the shards
    pub reconstructed_count: u64,
    pub elapsed_ms: u128,
    pub deleted: bool,
}

#[derive(Debug, Clone, Copy)]
enum Mutation {
    Increment,
    Decrement,
}

/// Build the in-process stack from `config`.
pub fn build_local_service(
    config: &Config,
    metrics: Arc<Metrics>,
) -> Result<(Arc<LocalCounterService>, queue::TaskReceiver)> {
    let store = Arc::new(MemoryStore::new(config.store.transaction_attempts));
    let cache: Arc<dyn CounterCache> = if config.cache.enabled {
        Arc::new(MokaCounterCache::new(config.cache.max_entries))
    } else {
        tracing::info!("Aggregate cache disabled, every read sums shards");
        Arc::new(DisabledCache)
    };
    let (queue, receiver) = queue::channel(config.worker.channel_capacity);

    let service = ShardedCounterService::new(config, store, cache, Arc::new(queue), metrics)
        .context("Failed to build counter service")?;

    Ok((Arc::new(service), receiver))
}

async fn drive(
    service: &Arc<LocalCounterService>,
    name: &str,
    total: u64,
    concurrency: usize,
    mutation: Mutation,
) -> Result<()> {
    let workers = concurrency.max(1) as u64;
    let handles = (0..workers).map(|worker| {
        let service = Arc::clone(service);
        let name = name.to_string();
        let share = total / workers + u64::from(worker < total % workers);
        tokio::spawn(async move {
            for _ in 0..share {
                match mutation {
                    Mutation::Increment => service.increment(&name, 1).await?,
                    Mutation::Decrement => service.decrement(&name).await?,
                };
            }
            Ok::<_, CounterError>(())
        })
    });

    for result in join_all(handles).await {
        result
            .context("Workload task panicked")?
            .with_context(|| format!("{:?} failed on counter {}", mutation, name))?;
    }
    Ok(())
}

async fn wait_for_purge(service: &LocalCounterService, name: &str) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if service.get_counter(name).await?.is_none() {
                return Ok::<_, CounterError>(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("Timed out waiting for the deletion job")?
    .context("Failed to poll counter during deletion")
}

/// Drive `workload` against an in-process service built from `config`.
pub async fn run(config: Config, workload: Workload) -> Result<WorkloadReport> {
    tracing::info!(
        operation = "startup",
        counter = %workload.counter,
        "sharded-counter starting"
    );
    tracing::debug!(config = ?config, "Configuration loaded");

    let metrics = Arc::new(Metrics::new());
    let (service, receiver) = build_local_service(&config, Arc::clone(&metrics))?;
    let worker = DeletionWorker::spawn(
        Arc::clone(&service),
        receiver,
        &config.worker,
        Arc::clone(&metrics.deletion),
    );

    let stop = Arc::new(AtomicBool::new(false));
    let periodic = (config.logging.metrics_interval_secs > 0).then(|| {
        metrics.spawn_periodic_logging(config.logging.metrics_interval_secs, Arc::clone(&stop))
    });

    let name = workload.counter.as_str();
    let start = Instant::now();

    let counter = service
        .create(name)
        .await
        .with_context(|| format!("Failed to create counter {}", name))?;

    drive(&service, name, workload.increments, workload.concurrency, Mutation::Increment).await?;
    drive(&service, name, workload.decrements, workload.concurrency, Mutation::Decrement).await?;

    let final_count = service
        .get_counter(name)
        .await?
        .map(|c| c.approximate_count)
        .context("Counter disappeared during the workload")?;
    let reconstructed_count = service
        .reconstruct_count(name)
        .await?
        .context("Counter disappeared during the workload")?;

    if workload.delete_after {
        service
            .delete(name)
            .await
            .with_context(|| format!("Failed to delete counter {}", name))?;
        wait_for_purge(&service, name).await?;
    }

    let report = WorkloadReport {
        counter: name.to_string(),
        num_shards: counter.num_shards,
        final_count,
        reconstructed_count,
        elapsed_ms: start.elapsed().as_millis(),
        deleted: workload.delete_after,
    };

    worker.join().await;
    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    if let Some(handle) = periodic {
        handle.abort();
    }

    metrics.log_full_summary();

    Ok(report)
}
