use super::{validate_name, ShardedCounterService};
use crate::cache::CounterCache;
use crate::error::CounterResult;
use crate::queue::{DeletionHandler, DeletionJob, TaskQueue};
use crate::store::{CounterStore, Txn};
use crate::types::ShardKey;
use async_trait::async_trait;
use tracing::{debug, error, info, warn};

impl<S, C, Q> ShardedCounterService<S, C, Q>
where
    S: CounterStore,
    C: CounterCache + ?Sized,
    Q: TaskQueue + ?Sized,
{
    /// Mark a counter as deleting and schedule the purge of its records.
    ///
    /// Deleting a missing counter is a no-op. The job is only enqueued once
    /// the status change has committed; calling this again on a counter that
    /// is already deleting schedules another job.
    pub async fn delete(&self, name: &str) -> CounterResult<()> {
        validate_name(name)?;

        let scheduled = self
            .store
            .transact_counter(name, |existing| match existing {
                None => Ok(Txn::Keep(false)),
                Some(mut counter) => {
                    counter.mark_deleting();
                    Ok(Txn::Commit(counter, true))
                }
            })
            .await?;

        if !scheduled {
            debug!(counter = name, "Delete requested for missing counter");
            return Ok(());
        }

        let job = self.deletion_job(name);
        let queue_name = job.queue_name.clone();
        self.queue.enqueue(job).await?;

        self.metrics.deletion.record_enqueued(&queue_name);
        info!(counter = name, queue = %queue_name, "Counter marked for deletion");

        Ok(())
    }

    /// Entry point for an external dispatcher delivering a deletion job.
    ///
    /// Runs the job through [`DeletionHandler::handle_deletion`], the same
    /// path the [`DeletionWorker`](crate::queue::DeletionWorker) takes. Safe
    /// to run any number of times; failures are logged and counted rather
    /// than returned, and the dispatcher's redelivery retries the job.
    pub async fn on_task_queue_counter_deletion(&self, name: &str) {
        let job = self.deletion_job(name);
        if let Err(e) = self.handle_deletion(&job).await {
            self.metrics.deletion.record_failed();
            error!(counter = name, error = %e, "Failed to purge counter");
        }
    }

    fn deletion_job(&self, name: &str) -> DeletionJob {
        DeletionJob {
            counter_name: name.to_string(),
            queue_name: self.config.queue_name().to_string(),
            task_path: self.config.delete_task_path.clone(),
        }
    }

    /// Remove every shard of a deleting counter, then the counter itself.
    ///
    /// Shards go first so a partially completed run leaves the counter
    /// record behind for the retry to find.
    async fn purge_counter(&self, name: &str) -> CounterResult<()> {
        let Some(counter) = self.store.get_counter(name).await? else {
            info!(counter = name, "Counter already purged");
            self.metrics.deletion.record_completed(0);
            return Ok(());
        };

        if !counter.is_deleting() {
            warn!(
                counter = name,
                status = %counter.status,
                "Skipping deletion job for a counter that is not being deleted"
            );
            self.metrics.deletion.record_completed(0);
            return Ok(());
        }

        for index in 0..counter.num_shards {
            self.store.delete_shard(&ShardKey::new(name, index)).await?;
        }
        self.store.delete_counter(name).await?;
        self.aggregator.evict(name).await;

        self.metrics.deletion.record_completed(counter.num_shards);
        info!(counter = name, num_shards = counter.num_shards, "Purged counter");

        Ok(())
    }
}

/// The single way a deletion job reaches the purge. Errors are returned to
/// the caller, which owns retries and failure accounting.
#[async_trait]
impl<S, C, Q> DeletionHandler for ShardedCounterService<S, C, Q>
where
    S: CounterStore,
    C: CounterCache + ?Sized,
    Q: TaskQueue + ?Sized,
{
    async fn handle_deletion(&self, job: &DeletionJob) -> CounterResult<()> {
        debug!(counter = %job.counter_name, queue = %job.queue_name, "Running deletion job");
        self.purge_counter(&job.counter_name).await
    }
}
