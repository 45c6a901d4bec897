use super::{DeletionHandler, DeletionJob, TaskReceiver};
use crate::config::WorkerConfig;
use crate::metrics::DeletionMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, trace, warn};

type InFlight = JoinSet<Option<DeletionJob>>;

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_attempts: u32,
    backoff: Duration,
    redelivery_delay: Duration,
}

/// Background task that drains a [`TaskReceiver`] into a [`DeletionHandler`].
///
/// Each job runs on its own task so a slow purge does not hold up the queue.
/// Transient failures are retried with a linear backoff up to
/// `max_attempts`; a job still failing after that is delivered again once
/// `redelivery_delay` has passed, for as long as the worker runs. Errors that
/// are not transient are logged and the job is dropped.
///
/// On shutdown the worker stops taking new deliveries, hands every job still
/// buffered in the channel to the handler and waits for all of them.
pub struct DeletionWorker {
    worker_handle: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl DeletionWorker {
    pub fn spawn<H>(
        handler: Arc<H>,
        mut receiver: TaskReceiver,
        config: &WorkerConfig,
        metrics: Arc<DeletionMetrics>,
    ) -> Self
    where
        H: DeletionHandler + ?Sized + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let policy = RetryPolicy {
            max_attempts: config.max_attempts.max(1),
            backoff: config.retry_backoff(),
            redelivery_delay: config.redelivery_delay(),
        };

        let worker_handle = tokio::spawn(async move {
            info!("DeletionWorker started");
            let mut in_flight = InFlight::new();

            loop {
                tokio::select! {
                    biased;

                    _ = &mut shutdown_rx => {
                        info!("DeletionWorker received shutdown signal");
                        break;
                    }

                    Some(done) = in_flight.join_next(), if !in_flight.is_empty() => {
                        if let Some(job) = settle(done) {
                            Self::dispatch(
                                &mut in_flight,
                                &handler,
                                &metrics,
                                job,
                                policy,
                                policy.redelivery_delay,
                            );
                        }
                    }

                    job = receiver.recv() => {
                        let Some(job) = job else {
                            info!("Deletion queue closed");
                            break;
                        };
                        Self::dispatch(
                            &mut in_flight,
                            &handler,
                            &metrics,
                            job,
                            policy,
                            Duration::ZERO,
                        );
                    }
                }
            }

            while let Some(job) = receiver.try_recv() {
                Self::dispatch(
                    &mut in_flight,
                    &handler,
                    &metrics,
                    job,
                    policy,
                    Duration::ZERO,
                );
            }
            while let Some(done) = in_flight.join_next().await {
                if let Some(job) = settle(done) {
                    metrics.record_failed();
                    error!(
                        counter = %job.counter_name,
                        queue = %job.queue_name,
                        "Deletion job still failing at shutdown"
                    );
                }
            }

            info!("DeletionWorker shut down");
        });

        Self {
            worker_handle: Some(worker_handle),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    fn dispatch<H>(
        in_flight: &mut InFlight,
        handler: &Arc<H>,
        metrics: &Arc<DeletionMetrics>,
        job: DeletionJob,
        policy: RetryPolicy,
        delay: Duration,
    ) where
        H: DeletionHandler + ?Sized + 'static,
    {
        let handler = Arc::clone(handler);
        let metrics = Arc::clone(metrics);

        in_flight.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Self::process(handler.as_ref(), &metrics, job, policy).await
        });
    }

    /// Run one delivery of `job`. Returns the job if it should be delivered
    /// again later.
    async fn process<H>(
        handler: &H,
        metrics: &DeletionMetrics,
        job: DeletionJob,
        policy: RetryPolicy,
    ) -> Option<DeletionJob>
    where
        H: DeletionHandler + ?Sized,
    {
        trace!(counter = %job.counter_name, queue = %job.queue_name, "Handling deletion job");

        for attempt in 1..=policy.max_attempts {
            let e = match handler.handle_deletion(&job).await {
                Ok(()) => return None,
                Err(e) => e,
            };

            if !e.is_transient() {
                metrics.record_failed();
                error!(
                    counter = %job.counter_name,
                    queue = %job.queue_name,
                    attempt,
                    error = %e,
                    "Deletion job abandoned"
                );
                return None;
            }

            if attempt < policy.max_attempts {
                metrics.record_retry(&job.counter_name, attempt);
                warn!(
                    counter = %job.counter_name,
                    attempt,
                    error = %e,
                    "Deletion job failed, retrying"
                );
                tokio::time::sleep(policy.backoff * attempt).await;
            } else {
                metrics.record_redelivered(&job.counter_name);
                warn!(
                    counter = %job.counter_name,
                    attempts = attempt,
                    error = %e,
                    delay_ms = policy.redelivery_delay.as_millis() as u64,
                    "Deletion job exhausted its attempts, redelivering later"
                );
            }
        }

        Some(job)
    }

    /// Stop accepting jobs and finish the ones already received.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            info!("Sending shutdown signal to DeletionWorker");
            let _ = tx.send(());
        }
    }

    /// Shut down and wait until every received job has been handled.
    pub async fn join(mut self) {
        self.shutdown();
        if let Some(handle) = self.worker_handle.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "DeletionWorker task panicked");
            }
        }
    }
}

impl Drop for DeletionWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn settle(done: Result<Option<DeletionJob>, JoinError>) -> Option<DeletionJob> {
    done.unwrap_or_else(|e| {
        error!(error = %e, "Deletion job task panicked");
        None
    })
}
