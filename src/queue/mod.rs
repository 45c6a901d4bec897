//! Deferred deletion jobs.
//!
//! Deleting a counter only flips its status; the shard records are removed
//! later by a [`DeletionHandler`] fed from a [`TaskQueue`].

pub mod worker;

use crate::error::{CounterError, CounterResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

pub use worker::DeletionWorker;

/// A request to purge one counter's records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionJob {
    pub counter_name: String,
    /// Named queue the job was routed to
    pub queue_name: String,
    /// Optional relative path of the endpoint that processes the job
    pub task_path: Option<String>,
}

/// Sink for deletion jobs.
///
/// Delivery is at-least-once; handlers must tolerate duplicates.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, job: DeletionJob) -> CounterResult<()>;
}

/// Processes deletion jobs pulled off a queue.
#[async_trait]
pub trait DeletionHandler: Send + Sync {
    async fn handle_deletion(&self, job: &DeletionJob) -> CounterResult<()>;
}

/// In-process [`TaskQueue`] backed by a bounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelTaskQueue {
    sender: mpsc::Sender<DeletionJob>,
}

/// Receiving end of a [`ChannelTaskQueue`].
#[derive(Debug)]
pub struct TaskReceiver {
    receiver: mpsc::Receiver<DeletionJob>,
}

/// Create a connected queue/receiver pair holding at most `capacity` jobs.
pub fn channel(capacity: usize) -> (ChannelTaskQueue, TaskReceiver) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (ChannelTaskQueue { sender }, TaskReceiver { receiver })
}

#[async_trait]
impl TaskQueue for ChannelTaskQueue {
    async fn enqueue(&self, job: DeletionJob) -> CounterResult<()> {
        trace!(counter = %job.counter_name, queue = %job.queue_name, "Enqueueing deletion job");
        self.sender.send(job).await.map_err(|e| {
            CounterError::Queue(format!(
                "deletion queue closed, dropped job for {}",
                e.0.counter_name
            ))
        })
    }
}

impl TaskReceiver {
    /// Wait for the next job. Returns `None` once every queue handle is gone.
    pub async fn recv(&mut self) -> Option<DeletionJob> {
        self.receiver.recv().await
    }

    /// Take a job if one is ready, without waiting.
    pub fn try_recv(&mut self) -> Option<DeletionJob> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn job(name: &str) -> DeletionJob {
        DeletionJob {
            counter_name: name.to_string(),
            queue_name: "default".to_string(),
            task_path: None,
        }
    }

    #[tokio::test]
    async fn test_jobs_arrive_in_order() {
        let (queue, mut receiver) = channel(4);
        assert_ok!(queue.enqueue(job("c1")).await);
        assert_ok!(queue.enqueue(job("c2")).await);

        assert_eq!(receiver.recv().await.unwrap().counter_name, "c1");
        assert_eq!(receiver.try_recv().unwrap().counter_name, "c2");
        assert!(receiver.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_fails_when_receiver_dropped() {
        let (queue, receiver) = channel(4);
        drop(receiver);

        let err = assert_err!(queue.enqueue(job("c1")).await);
        assert!(matches!(err, CounterError::Queue(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_recv_ends_when_queue_dropped() {
        let (queue, mut receiver) = channel(4);
        drop(queue);
        assert!(receiver.recv().await.is_none());
    }
}
