use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;

use crate::services::processor::{JobProcessor, ProcessOutcome};
use crate::services::queue::{JobQueue, QueueError, QueuedTask, PROCESS_SWAP_TASK};

/// One worker of the pool: pulls task messages and runs them to completion.
pub struct QueueConsumer {
    worker: usize,
    queue: Arc<JobQueue>,
    processor: Arc<JobProcessor>,
    poll_interval: Duration,
}

impl QueueConsumer {
    pub fn new(worker: usize, queue: Arc<JobQueue>, processor: Arc<JobProcessor>, poll_interval: Duration) -> Self {
        Self {
            worker,
            queue,
            processor,
            poll_interval,
        }
    }

    /// Consume until `shutdown` flips to true. The job in hand is always finished first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker = self.worker, "Consumer started");

        while !*shutdown.borrow() {
            match self.poll_once().await {
                Ok(true) => {
                    tracing::debug!(worker = self.worker, "Task handled, checking for next task");
                }
                Ok(false) => {
                    tracing::trace!(worker = self.worker, "No tasks available, sleeping");
                    tokio::select! {
                        _ = sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(QueueError::Malformed { payload, source }) => {
                    tracing::warn!(worker = self.worker, payload = %payload, error = %source, "Dropped malformed task message");
                }
                Err(e) => {
                    tracing::error!(worker = self.worker, error = %e, "Queue error, will retry");
                    sleep(self.poll_interval).await;
                }
            }
        }

        tracing::info!(worker = self.worker, "Consumer stopped");
    }

    /// Handle at most one message. Returns whether one was available.
    async fn poll_once(&self) -> Result<bool, QueueError> {
        let Some(delivery) = self.queue.dequeue().await? else {
            return Ok(false);
        };

        let dispatched = dispatch(&self.processor, &delivery.task).await;
        tracing::info!(
            worker = self.worker,
            job_id = delivery.task.job_id,
            outcome = ?dispatched.outcome,
            ack = dispatched.ack,
            "Task finished"
        );

        // Acknowledge only after the handler returns, and only once the ledger
        // has seen the job.
        if dispatched.ack {
            self.queue.complete(&delivery).await?;
        } else {
            self.queue.requeue(&delivery).await?;
            sleep(self.poll_interval).await;
        }

        if let Ok(depth) = self.queue.queue_depth().await {
            metrics::gauge!("swap_queue_depth").set(depth as f64);
        }
        Ok(true)
    }
}

/// What handling a task message produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    /// `None` for tasks this worker does not know.
    pub outcome: Option<ProcessOutcome>,
    /// Whether the message can be removed from the queue.
    pub ack: bool,
}

/// Route a task message to its handler.
pub async fn dispatch(processor: &JobProcessor, task: &QueuedTask) -> Dispatched {
    if task.task != PROCESS_SWAP_TASK {
        tracing::warn!(task = %task.task, job_id = task.job_id, "Unknown task name, acknowledging without processing");
        return Dispatched {
            outcome: None,
            ack: true,
        };
    }

    let outcome = processor.process(task.job_id).await;
    Dispatched {
        ack: outcome.should_ack(),
        outcome: Some(outcome),
    }
}
