use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::models::job::JobId;

const QUEUE_KEY: &str = "faceswap:tasks";
const PROCESSING_KEY: &str = "faceswap:processing";

/// Task name carried by swap job messages.
pub const PROCESS_SWAP_TASK: &str = "process_swap_task";

/// Task message as serialized into Redis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub task: String,
    pub job_id: JobId,
}

impl QueuedTask {
    pub fn process_swap(job_id: JobId) -> Self {
        Self {
            task: PROCESS_SWAP_TASK.to_string(),
            job_id,
        }
    }
}

/// A dequeued message. Kept verbatim so it can be acknowledged exactly.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub task: QueuedTask,
    payload: String,
}

/// Redis-backed reliable task queue with at-least-once delivery.
///
/// Dequeued messages are parked in a processing list until acknowledged.
pub struct JobQueue {
    client: redis::Client,
}

impl JobQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self { client })
    }

    /// Enqueue a swap job.
    pub async fn enqueue(&self, task: &QueuedTask) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let payload = serde_json::to_string(task).map_err(QueueError::Serialize)?;
        conn.lpush::<_, _, ()>(QUEUE_KEY, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Take the next message, moving it to the processing list.
    ///
    /// Unparseable messages are dropped from the processing list and reported
    /// as [`QueueError::Malformed`].
    pub async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let result: Option<String> = conn
            .rpoplpush(QUEUE_KEY, PROCESSING_KEY)
            .await
            .map_err(QueueError::Redis)?;

        let Some(payload) = result else {
            return Ok(None);
        };

        match serde_json::from_str::<QueuedTask>(&payload) {
            Ok(task) => Ok(Some(Delivery { task, payload })),
            Err(e) => {
                conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, &payload)
                    .await
                    .map_err(QueueError::Redis)?;
                Err(QueueError::Malformed { payload, source: e })
            }
        }
    }

    /// Acknowledge a delivery (remove it from the processing list).
    pub async fn complete(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, &delivery.payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Put a delivery back at the tail of the queue without acknowledging it.
    pub async fn requeue(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        redis::pipe()
            .atomic()
            .lrem(PROCESSING_KEY, 1, &delivery.payload)
            .ignore()
            .lpush(QUEUE_KEY, &delivery.payload)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Return messages left in the processing list by a crashed worker to the
    /// queue. Returns how many were requeued.
    pub async fn recover_in_flight(&self) -> Result<u64, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let mut recovered = 0;
        loop {
            let moved: Option<String> = conn
                .rpoplpush(PROCESSING_KEY, QUEUE_KEY)
                .await
                .map_err(QueueError::Redis)?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Get the current queue depth (pending messages).
    pub async fn queue_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let depth: u64 = conn.llen(QUEUE_KEY).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Malformed task message {payload:?}: {source}")]
    Malformed {
        payload: String,
        source: serde_json::Error,
    },
}
