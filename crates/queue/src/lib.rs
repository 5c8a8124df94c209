//! Delivery queue: durable, at-least-once transport between scheduler and workers.
//!
//! A received task is moved to an in-flight set with a visibility deadline. It
//! is removed only by an explicit [`DeliveryQueue::ack`]; if the consumer dies
//! first, the task becomes visible again once the deadline passes.

pub mod memory;
pub mod redis_queue;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use delayed_common::error::AppError;
use delayed_common::types::DeliveryTask;

pub use memory::MemoryDeliveryQueue;
pub use redis_queue::RedisDeliveryQueue;

/// Wire envelope stored in the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub task: DeliveryTask,
    pub published_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(task: DeliveryTask) -> Self {
        Self {
            id: Uuid::new_v4(),
            task,
            published_at: Utc::now(),
        }
    }
}

/// A received task awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: Uuid,
    pub task: DeliveryTask,
    /// How many times this message has been handed to a consumer, including this one.
    pub delivery_count: u32,
    /// Opaque handle the queue needs to acknowledge the message.
    pub receipt: String,
}

/// Queue depth snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub ready: u64,
    pub in_flight: u64,
}

#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    /// Durably enqueue a task.
    async fn publish(&self, task: &DeliveryTask) -> Result<(), AppError>;

    /// Take the next visible task, if any, starting its visibility timeout.
    async fn receive(&self) -> Result<Option<Delivery>, AppError>;

    /// Permanently remove a received task.
    async fn ack(&self, delivery: &Delivery) -> Result<(), AppError>;

    async fn stats(&self) -> Result<QueueStats, AppError>;
}

/// Lazy stream of deliveries from `queue`.
///
/// Sleeps `poll_interval` whenever the queue is empty. Receive errors are
/// yielded, not swallowed; the stream itself never ends, and dropping it and
/// calling `consume` again resumes where the queue stands.
pub fn consume(
    queue: Arc<dyn DeliveryQueue>,
    poll_interval: Duration,
) -> BoxStream<'static, Result<Delivery, AppError>> {
    futures::stream::unfold(queue, move |queue| async move {
        loop {
            match queue.receive().await {
                Ok(Some(delivery)) => return Some((Ok(delivery), queue)),
                Ok(None) => tokio::time::sleep(poll_interval).await,
                Err(e) => return Some((Err(e), queue)),
            }
        }
    })
    .boxed()
}
