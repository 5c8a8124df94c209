//! In-process queue with the same visibility-timeout semantics as Redis.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use delayed_common::error::AppError;
use delayed_common::types::DeliveryTask;

use crate::{Delivery, DeliveryQueue, Envelope, QueueStats};

#[derive(Debug, Default)]
struct Inner {
    ready: VecDeque<Envelope>,
    in_flight: HashMap<Uuid, (Envelope, Instant)>,
    deliveries: HashMap<Uuid, u32>,
}

/// Memory-backed [`DeliveryQueue`], one instance per test or process.
#[derive(Debug)]
pub struct MemoryDeliveryQueue {
    inner: Mutex<Inner>,
    visibility_timeout: Duration,
}

impl MemoryDeliveryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            visibility_timeout,
        }
    }
}

#[async_trait]
impl DeliveryQueue for MemoryDeliveryQueue {
    async fn publish(&self, task: &DeliveryTask) -> Result<(), AppError> {
        self.inner
            .lock()
            .await
            .ready
            .push_back(Envelope::new(task.clone()));
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>, AppError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        let expired: Vec<Uuid> = inner
            .in_flight
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some((envelope, _)) = inner.in_flight.remove(&id) {
                tracing::debug!(message_id = %id, uid = %envelope.task.uid, "Visibility timeout expired, redelivering");
                inner.ready.push_front(envelope);
            }
        }

        let Some(envelope) = inner.ready.pop_front() else {
            return Ok(None);
        };

        let count = inner.deliveries.entry(envelope.id).or_insert(0);
        *count += 1;
        let delivery = Delivery {
            message_id: envelope.id,
            task: envelope.task.clone(),
            delivery_count: *count,
            receipt: envelope.id.to_string(),
        };
        inner
            .in_flight
            .insert(envelope.id, (envelope, now + self.visibility_timeout));

        Ok(Some(delivery))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), AppError> {
        let mut inner = self.inner.lock().await;
        inner.in_flight.remove(&delivery.message_id);
        inner.deliveries.remove(&delivery.message_id);
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, AppError> {
        let inner = self.inner.lock().await;
        Ok(QueueStats {
            ready: inner.ready.len() as u64,
            in_flight: inner.in_flight.len() as u64,
        })
    }
}
