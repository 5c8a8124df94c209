//! Delivery worker and worker pool.
//!
//! A task is acknowledged only after its outcome is durably recorded, so a
//! worker crash anywhere before that point ends in redelivery. Redelivered
//! copies are recognized by comparing the task against the stored row, and
//! only one copy per claim may start sending.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use futures::StreamExt;
use futures::future::join_all;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use delayed_common::config::AppConfig;
use delayed_common::error::AppError;
use delayed_common::retry::RetryStrategy;
use delayed_common::types::{DeliveryTask, NotificationStatus};
use delayed_queue::{Delivery, DeliveryQueue, consume};
use delayed_store::{NotificationStore, Outcome};

use crate::adapter::{AdapterRegistry, DeliveryError};

/// What a worker did with one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    Sent,
    Failed,
    /// Returned to `scheduled` for a later attempt.
    Retrying,
    /// Stale or duplicate copy; acknowledged without delivering.
    Skipped,
}

pub struct DeliveryWorker {
    store: Arc<dyn NotificationStore>,
    queue: Arc<dyn DeliveryQueue>,
    adapters: AdapterRegistry,
    retry: RetryStrategy,
    adapter_timeout: Duration,
}

impl DeliveryWorker {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        queue: Arc<dyn DeliveryQueue>,
        adapters: AdapterRegistry,
        retry: RetryStrategy,
        adapter_timeout: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            adapters,
            retry,
            adapter_timeout,
        }
    }

    /// Process one delivery end to end.
    ///
    /// Returns `Err` when a store or queue call fails. The delivery is then
    /// left unacknowledged and the queue redelivers it.
    pub async fn handle(&self, delivery: &Delivery) -> Result<HandleOutcome, AppError> {
        let task = &delivery.task;

        let current = match self.store.get(task.uid).await {
            Ok(n) => n,
            Err(AppError::NotFound(_)) => {
                tracing::warn!(uid = %task.uid, "Task for unknown notification, discarding");
                self.queue.ack(delivery).await?;
                return Ok(HandleOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        if current.status != NotificationStatus::Dispatching
            || current.claim_seq != task.claim_seq
            || current.retry_count != task.retry_count
        {
            tracing::debug!(
                uid = %task.uid,
                status = %current.status,
                stored_claim_seq = current.claim_seq,
                task_claim_seq = task.claim_seq,
                stored_retry_count = current.retry_count,
                task_retry_count = task.retry_count,
                delivery_count = delivery.delivery_count,
                "Stale or duplicate task, discarding"
            );
            self.queue.ack(delivery).await?;
            return Ok(HandleOutcome::Skipped);
        }

        if !self.store.begin_delivery(task.uid, task.claim_seq).await? {
            tracing::debug!(
                uid = %task.uid,
                claim_seq = task.claim_seq,
                delivery_count = delivery.delivery_count,
                "Claim already being delivered by another copy, discarding"
            );
            self.queue.ack(delivery).await?;
            return Ok(HandleOutcome::Skipped);
        }

        let failures = self.deliver(task).await;
        let (outcome, kind) = self.decide(task, &failures);

        match self.store.record_outcome(task.uid, task.claim_seq, outcome).await {
            Ok(n) => {
                match kind {
                    HandleOutcome::Sent => tracing::info!(
                        uid = %n.uid,
                        retry_count = n.retry_count,
                        "Notification sent"
                    ),
                    HandleOutcome::Failed => tracing::warn!(
                        uid = %n.uid,
                        retry_count = n.retry_count,
                        last_error = %n.last_error,
                        "Notification failed"
                    ),
                    _ => tracing::info!(
                        uid = %n.uid,
                        retry_count = n.retry_count,
                        next_attempt_at = ?n.next_attempt_at,
                        last_error = %n.last_error,
                        "Delivery attempt failed, rescheduled"
                    ),
                }
                self.ack_recorded(delivery).await?;
                Ok(kind)
            }
            Err(e @ (AppError::InvalidTransition { .. } | AppError::Conflict(_))) => {
                tracing::error!(uid = %task.uid, error = %e, "Outcome rejected by store, discarding task");
                self.queue.ack(delivery).await?;
                Ok(HandleOutcome::Skipped)
            }
            Err(e) => Err(e),
        }
    }

    /// Ack a delivery whose outcome is already stored. On failure the copy the
    /// queue redelivers is discarded by the status check in [`Self::handle`].
    async fn ack_recorded(&self, delivery: &Delivery) -> Result<(), AppError> {
        self.queue.ack(delivery).await.inspect_err(|e| {
            tracing::warn!(
                uid = %delivery.task.uid,
                error = %e,
                "Outcome recorded but ack failed, redelivered copy will be discarded"
            )
        })
    }

    /// Send to every channel concurrently and collect the failures.
    async fn deliver(&self, task: &DeliveryTask) -> Vec<(String, DeliveryError)> {
        let sends = task.channels.iter().map(|channel| async move {
            let result = match self.adapters.get(channel) {
                None => Err(DeliveryError::Permanent(format!(
                    "no adapter for channel '{}'",
                    channel
                ))),
                Some(adapter) => {
                    match tokio::time::timeout(
                        self.adapter_timeout,
                        adapter.send(task.user_id, &task.content),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(DeliveryError::Transient(format!(
                            "{} timed out after {}s",
                            channel,
                            self.adapter_timeout.as_secs_f64()
                        ))),
                    }
                }
            };
            (channel.clone(), result)
        });

        join_all(sends)
            .await
            .into_iter()
            .filter_map(|(channel, result)| result.err().map(|e| (channel, e)))
            .collect()
    }

    fn decide(
        &self,
        task: &DeliveryTask,
        failures: &[(String, DeliveryError)],
    ) -> (Outcome, HandleOutcome) {
        let now = Utc::now();
        if failures.is_empty() {
            return (Outcome::sent(now, task.retry_count), HandleOutcome::Sent);
        }

        let summary = failures
            .iter()
            .map(|(channel, e)| format!("{}: {}", channel, e))
            .collect::<Vec<_>>()
            .join("; ");
        let retries = task.retry_count.max(0) as u32;
        let permanent = failures.iter().any(|(_, e)| e.is_permanent());

        if permanent || self.retry.is_exhausted(retries + 1) {
            return (
                Outcome::failed(task.retry_count + 1, summary),
                HandleOutcome::Failed,
            );
        }

        let delay = self.retry.delay_for(retries);
        let next_attempt_at = now + TimeDelta::from_std(delay).unwrap_or(TimeDelta::days(1));
        (
            Outcome::retry(task.retry_count + 1, summary, next_attempt_at),
            HandleOutcome::Retrying,
        )
    }

    /// Pull and handle deliveries until `shutdown` fires. The delivery in hand
    /// when shutdown arrives is finished first.
    pub async fn run(&self, id: usize, poll_interval: Duration, shutdown: CancellationToken) {
        tracing::info!(worker = id, "Delivery worker started");
        let mut deliveries = consume(self.queue.clone(), poll_interval);

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = deliveries.next() => next,
            };
            let Some(next) = next else { break };

            match next {
                Ok(delivery) => {
                    if let Err(e) = self.handle(&delivery).await {
                        tracing::warn!(
                            worker = id,
                            uid = %delivery.task.uid,
                            error = %e,
                            "Delivery not completed, leaving task for redelivery"
                        );
                    }
                }
                Err(e) => {
                    tracing::error!(worker = id, error = %e, "Queue receive failed");
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }

        tracing::info!(worker = id, "Delivery worker stopped");
    }
}

/// Runs a fixed number of workers sharing one [`DeliveryWorker`].
pub struct WorkerPool {
    worker: Arc<DeliveryWorker>,
    concurrency: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(worker: DeliveryWorker, concurrency: usize, poll_interval: Duration) -> Self {
        Self {
            worker: Arc::new(worker),
            concurrency: concurrency.max(1),
            poll_interval,
        }
    }

    pub fn from_app(
        config: &AppConfig,
        store: Arc<dyn NotificationStore>,
        queue: Arc<dyn DeliveryQueue>,
        adapters: AdapterRegistry,
    ) -> Self {
        let worker = DeliveryWorker::new(
            store,
            queue,
            adapters,
            config.delivery_retry(),
            config.adapter_timeout(),
        );
        Self::new(worker, config.worker_concurrency, config.queue_poll_interval())
    }

    /// Run until `shutdown` fires and every worker has drained.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(concurrency = self.concurrency, "Worker pool starting");

        let mut workers = JoinSet::new();
        for id in 0..self.concurrency {
            let worker = self.worker.clone();
            let shutdown = shutdown.clone();
            let poll_interval = self.poll_interval;
            workers.spawn(async move { worker.run(id, poll_interval, shutdown).await });
        }

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Delivery worker task aborted");
            }
        }

        tracing::info!("Worker pool stopped");
    }
}
