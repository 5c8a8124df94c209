//! Dispatch scheduler: promotes due notifications into the delivery queue.
//!
//! Each tick:
//! 1. Returns stale `dispatching` claims to `scheduled` (if enabled)
//! 2. Claims up to `batch_size` due notifications (`scheduled -> dispatching`)
//! 3. Publishes one delivery task per claim
//! 4. Releases the claim again if the publish fails, so a later tick retries it
//!
//! Several schedulers may run side by side; exclusivity comes from
//! `NotificationStore::claim_due`, not from leader election.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use delayed_common::config::AppConfig;
use delayed_common::error::AppError;
use delayed_common::types::DeliveryTask;
use delayed_queue::DeliveryQueue;
use delayed_store::NotificationStore;

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between ticks.
    pub tick: Duration,
    /// Maximum notifications claimed per tick.
    pub batch_size: u32,
    /// Claims older than this are released back to `scheduled`. `None` disables recovery.
    pub stale_after: Option<Duration>,
}

impl SchedulerConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            tick: config.scheduler_tick(),
            batch_size: config.scheduler_batch_size,
            stale_after: config.stale_claim_after(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(2),
            batch_size: 100,
            stale_after: Some(Duration::from_secs(600)),
        }
    }
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Stale claims returned to `scheduled`.
    pub released: usize,
    /// Rows moved to `dispatching`.
    pub claimed: usize,
    /// Tasks successfully published.
    pub published: usize,
    /// Claims reverted after a failed publish.
    pub reverted: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// Periodic claimer/publisher.
pub struct DispatchScheduler {
    store: Arc<dyn NotificationStore>,
    queue: Arc<dyn DeliveryQueue>,
    config: SchedulerConfig,
}

impl DispatchScheduler {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        queue: Arc<dyn DeliveryQueue>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    /// Tick until `shutdown` is cancelled. A failed tick is logged and the loop continues.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            tick_ms = self.config.tick.as_millis() as u64,
            batch_size = self.config.batch_size,
            stale_after_secs = self.config.stale_after.map(|d| d.as_secs()),
            "Dispatch scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(report) if !report.is_idle() => {
                            tracing::info!(
                                released = report.released,
                                claimed = report.claimed,
                                published = report.published,
                                reverted = report.reverted,
                                "Scheduler tick"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "Scheduler tick failed, will retry next tick");
                        }
                    }
                }
            }
        }

        tracing::info!("Dispatch scheduler stopped");
    }

    /// Run one claim/publish cycle as of `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, AppError> {
        let mut report = TickReport::default();

        if let Some(stale_after) = self.config.stale_after {
            let age = chrono::Duration::from_std(stale_after)
                .map_err(|e| AppError::Config(format!("stale claim age out of range: {}", e)))?;
            let released = self.store.release_stale(now - age).await?;
            for uid in &released {
                tracing::warn!(uid = %uid, "Stale dispatch claim returned to scheduled");
            }
            report.released = released.len();
        }

        let claimed = self.store.claim_due(now, self.config.batch_size).await?;
        report.claimed = claimed.len();

        for notification in &claimed {
            let task = DeliveryTask::from(notification);

            match self.queue.publish(&task).await {
                Ok(()) => {
                    report.published += 1;
                    tracing::debug!(
                        uid = %task.uid,
                        retry_count = task.retry_count,
                        "Notification dispatched to queue"
                    );
                }
                Err(e) => {
                    tracing::warn!(uid = %task.uid, error = %e, "Publish failed, releasing claim");
                    match self.store.release_claim(task.uid).await {
                        Ok(true) => report.reverted += 1,
                        Ok(false) => {
                            tracing::warn!(uid = %task.uid, "Claim already moved on, nothing to release");
                        }
                        Err(e) => {
                            // Left to stale-claim recovery.
                            tracing::error!(uid = %task.uid, error = %e, "Failed to release claim");
                        }
                    }
                }
            }
        }

        if report.published > 0 {
            if let Ok(stats) = self.queue.stats().await {
                tracing::debug!(ready = stats.ready, in_flight = stats.in_flight, "Queue depth");
            }
        }

        Ok(report)
    }
}
