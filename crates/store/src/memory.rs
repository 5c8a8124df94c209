//! In-process store with the same compare-and-swap semantics as PostgreSQL.
//!
//! Each operation holds the map lock for its whole read-check-write, which is
//! the in-memory equivalent of a single conditional UPDATE.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use delayed_common::error::AppError;
use delayed_common::types::{NewNotification, Notification, NotificationStatus};

use crate::{NotificationStore, Outcome, superseded, validate_new};

/// Map-backed [`NotificationStore`].
#[derive(Debug, Default)]
pub struct MemoryNotificationStore {
    rows: Mutex<HashMap<Uuid, Notification>>,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored notifications.
    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

fn not_found(uid: Uuid) -> AppError {
    AppError::NotFound(format!("Notification {} not found", uid))
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn create(&self, new: NewNotification) -> Result<Notification, AppError> {
        let channels = validate_new(&new)?;
        let mut rows = self.rows.lock().await;
        if rows.contains_key(&new.uid) {
            return Err(AppError::Conflict(format!(
                "Notification {} already exists",
                new.uid
            )));
        }

        let mut n = Notification::scheduled(new, Utc::now());
        n.channels = channels;
        rows.insert(n.uid, n.clone());
        Ok(n)
    }

    async fn get(&self, uid: Uuid) -> Result<Notification, AppError> {
        self.rows
            .lock()
            .await
            .get(&uid)
            .cloned()
            .ok_or_else(|| not_found(uid))
    }

    async fn cancel(&self, uid: Uuid) -> Result<Notification, AppError> {
        let mut rows = self.rows.lock().await;
        match rows.get_mut(&uid) {
            Some(n) if n.status == NotificationStatus::Scheduled => {
                n.status = NotificationStatus::Cancelled;
                n.updated_at = Utc::now();
                Ok(n.clone())
            }
            _ => Err(AppError::NotFound(format!(
                "Notification {} not found or no longer scheduled",
                uid
            ))),
        }
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Notification>, AppError> {
        let mut rows = self.rows.lock().await;

        let mut due: Vec<&mut Notification> = rows.values_mut().filter(|n| n.is_due(now)).collect();
        due.sort_by_key(|n| n.send_for);

        let claimed = due
            .into_iter()
            .take(limit as usize)
            .map(|n| {
                n.status = NotificationStatus::Dispatching;
                n.claimed_at = Some(now);
                n.claim_seq += 1;
                n.delivery_started_at = None;
                n.updated_at = now;
                n.clone()
            })
            .collect();

        Ok(claimed)
    }

    async fn begin_delivery(&self, uid: Uuid, claim_seq: i64) -> Result<bool, AppError> {
        let mut rows = self.rows.lock().await;
        match rows.get_mut(&uid) {
            Some(n)
                if n.status == NotificationStatus::Dispatching
                    && n.claim_seq == claim_seq
                    && n.delivery_started_at.is_none() =>
            {
                let now = Utc::now();
                n.delivery_started_at = Some(now);
                n.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_outcome(
        &self,
        uid: Uuid,
        claim_seq: i64,
        outcome: Outcome,
    ) -> Result<Notification, AppError> {
        outcome.check_shape(uid)?;

        let mut rows = self.rows.lock().await;
        let n = rows.get_mut(&uid).ok_or_else(|| not_found(uid))?;
        outcome.check_against(n)?;
        if n.claim_seq != claim_seq {
            return Err(superseded(uid, claim_seq, n.claim_seq));
        }

        n.status = outcome.status;
        n.send_at = outcome.send_at;
        n.retry_count = outcome.retry_count;
        n.last_error = outcome.last_error;
        n.next_attempt_at = outcome.next_attempt_at;
        n.claimed_at = None;
        n.delivery_started_at = None;
        n.updated_at = Utc::now();
        Ok(n.clone())
    }

    async fn release_claim(&self, uid: Uuid) -> Result<bool, AppError> {
        let mut rows = self.rows.lock().await;
        match rows.get_mut(&uid) {
            Some(n) if n.status == NotificationStatus::Dispatching => {
                n.status = NotificationStatus::Scheduled;
                n.claimed_at = None;
                n.delivery_started_at = None;
                n.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, AppError> {
        let mut rows = self.rows.lock().await;
        let now = Utc::now();
        let released = rows
            .values_mut()
            .filter(|n| {
                n.status == NotificationStatus::Dispatching
                    && n.delivery_started_at
                        .or(n.claimed_at)
                        .is_some_and(|at| at < cutoff)
            })
            .map(|n| {
                n.status = NotificationStatus::Scheduled;
                n.claimed_at = None;
                n.delivery_started_at = None;
                n.updated_at = now;
                n.uid
            })
            .collect();
        Ok(released)
    }
}
