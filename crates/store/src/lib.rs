//! Notification store: the single source of truth for notification status.
//!
//! Every write is one conditional statement scoped to one row, so concurrent
//! schedulers, workers and cancel requests are ordered by the store itself:
//! exactly one of {claim, cancel} wins a `scheduled` row, and outcomes are only
//! accepted from `dispatching` under the claim that produced the task.
//!
//! Each claim bumps `claim_seq`. A task carries the sequence it was published
//! under, so a copy left over from a released claim can neither start a
//! delivery nor write an outcome.

pub mod lifecycle;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use delayed_common::error::AppError;
use delayed_common::types::{NewNotification, Notification, NotificationStatus, normalize_channels};

pub use memory::MemoryNotificationStore;
pub use postgres::PgNotificationStore;

/// Durable notification storage with compare-and-swap status updates.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Insert a new `scheduled` row. Fails with `Conflict` on a duplicate uid.
    async fn create(&self, new: NewNotification) -> Result<Notification, AppError>;

    /// Fetch a notification. Fails with `NotFound` if absent.
    async fn get(&self, uid: Uuid) -> Result<Notification, AppError>;

    /// `scheduled -> cancelled`. Fails with `NotFound` if the row is absent or
    /// has already left `scheduled`.
    async fn cancel(&self, uid: Uuid) -> Result<Notification, AppError>;

    /// Move up to `limit` due rows to `dispatching` and return them. Concurrent
    /// callers never receive the same row.
    async fn claim_due(&self, now: DateTime<Utc>, limit: u32)
    -> Result<Vec<Notification>, AppError>;

    /// Mark the start of delivery for claim `claim_seq`. Returns `true` for
    /// exactly one caller per claim; `false` when the row is no longer
    /// `dispatching`, was re-claimed, or another worker already started.
    async fn begin_delivery(&self, uid: Uuid, claim_seq: i64) -> Result<bool, AppError>;

    /// Write a delivery outcome for a `dispatching` row claimed as `claim_seq`.
    /// Fails with `Conflict` when the row has since been re-claimed.
    async fn record_outcome(
        &self,
        uid: Uuid,
        claim_seq: i64,
        outcome: Outcome,
    ) -> Result<Notification, AppError>;

    /// `dispatching -> scheduled` after a failed publish. Returns `false` when the
    /// row is no longer `dispatching`.
    async fn release_claim(&self, uid: Uuid) -> Result<bool, AppError>;

    /// Return claims idle since before `cutoff` to `scheduled`. A claim whose
    /// delivery has started is measured from the start of delivery.
    async fn release_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, AppError>;
}

/// Result of a delivery attempt, as written by the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub status: NotificationStatus,
    pub send_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_error: String,
    /// Only set when returning the row to `scheduled` for a later attempt.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl Outcome {
    pub fn sent(send_at: DateTime<Utc>, retry_count: i32) -> Self {
        Self {
            status: NotificationStatus::Sent,
            send_at: Some(send_at),
            retry_count,
            last_error: String::new(),
            next_attempt_at: None,
        }
    }

    pub fn failed(retry_count: i32, last_error: impl Into<String>) -> Self {
        Self {
            status: NotificationStatus::Failed,
            send_at: None,
            retry_count,
            last_error: last_error.into(),
            next_attempt_at: None,
        }
    }

    pub fn retry(
        retry_count: i32,
        last_error: impl Into<String>,
        next_attempt_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: NotificationStatus::Scheduled,
            send_at: None,
            retry_count,
            last_error: last_error.into(),
            next_attempt_at: Some(next_attempt_at),
        }
    }

    /// Checks that do not depend on the stored row.
    pub fn check_shape(&self, uid: Uuid) -> Result<(), AppError> {
        lifecycle::check_transition(uid, NotificationStatus::Dispatching, self.status)?;

        if self.send_at.is_some() != (self.status == NotificationStatus::Sent) {
            return Err(AppError::Validation(format!(
                "send_at must be set iff status is sent (status = {})",
                self.status
            )));
        }
        if self.retry_count < 0 {
            return Err(AppError::Validation("retry_count must be non-negative".into()));
        }
        Ok(())
    }

    /// Full check against the current row.
    pub fn check_against(&self, current: &Notification) -> Result<(), AppError> {
        lifecycle::check_transition(current.uid, current.status, self.status)?;
        self.check_shape(current.uid)?;

        let delta = self.retry_count - current.retry_count;
        if !(0..=1).contains(&delta) {
            return Err(AppError::Validation(format!(
                "retry_count may only grow by one per attempt ({} -> {})",
                current.retry_count, self.retry_count
            )));
        }
        Ok(())
    }
}

/// Rejection for an outcome or task that belongs to an older claim.
pub(crate) fn superseded(uid: Uuid, claim_seq: i64, current: i64) -> AppError {
    AppError::Conflict(format!(
        "Claim {} of notification {} superseded by claim {}",
        claim_seq, uid, current
    ))
}

/// Validate creation parameters and return the normalized channel set.
pub fn validate_new(new: &NewNotification) -> Result<Vec<String>, AppError> {
    let channels = normalize_channels(&new.channels);
    if channels.is_empty() {
        return Err(AppError::Validation(
            "At least one delivery channel is required".to_string(),
        ));
    }
    Ok(channels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(status: NotificationStatus, retry_count: i32) -> Notification {
        let now = Utc::now();
        let mut n = Notification::scheduled(
            NewNotification {
                uid: Uuid::new_v4(),
                user_id: 1,
                channels: vec!["email".into()],
                content: "c".into(),
                send_for: now,
            },
            now,
        );
        n.status = status;
        n.retry_count = retry_count;
        n
    }

    #[test]
    fn test_sent_outcome_accepted_from_dispatching() {
        let current = row(NotificationStatus::Dispatching, 0);
        assert!(Outcome::sent(Utc::now(), 0).check_against(&current).is_ok());
    }

    #[test]
    fn test_outcome_rejected_from_terminal() {
        let current = row(NotificationStatus::Sent, 0);
        let err = Outcome::failed(1, "x").check_against(&current).unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
    }

    #[test]
    fn test_send_at_must_match_status() {
        let mut outcome = Outcome::failed(1, "x");
        outcome.send_at = Some(Utc::now());
        assert!(outcome.check_shape(Uuid::new_v4()).is_err());

        let mut outcome = Outcome::sent(Utc::now(), 0);
        outcome.send_at = None;
        assert!(outcome.check_shape(Uuid::new_v4()).is_err());
    }

    #[test]
    fn test_retry_count_grows_by_at_most_one() {
        let current = row(NotificationStatus::Dispatching, 1);
        assert!(Outcome::failed(2, "x").check_against(&current).is_ok());
        assert!(Outcome::failed(3, "x").check_against(&current).is_err());
        assert!(Outcome::failed(0, "x").check_against(&current).is_err());
    }

    #[test]
    fn test_cancelled_is_not_a_valid_outcome() {
        let mut outcome = Outcome::failed(0, "");
        outcome.status = NotificationStatus::Cancelled;
        assert!(matches!(
            outcome.check_shape(Uuid::new_v4()),
            Err(AppError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_validate_new_requires_channels() {
        let new = NewNotification {
            uid: Uuid::new_v4(),
            user_id: 1,
            channels: vec![" ".into()],
            content: "c".into(),
            send_for: Utc::now(),
        };
        assert!(matches!(validate_new(&new), Err(AppError::Validation(_))));
    }
}
