//! PostgreSQL-backed notification store.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` inside a single `UPDATE … RETURNING`
//! so concurrent schedulers partition the due set. Every other write is a
//! conditional update guarded on the expected current status.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use delayed_common::error::AppError;
use delayed_common::retry::{RetryStrategy, retry};
use delayed_common::types::{NewNotification, Notification, NotificationStatus};

use crate::{NotificationStore, Outcome, superseded, validate_new};

/// Default upper bound for a single store call.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// [`NotificationStore`] over a `notifications` table.
#[derive(Debug, Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
    call_timeout: Duration,
    reconnect: RetryStrategy,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            reconnect: RetryStrategy::default(),
        }
    }

    /// Bound every store call by `timeout`.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Retry connectivity failures with `strategy`.
    pub fn with_reconnect(mut self, strategy: RetryStrategy) -> Self {
        self.reconnect = strategy;
        self
    }

    /// Run one statement under the call timeout, retrying connectivity errors.
    async fn run<T, F, Fut>(&self, what: &'static str, mut op: F) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let limit = self.call_timeout;
        retry(&self.reconnect, what, || {
            let fut = op();
            async move {
                match tokio::time::timeout(limit, fut).await {
                    Ok(result) => result.map_err(AppError::from),
                    Err(_) => Err(AppError::Timeout(format!(
                        "store call `{}` exceeded {:?}",
                        what, limit
                    ))),
                }
            }
        })
        .await
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn create(&self, new: NewNotification) -> Result<Notification, AppError> {
        let channels = validate_new(&new)?;
        let now = Utc::now();

        let result = self
            .run("create", || {
                sqlx::query_as::<_, Notification>(
                    r#"
                    INSERT INTO notifications
                        (uid, user_id, channels, content, status, send_for, retry_count, last_error, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, 0, '', $7, $7)
                    RETURNING *
                    "#,
                )
                .bind(new.uid)
                .bind(new.user_id)
                .bind(&channels)
                .bind(&new.content)
                .bind(NotificationStatus::Scheduled.to_string())
                .bind(new.send_for)
                .bind(now)
                .fetch_one(&self.pool)
            })
            .await;

        match result {
            Ok(n) => {
                tracing::info!(
                    uid = %n.uid,
                    user_id = n.user_id,
                    send_for = %n.send_for,
                    "Notification scheduled"
                );
                Ok(n)
            }
            Err(AppError::Database(sqlx::Error::Database(db))) if db.is_unique_violation() => Err(
                AppError::Conflict(format!("Notification {} already exists", new.uid)),
            ),
            Err(e) => Err(e),
        }
    }

    async fn get(&self, uid: Uuid) -> Result<Notification, AppError> {
        self.run("get", || {
            sqlx::query_as::<_, Notification>("SELECT * FROM notifications WHERE uid = $1")
                .bind(uid)
                .fetch_optional(&self.pool)
        })
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", uid)))
    }

    async fn cancel(&self, uid: Uuid) -> Result<Notification, AppError> {
        let cancelled = self
            .run("cancel", || {
                sqlx::query_as::<_, Notification>(
                    r#"
                    UPDATE notifications
                    SET status = 'cancelled', updated_at = NOW()
                    WHERE uid = $1 AND status = 'scheduled'
                    RETURNING *
                    "#,
                )
                .bind(uid)
                .fetch_optional(&self.pool)
            })
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "Notification {} not found or no longer scheduled",
                    uid
                ))
            })?;

        tracing::info!(uid = %uid, "Notification cancelled");
        Ok(cancelled)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Notification>, AppError> {
        let claimed = self
            .run("claim_due", || {
                sqlx::query_as::<_, Notification>(
                    r#"
                    UPDATE notifications
                    SET status = 'dispatching',
                        claimed_at = $1,
                        claim_seq = claim_seq + 1,
                        delivery_started_at = NULL,
                        updated_at = $1
                    WHERE uid IN (
                        SELECT uid FROM notifications
                        WHERE status = 'scheduled'
                          AND send_for <= $1
                          AND (next_attempt_at IS NULL OR next_attempt_at <= $1)
                        ORDER BY send_for
                        LIMIT $2
                        FOR UPDATE SKIP LOCKED
                    )
                    AND status = 'scheduled'
                    RETURNING *
                    "#,
                )
                .bind(now)
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
            })
            .await?;

        if !claimed.is_empty() {
            tracing::debug!(count = claimed.len(), "Claimed due notifications");
        }
        Ok(claimed)
    }

    async fn begin_delivery(&self, uid: Uuid, claim_seq: i64) -> Result<bool, AppError> {
        let result = self
            .run("begin_delivery", || {
                sqlx::query(
                    r#"
                    UPDATE notifications
                    SET delivery_started_at = NOW(), updated_at = NOW()
                    WHERE uid = $1
                      AND status = 'dispatching'
                      AND claim_seq = $2
                      AND delivery_started_at IS NULL
                    "#,
                )
                .bind(uid)
                .bind(claim_seq)
                .execute(&self.pool)
            })
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_outcome(
        &self,
        uid: Uuid,
        claim_seq: i64,
        outcome: Outcome,
    ) -> Result<Notification, AppError> {
        outcome.check_shape(uid)?;

        let updated = self
            .run("record_outcome", || {
                sqlx::query_as::<_, Notification>(
                    r#"
                    UPDATE notifications
                    SET status = $2,
                        send_at = $3,
                        retry_count = $4,
                        last_error = $5,
                        next_attempt_at = $6,
                        claimed_at = NULL,
                        delivery_started_at = NULL,
                        updated_at = NOW()
                    WHERE uid = $1
                      AND status = 'dispatching'
                      AND claim_seq = $7
                      AND retry_count <= $4
                      AND $4 <= retry_count + 1
                    RETURNING *
                    "#,
                )
                .bind(uid)
                .bind(outcome.status.to_string())
                .bind(outcome.send_at)
                .bind(outcome.retry_count)
                .bind(&outcome.last_error)
                .bind(outcome.next_attempt_at)
                .bind(claim_seq)
                .fetch_optional(&self.pool)
            })
            .await?;

        match updated {
            Some(n) => {
                tracing::info!(
                    uid = %uid,
                    status = %n.status,
                    retry_count = n.retry_count,
                    "Delivery outcome recorded"
                );
                Ok(n)
            }
            None => {
                // Explain the rejection from the current row; it is left untouched.
                let current = self.get(uid).await?;
                outcome.check_against(&current)?;
                if current.claim_seq != claim_seq {
                    return Err(superseded(uid, claim_seq, current.claim_seq));
                }
                Err(AppError::Internal(format!(
                    "Outcome for {} rejected by a concurrent write",
                    uid
                )))
            }
        }
    }

    async fn release_claim(&self, uid: Uuid) -> Result<bool, AppError> {
        let result = self
            .run("release_claim", || {
                sqlx::query(
                    r#"
                    UPDATE notifications
                    SET status = 'scheduled',
                        claimed_at = NULL,
                        delivery_started_at = NULL,
                        updated_at = NOW()
                    WHERE uid = $1 AND status = 'dispatching'
                    "#,
                )
                .bind(uid)
                .execute(&self.pool)
            })
            .await?;

        let released = result.rows_affected() > 0;
        if released {
            tracing::info!(uid = %uid, "Claim released back to scheduled");
        }
        Ok(released)
    }

    async fn release_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, AppError> {
        let released: Vec<Uuid> = self
            .run("release_stale", || {
                sqlx::query_scalar::<_, Uuid>(
                    r#"
                    UPDATE notifications
                    SET status = 'scheduled',
                        claimed_at = NULL,
                        delivery_started_at = NULL,
                        updated_at = NOW()
                    WHERE status = 'dispatching'
                      AND COALESCE(delivery_started_at, claimed_at) < $1
                    RETURNING uid
                    "#,
                )
                .bind(cutoff)
                .fetch_all(&self.pool)
            })
            .await?;

        if !released.is_empty() {
            tracing::warn!(count = released.len(), "Released stale dispatch claims");
        }
        Ok(released)
    }
}
