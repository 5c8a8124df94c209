use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Scheduled,
    Dispatching,
    Sent,
    Failed,
    Cancelled,
}

impl NotificationStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NotificationStatus::Sent | NotificationStatus::Failed | NotificationStatus::Cancelled
        )
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationStatus::Scheduled => write!(f, "scheduled"),
            NotificationStatus::Dispatching => write!(f, "dispatching"),
            NotificationStatus::Sent => write!(f, "sent"),
            NotificationStatus::Failed => write!(f, "failed"),
            NotificationStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A notification scheduled for future delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub uid: Uuid,
    pub user_id: i64,
    pub channels: Vec<String>,
    pub content: String,
    pub status: NotificationStatus,
    pub send_for: DateTime<Utc>,
    pub send_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_error: String,
    /// Earliest time a retried notification becomes due again.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// When a scheduler last claimed the row for dispatch.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Incremented by every claim. A queued task is only valid for the claim it was published under.
    pub claim_seq: i64,
    /// When a worker began sending for the current claim.
    pub delivery_started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Notification {
    /// Build a freshly scheduled notification from creation parameters.
    pub fn scheduled(new: NewNotification, now: DateTime<Utc>) -> Self {
        Self {
            uid: new.uid,
            user_id: new.user_id,
            channels: normalize_channels(&new.channels),
            content: new.content,
            status: NotificationStatus::Scheduled,
            send_for: new.send_for,
            send_at: None,
            retry_count: 0,
            last_error: String::new(),
            next_attempt_at: None,
            claimed_at: None,
            claim_seq: 0,
            delivery_started_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the notification may be claimed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == NotificationStatus::Scheduled
            && self.send_for <= now
            && self.next_attempt_at.is_none_or(|at| at <= now)
    }
}

/// Parameters for inserting a new notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNotification {
    pub uid: Uuid,
    pub user_id: i64,
    pub channels: Vec<String>,
    pub content: String,
    pub send_for: DateTime<Utc>,
}

/// Work item carried by the delivery queue, one per claimed notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTask {
    pub uid: Uuid,
    pub user_id: i64,
    pub channels: Vec<String>,
    pub content: String,
    pub retry_count: i32,
    /// Claim this task was published under.
    #[serde(default)]
    pub claim_seq: i64,
}

impl From<&Notification> for DeliveryTask {
    fn from(n: &Notification) -> Self {
        Self {
            uid: n.uid,
            user_id: n.user_id,
            channels: n.channels.clone(),
            content: n.content.clone(),
            retry_count: n.retry_count,
            claim_seq: n.claim_seq,
        }
    }
}

/// Lowercase, trim, sort and de-duplicate channel names.
pub fn normalize_channels(channels: &[String]) -> Vec<String> {
    let mut out: Vec<String> = channels
        .iter()
        .map(|c| c.trim().to_lowercase())
        .filter(|c| !c.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}
