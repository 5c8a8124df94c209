//! Notification state machine.
//!
//! ```text
//! scheduled ──claim──▶ dispatching ──▶ sent
//!     │                    │  └──────▶ failed
//!     │                    └─retry/revert─▶ scheduled
//!     └──cancel──▶ cancelled
//! ```
//!
//! Both store implementations consult [`check_transition`] before writing, so
//! an illegal write is rejected before it reaches the row.

use uuid::Uuid;

use delayed_common::error::AppError;
use delayed_common::types::NotificationStatus::{self, *};

/// Whether `from -> to` is an edge of the state machine.
pub fn is_legal(from: NotificationStatus, to: NotificationStatus) -> bool {
    matches!(
        (from, to),
        (Scheduled, Dispatching)
            | (Scheduled, Cancelled)
            | (Dispatching, Sent)
            | (Dispatching, Failed)
            | (Dispatching, Scheduled)
    )
}

/// Reject any write that is not an edge of the state machine.
pub fn check_transition(
    uid: Uuid,
    from: NotificationStatus,
    to: NotificationStatus,
) -> Result<(), AppError> {
    if is_legal(from, to) {
        Ok(())
    } else {
        tracing::error!(uid = %uid, from = %from, to = %to, "Illegal status transition rejected");
        Err(AppError::InvalidTransition { uid, from, to })
    }
}
