//! Notification scheduling routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use delayed_common::error::AppError;
use delayed_common::types::{NewNotification, Notification, normalize_channels};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/notify", post(create_notification))
        .route("/notify/{uid}", get(get_notification).delete(cancel_notification))
}

#[derive(Debug, Deserialize)]
pub struct CreateNotificationRequest {
    pub user_id: i64,
    pub channels: Vec<String>,
    pub content: String,
    pub send_for: DateTime<Utc>,
}

impl CreateNotificationRequest {
    /// Check the request against the enabled channel set and build the row to insert.
    fn into_new(self, state: &AppState) -> Result<NewNotification, AppError> {
        if self.content.trim().is_empty() {
            return Err(AppError::Validation("content must not be empty".to_string()));
        }

        let channels = normalize_channels(&self.channels);
        if channels.is_empty() {
            return Err(AppError::Validation(
                "At least one delivery channel is required".to_string(),
            ));
        }
        let unknown: Vec<&str> = channels
            .iter()
            .filter(|c| !state.channels.contains(c.as_str()))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(AppError::Validation(format!(
                "Unsupported channel(s): {} (enabled: {})",
                unknown.join(", "),
                state.channels.iter().cloned().collect::<Vec<_>>().join(", ")
            )));
        }

        Ok(NewNotification {
            uid: Uuid::new_v4(),
            user_id: self.user_id,
            channels,
            content: self.content,
            send_for: self.send_for,
        })
    }
}

/// POST /notify — Schedule a notification.
async fn create_notification(
    State(state): State<AppState>,
    Json(request): Json<CreateNotificationRequest>,
) -> Result<(StatusCode, Json<Notification>), AppError> {
    let new = request.into_new(&state)?;
    let notification = state.store.create(new).await?;

    tracing::info!(
        uid = %notification.uid,
        user_id = notification.user_id,
        send_for = %notification.send_for,
        channels = ?notification.channels,
        "Notification scheduled"
    );
    Ok((StatusCode::CREATED, Json(notification)))
}

/// GET /notify/:uid — Current state of a notification.
async fn get_notification(
    State(state): State<AppState>,
    Path(uid): Path<Uuid>,
) -> Result<Json<Notification>, AppError> {
    let notification = state.store.get(uid).await?;
    Ok(Json(notification))
}

/// DELETE /notify/:uid — Cancel a notification that has not been dispatched yet.
async fn cancel_notification(
    State(state): State<AppState>,
    Path(uid): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    match state.store.cancel(uid).await {
        Ok(notification) => {
            tracing::info!(uid = %uid, "Notification cancelled");
            Ok(Json(json!({
                "cancelled": true,
                "uid": notification.uid,
                "status": notification.status,
            })))
        }
        Err(AppError::NotFound(_)) => {
            // Either unknown (404 from get) or past the point of cancellation.
            let current = state.store.get(uid).await?;
            tracing::info!(uid = %uid, status = %current.status, "Cancel refused");
            Ok(Json(json!({
                "cancelled": false,
                "uid": uid,
                "status": current.status,
                "reason": "already dispatching or terminal",
            })))
        }
        Err(e) => Err(e),
    }
}
