//! Shared application state for the Axum API server.

use std::collections::BTreeSet;
use std::sync::Arc;

use delayed_store::NotificationStore;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn NotificationStore>,
    /// Channels a notification may request; anything else is rejected.
    pub channels: Arc<BTreeSet<String>>,
}

impl AppState {
    pub fn new(store: Arc<dyn NotificationStore>, channels: impl IntoIterator<Item = String>) -> Self {
        Self {
            store,
            channels: Arc::new(channels.into_iter().map(|c| c.to_lowercase()).collect()),
        }
    }
}
