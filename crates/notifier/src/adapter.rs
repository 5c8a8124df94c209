use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;

/// Result of a single failed channel send.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Worth another attempt later (timeouts, rate limits, provider outages).
    #[error("transient: {0}")]
    Transient(String),

    /// Retrying cannot help (bad recipient, rejected payload, unknown channel).
    #[error("permanent: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, DeliveryError::Permanent(_))
    }
}

/// A delivery channel such as `email` or `telegram`.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Channel name as stored in a notification's channel set.
    fn channel(&self) -> &str;

    async fn send(&self, recipient: i64, content: &str) -> Result<(), DeliveryError>;
}

/// Adapters keyed by channel name.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ChannelAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter` under its channel name, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        let name = adapter.channel().to_lowercase();
        tracing::info!(channel = %name, "Channel adapter registered");
        self.adapters.insert(name, adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, channel: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(channel).cloned()
    }

    /// Registered channel names, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Map a provider's HTTP status to a delivery result.
///
/// 2xx succeeds. 408, 429 and 5xx are transient; any other status is permanent.
pub fn classify_status(channel: &str, status: StatusCode, body: &str) -> Result<(), DeliveryError> {
    if status.is_success() {
        return Ok(());
    }

    let message = format!("{} returned {}: {}", channel, status, truncate(body, 256));
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        Err(DeliveryError::Transient(message))
    } else {
        Err(DeliveryError::Permanent(message))
    }
}

/// Transport failures are transient unless the request itself could not be built.
pub fn classify_reqwest_error(channel: &str, error: &reqwest::Error) -> DeliveryError {
    let message = format!("{} request failed: {}", channel, error);
    if error.is_builder() {
        DeliveryError::Permanent(message)
    } else {
        DeliveryError::Transient(message)
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
