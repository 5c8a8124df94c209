//! Telegram channel via the Bot API (`POST /bot<token>/sendMessage`).
//!
//! The notification's `user_id` is used as the `chat_id`.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use crate::adapter::{ChannelAdapter, DeliveryError, classify_reqwest_error, classify_status};

/// Telegram `sendMessage` text limit (UTF-8 characters).
const MESSAGE_LIMIT: usize = 4096;

pub struct TelegramAdapter {
    client: Client,
    api_url: String,
    bot_token: String,
}

impl TelegramAdapter {
    pub fn new(api_url: impl Into<String>, bot_token: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_url: api_url.into(),
            bot_token: bot_token.into(),
        }
    }

    fn send_message_url(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.api_url.trim_end_matches('/'),
            self.bot_token
        )
    }
}

fn truncate_message(text: &str) -> String {
    if text.chars().count() <= MESSAGE_LIMIT {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(MESSAGE_LIMIT - 3).collect();
    truncated.push_str("...");
    truncated
}

#[async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn channel(&self) -> &str {
        "telegram"
    }

    async fn send(&self, recipient: i64, content: &str) -> Result<(), DeliveryError> {
        let payload = json!({
            "chat_id": recipient,
            "text": truncate_message(content),
        });

        let response = self
            .client
            .post(self.send_message_url())
            .json(&payload)
            .send()
            .await
            .map_err(|e| classify_reqwest_error("telegram", &e))?;

        let status = response.status();
        let body = if status.is_success() {
            String::new()
        } else {
            response.text().await.unwrap_or_default()
        };

        if let Err(e) = classify_status("telegram", status, &body) {
            tracing::warn!(chat_id = recipient, status = %status, error = %e, "Telegram sendMessage failed");
            return Err(e);
        }

        tracing::debug!(chat_id = recipient, "Telegram message sent");
        Ok(())
    }
}
