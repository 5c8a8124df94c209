//! Email channel backed by the Resend HTTP API (`POST /emails`).

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use crate::adapter::{ChannelAdapter, DeliveryError, classify_reqwest_error, classify_status};

const SUBJECT_LIMIT: usize = 78;

#[derive(Debug, Serialize)]
struct SendEmail<'a> {
    from: &'a str,
    to: Vec<String>,
    subject: String,
    text: &'a str,
}

pub struct EmailAdapter {
    client: Client,
    api_url: String,
    api_key: String,
    from: String,
    /// Recipient address with a `{user_id}` placeholder.
    recipient_template: String,
}

impl EmailAdapter {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        from: impl Into<String>,
        recipient_template: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            api_url: api_url.into(),
            api_key: api_key.into(),
            from: from.into(),
            recipient_template: recipient_template.into(),
        }
    }

    pub fn recipient_address(&self, user_id: i64) -> String {
        self.recipient_template
            .replace("{user_id}", &user_id.to_string())
    }
}

/// First line of the content, shortened to fit a subject header.
fn subject_for(content: &str) -> String {
    let first_line = content.lines().next().unwrap_or_default().trim();
    if first_line.is_empty() {
        return "Notification".to_string();
    }
    if first_line.chars().count() <= SUBJECT_LIMIT {
        return first_line.to_string();
    }
    let mut subject: String = first_line.chars().take(SUBJECT_LIMIT - 3).collect();
    subject.push_str("...");
    subject
}

#[async_trait]
impl ChannelAdapter for EmailAdapter {
    fn channel(&self) -> &str {
        "email"
    }

    async fn send(&self, recipient: i64, content: &str) -> Result<(), DeliveryError> {
        let payload = SendEmail {
            from: &self.from,
            to: vec![self.recipient_address(recipient)],
            subject: subject_for(content),
            text: content,
        };

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| classify_reqwest_error("email", &e))?;

        let status = response.status();
        let body = if status.is_success() {
            String::new()
        } else {
            response.text().await.unwrap_or_default()
        };

        if let Err(e) = classify_status("email", status, &body) {
            tracing::warn!(user_id = recipient, status = %status, error = %e, "Email send rejected");
            return Err(e);
        }

        tracing::debug!(user_id = recipient, "Email accepted by provider");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recipient_address_from_template() {
        let adapter = EmailAdapter::new(
            "http://localhost/emails",
            "key",
            "noreply@example.com",
            "user-{user_id}@example.com",
        );
        assert_eq!(adapter.recipient_address(42), "user-42@example.com");
    }

    #[test]
    fn test_subject_uses_first_line() {
        assert_eq!(subject_for("Meeting at 5\nbring slides"), "Meeting at 5");
        assert_eq!(subject_for("   \nbody"), "Notification");
        assert_eq!(subject_for(""), "Notification");
    }

    #[test]
    fn test_subject_is_shortened() {
        let subject = subject_for(&"a".repeat(200));
        assert_eq!(subject.chars().count(), SUBJECT_LIMIT);
        assert!(subject.ends_with("..."));
    }

    #[test]
    fn test_payload_shape() {
        let payload = SendEmail {
            from: "noreply@example.com",
            to: vec!["user-1@example.com".into()],
            subject: "hi".into(),
            text: "hi there",
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["to"][0], "user-1@example.com");
        assert_eq!(json["text"], "hi there");
    }
}
