//! Chat notification agency
//!
//! Alarms are correlated with their history record through the tick uuid.
//! Sending never fails from the caller's point of view: delivery problems
//! are reported inside the returned value and end up in the record's
//! `alarm_error` field.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// Outcome of one chat send.
#[derive(Debug, Clone)]
pub struct ChatDelivery {
    /// Time the send was attempted
    pub time: DateTime<Utc>,
    /// Rendered message text
    pub text: String,
    /// Delivery error, if the message did not go out
    pub error: Option<String>,
}

/// Chat notification channel.
#[async_trait::async_trait]
pub trait ChatAgency: Send + Sync {
    /// Send a message decorated with the emoji and correlated by the tick
    /// uuid. Never fails; problems surface in the returned delivery.
    async fn send_message(&self, emoji: &str, text: &str, uuid: &str) -> ChatDelivery;
}

/// Render the emoji, body and correlation id into one message line.
fn render_message(emoji: &str, text: &str, uuid: &str) -> String {
    format!(":{}: {} (check: {})", emoji, text, uuid)
}

/// Slack incoming-webhook chat channel.
#[derive(Debug)]
pub struct SlackWebhookChat {
    webhook_url: String,
    channel: Option<String>,
    username: Option<String>,
    client: reqwest::Client,
}

impl SlackWebhookChat {
    /// Create a new Slack webhook channel.
    pub fn new(webhook_url: String, channel: Option<String>, username: Option<String>) -> Self {
        Self {
            webhook_url,
            channel,
            username,
            client: reqwest::Client::new(),
        }
    }

    fn payload(&self, rendered: &str) -> serde_json::Value {
        serde_json::json!({
            "username": self.username.as_deref().unwrap_or(crate::NAME),
            "channel": self.channel,
            "text": rendered,
        })
    }
}

#[async_trait::async_trait]
impl ChatAgency for SlackWebhookChat {
    async fn send_message(&self, emoji: &str, text: &str, uuid: &str) -> ChatDelivery {
        let time = Utc::now();
        let rendered = render_message(emoji, text, uuid);

        let result = self
            .client
            .post(&self.webhook_url)
            .json(&self.payload(&rendered))
            .send()
            .await;

        let error = match result {
            Ok(response) if response.status().is_success() => None,
            Ok(response) => Some(format!("slack webhook returned status: {}", response.status())),
            Err(e) => Some(format!("failed to send slack notification: {}", e)),
        };

        if let Some(e) = &error {
            warn!("chat delivery failed: {}", e);
        }

        ChatDelivery {
            time,
            text: rendered,
            error,
        }
    }
}

/// No-op channel used when alerting is not configured.
#[derive(Debug, Default)]
pub struct DisabledChat;

#[async_trait::async_trait]
impl ChatAgency for DisabledChat {
    async fn send_message(&self, emoji: &str, text: &str, uuid: &str) -> ChatDelivery {
        let rendered = render_message(emoji, text, uuid);
        debug!("chat alerting disabled, dropping message: {}", rendered);
        ChatDelivery {
            time: Utc::now(),
            text: rendered,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_message() {
        let rendered = render_message("pill", "!disk check weak detected!", "abc-123");
        assert_eq!(rendered, ":pill: !disk check weak detected! (check: abc-123)");
    }

    #[test]
    fn test_slack_payload_shape() {
        let chat = SlackWebhookChat::new(
            "https://hooks.slack.com/services/xxx".to_string(),
            Some("#fleet-alarms".to_string()),
            Some("healthwatch".to_string()),
        );
        let payload = chat.payload(":heart: recovered (check: u1)");
        assert_eq!(payload["username"], "healthwatch");
        assert_eq!(payload["channel"], "#fleet-alarms");
        assert_eq!(payload["text"], ":heart: recovered (check: u1)");
    }

    #[test]
    fn test_slack_payload_defaults_username() {
        let chat = SlackWebhookChat::new("https://hooks.slack.com/test".to_string(), None, None);
        let payload = chat.payload("hi");
        assert_eq!(payload["username"], crate::NAME);
        assert_eq!(payload["channel"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_disabled_chat_reports_clean_delivery() {
        let chat = DisabledChat;
        let delivery = chat.send_message("x", "error occurred", "u2").await;
        assert!(delivery.error.is_none());
        assert!(delivery.text.contains("error occurred"));
        assert!(delivery.text.contains("u2"));
    }
}
