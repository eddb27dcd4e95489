//! Best-effort outbound notifications.
//!
//! A [`Notification`] is a short embed-style message. Delivery goes through a
//! [`Notifier`]; the dispatcher logs and counts failures but never retries or
//! lets them reach durable state.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tracing::info;

pub const COLOR_KILL: u32 = 0xE74C3C;
pub const COLOR_VIOLATION: u32 = 0xFF0000;
pub const COLOR_ALERT: u32 = 0xFFA500;
pub const COLOR_ACHIEVEMENT: u32 = 0xF1C40F;
pub const COLOR_WAR: u32 = 0x9B59B6;
pub const COLOR_HOTZONE: u32 = 0xFF4500;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub title: String,
    pub description: String,
    pub color: u32,
    pub urgent: bool,
    /// Identity or clan the message is addressed to; `None` for broadcasts.
    pub recipient: Option<String>,
}

impl Notification {
    pub fn new(title: impl Into<String>, description: impl Into<String>, color: u32) -> Self {
        Notification {
            title: title.into(),
            description: description.into(),
            color,
            urgent: false,
            recipient: None,
        }
    }

    pub fn urgent(mut self) -> Self {
        self.urgent = true;
        self
    }

    pub fn to(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook returned status {0}")]
    Status(u16),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Posts Discord-compatible embed payloads to a webhook URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    username: String,
}

impl WebhookNotifier {
    pub fn new(url: &str, username: &str, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(WebhookNotifier {
            client,
            url: url.to_string(),
            username: username.to_string(),
        })
    }

    pub fn payload(&self, n: &Notification) -> serde_json::Value {
        let mut description = n.description.clone();
        if let Some(recipient) = &n.recipient {
            description = format!("{}\n\nFor: {}", description, recipient);
        }
        json!({
            "username": self.username,
            "content": if n.urgent { "@here" } else { "" },
            "embeds": [{
                "title": n.title,
                "description": description,
                "color": n.color,
            }],
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&self.payload(notification))
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(NotifyError::Status(status.as_u16()))
        }
    }
}

/// Used when no webhook is configured: notifications only reach the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, n: &Notification) -> Result<(), NotifyError> {
        info!(title = %n.title, description = %n.description, urgent = n.urgent, "notification");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_has_embed_fields() {
        let notifier =
            WebhookNotifier::new("http://127.0.0.1:9/hook", "Killfeed", Duration::from_secs(1))
                .unwrap();
        let n = Notification::new("Base breach", "Intruder inside", COLOR_VIOLATION)
            .urgent()
            .to("clan WOLF");
        let body = notifier.payload(&n);
        assert_eq!(body["username"], "Killfeed");
        assert_eq!(body["content"], "@here");
        assert_eq!(body["embeds"][0]["title"], "Base breach");
        assert_eq!(body["embeds"][0]["color"], COLOR_VIOLATION);
        assert!(body["embeds"][0]["description"]
            .as_str()
            .unwrap()
            .contains("clan WOLF"));
    }

    #[test]
    fn non_urgent_has_no_mention() {
        let notifier =
            WebhookNotifier::new("http://127.0.0.1:9/hook", "Killfeed", Duration::from_secs(1))
                .unwrap();
        let body = notifier.payload(&Notification::new("Kill", "A killed B", COLOR_KILL));
        assert_eq!(body["content"], "");
    }

    #[tokio::test]
    async fn unreachable_webhook_is_an_error() {
        let notifier = WebhookNotifier::new(
            "http://127.0.0.1:9/hook",
            "Killfeed",
            Duration::from_millis(500),
        )
        .unwrap();
        let result = notifier
            .send(&Notification::new("t", "d", COLOR_KILL))
            .await;
        assert!(result.is_err());
    }
}
