//! Operator notification through the Telegram Bot API.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::http::HttpClient;

/// Text announced to the operator for one message.
///
/// Built once from sender and subject, then extended by value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationMessage(String);

impl NotificationMessage {
    pub fn new(sender: &str, subject: &str) -> Self {
        Self(format!("📧 You've got mail from {} about {}", sender, subject))
    }

    pub fn with_summary(self, summary: &str) -> Self {
        Self(format!("{}\nSummary:\n\n{}", self.0, summary.trim()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Credential and target of the operator chat.
#[derive(Debug, Clone)]
pub struct ChatChannel {
    pub token: String,
    pub chat_id: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, channel: &ChatChannel, text: &str) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

pub struct TelegramNotifier {
    http: Arc<HttpClient>,
    api_url: String,
}

impl TelegramNotifier {
    pub fn new(http: Arc<HttpClient>, api_url: impl Into<String>) -> Self {
        Self {
            http,
            api_url: api_url.into(),
        }
    }

    fn send_message_url(&self, token: &str) -> String {
        format!("{}/bot{}/sendMessage", self.api_url.trim_end_matches('/'), token)
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, channel: &ChatChannel, text: &str) -> Result<()> {
        let payload = SendMessage {
            chat_id: &channel.chat_id,
            text,
        };
        let reply = self
            .http
            .post_json(&self.send_message_url(&channel.token), None, &payload)
            .await?;

        if !reply.is_success() {
            return Err(anyhow!(
                "sendMessage failed with status {}: {}",
                reply.status,
                reply.text()
            ));
        }
        tracing::info!(chat_id = %channel.chat_id, "Telegram notification sent");
        Ok(())
    }
}
