//! Lifecycle notifications delivered to a Discord webhook
//!
//! Delivery is fire-and-forget: each notification is executed on its own
//! task and failures are only logged.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use twilight_http::Client;
use twilight_model::channel::message::embed::{Embed, EmbedField, EmbedFooter};
use twilight_model::id::marker::WebhookMarker;
use twilight_model::id::Id;
use twilight_model::util::Timestamp;

/// Embed colors
pub mod colors {
    /// Something is in progress
    pub const YELLOW: u32 = 0xE7E108;
    /// Something succeeded
    pub const GREEN: u32 = 0x0DD330;
    /// Something failed
    pub const RED: u32 = 0xF32C2A;
}

/// One webhook notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub color: u32,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<NotificationField>,
    /// Unix seconds
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationField {
    pub name: String,
    pub value: String,
}

impl Notification {
    pub fn new(color: u32, title: impl Into<String>, description: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        Self {
            color,
            title: title.into(),
            description: description.into(),
            fields: Vec::new(),
            timestamp,
        }
    }

    /// Attach a field rendered as a code block
    pub fn with_code_field(mut self, name: impl Into<String>, value: impl std::fmt::Display) -> Self {
        self.fields.push(NotificationField {
            name: name.into(),
            value: format!("```\n{value}\n```"),
        });
        self
    }

    fn into_embed(self) -> Embed {
        let timestamp = i64::try_from(self.timestamp)
            .ok()
            .and_then(|secs| Timestamp::from_secs(secs).ok());

        Embed {
            author: None,
            color: Some(self.color),
            description: Some(self.description),
            fields: self
                .fields
                .into_iter()
                .map(|f| EmbedField {
                    inline: false,
                    name: f.name,
                    value: f.value,
                })
                .collect(),
            footer: Some(EmbedFooter {
                icon_url: None,
                proxy_icon_url: None,
                text: env!("CARGO_PKG_NAME").to_string(),
            }),
            image: None,
            kind: "rich".to_string(),
            provider: None,
            thumbnail: None,
            timestamp,
            title: Some(self.title),
            url: None,
            video: None,
        }
    }
}

/// Sink for lifecycle notifications
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Used when no webhook is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledNotifier;

impl Notifier for DisabledNotifier {
    fn notify(&self, notification: Notification) {
        debug!(title = %notification.title, "Webhook disabled, dropping notification");
    }
}

/// Executes a Discord webhook for every notification
pub struct WebhookNotifier {
    http: Arc<Client>,
    webhook_id: Id<WebhookMarker>,
    token: Arc<str>,
}

impl WebhookNotifier {
    pub fn new(http: Arc<Client>, webhook_id: Id<WebhookMarker>, token: impl Into<Arc<str>>) -> Self {
        Self {
            http,
            webhook_id,
            token: token.into(),
        }
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, notification: Notification) {
        let http = Arc::clone(&self.http);
        let webhook_id = self.webhook_id;
        let token = Arc::clone(&self.token);
        let title = notification.title.clone();

        tokio::spawn(async move {
            let embeds = [notification.into_embed()];
            if let Err(e) = http.execute_webhook(webhook_id, &token).embeds(&embeds).await {
                warn!(error = %e, title, "Webhook delivery failed");
            }
        });
    }
}
