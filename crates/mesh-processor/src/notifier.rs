//! Group notification delivery
//!
//! The notifier consumes emitted message groups, resolves the sender and
//! gateway identities from stored node state, renders the text and hands it
//! to a [`NotificationSink`]. Store and delivery failures never stop the loop.

use crate::correlation::MessageGroup;
use crate::error::{ProcessorError, Result};
use crate::formatter::{render_group, FormatOptions, NodeIdentity, SenderIdentity};
use async_trait::async_trait;
use mesh_shared::store::{device_key, user_key};
use mesh_shared::{KeyedStore, NodeId, TelegramConfig};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use teloxide::payloads::SendMessageSetters;
use teloxide::requests::Requester;
use teloxide::types::{ChatId, LinkPreviewOptions, ParseMode, Recipient};
use teloxide::Bot;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Destination of rendered notifications
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, text: &str) -> Result<()>;
}

/// Posts notifications to a Telegram channel
pub struct TelegramSink {
    bot: Bot,
    recipient: Recipient,
}

impl TelegramSink {
    /// Create a sink for a channel given as `@username` or a numeric chat id
    pub fn new(token: &SecretString, channel_id: &str) -> Result<Self> {
        Ok(Self {
            bot: Bot::new(token.expose_secret().clone()),
            recipient: parse_recipient(channel_id)?,
        })
    }

    /// Build the sink configured by `TELEGRAM_*`, `None` when Telegram is off
    pub fn from_config(config: &TelegramConfig) -> Result<Option<Self>> {
        match (&config.bot_token, &config.channel_id) {
            (Some(token), Some(channel)) if config.is_active() => {
                Self::new(token, channel).map(Some)
            }
            _ => Ok(None),
        }
    }
}

fn parse_recipient(channel_id: &str) -> Result<Recipient> {
    let channel_id = channel_id.trim();

    if channel_id.starts_with('@') {
        return Ok(Recipient::ChannelUsername(channel_id.to_string()));
    }

    channel_id
        .parse::<i64>()
        .map(|id| Recipient::Id(ChatId(id)))
        .map_err(|_| ProcessorError::internal(format!("Invalid Telegram channel id: {}", channel_id)))
}

#[async_trait]
impl NotificationSink for TelegramSink {
    async fn send(&self, text: &str) -> Result<()> {
        self.bot
            .send_message(self.recipient.clone(), text)
            .parse_mode(ParseMode::Html)
            .link_preview_options(LinkPreviewOptions {
                is_disabled: true,
                url: None,
                prefer_small_media: false,
                prefer_large_media: false,
                show_above_text: false,
            })
            .await
            .map_err(|e| ProcessorError::delivery(e.to_string()))?;

        Ok(())
    }
}

/// Logs notifications instead of delivering them
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, text: &str) -> Result<()> {
        info!(text = %text, "Telegram disabled, notification not sent");
        Ok(())
    }
}

pub struct Notifier {
    store: Arc<dyn KeyedStore>,
    sink: Arc<dyn NotificationSink>,
    options: FormatOptions,
}

impl Notifier {
    pub fn new(
        store: Arc<dyn KeyedStore>,
        sink: Arc<dyn NotificationSink>,
        options: FormatOptions,
    ) -> Self {
        Self {
            store,
            sink,
            options,
        }
    }

    /// Node state hash, empty when the store cannot be read
    async fn device_state(&self, id: NodeId) -> HashMap<String, String> {
        self.store
            .get_all_fields(&device_key(id))
            .await
            .unwrap_or_else(|e| {
                warn!(node = %id, error = %e, "Failed to read node state");
                HashMap::new()
            })
    }

    async fn identity(&self, id: NodeId, device: &HashMap<String, String>) -> NodeIdentity {
        let from_state = device
            .get("user")
            .and_then(|user| serde_json::from_str::<Value>(user).ok())
            .map(|user| NodeIdentity {
                long_name: string_at(&user, &["data", "longName"]),
                short_name: string_at(&user, &["data", "shortName"]),
            })
            .unwrap_or_default();

        if from_state.long_name.is_some() {
            return from_state;
        }

        match self.store.get_all_fields(&user_key(id)).await {
            Ok(mut fields) => NodeIdentity {
                long_name: fields.remove("longName").filter(|name| !name.is_empty()),
                short_name: from_state
                    .short_name
                    .or_else(|| fields.remove("shortName").filter(|name| !name.is_empty())),
            },
            Err(e) => {
                warn!(node = %id, error = %e, "Failed to read node identity");
                from_state
            }
        }
    }

    /// Resolve the sender of a group with its latest device telemetry
    pub async fn resolve_sender(&self, id: NodeId) -> SenderIdentity {
        let device = self.device_state(id).await;
        let identity = self.identity(id, &device).await;

        let metrics = device
            .get("deviceMetrics")
            .and_then(|metrics| serde_json::from_str::<Value>(metrics).ok());
        let metric = |name: &str| {
            metrics
                .as_ref()
                .and_then(|m| m.pointer(&format!("/data/variant/value/{}", name)))
                .and_then(Value::as_f64)
        };

        SenderIdentity {
            identity,
            battery_level: metric("batteryLevel"),
            voltage: metric("voltage"),
        }
    }

    /// Resolve a gateway given by its `!hex` id
    pub async fn resolve_gateway(&self, gateway_id: &str) -> NodeIdentity {
        let Some(id) = NodeId::parse_hex(gateway_id) else {
            return NodeIdentity::default();
        };

        let device = self.device_state(id).await;
        self.identity(id, &device).await
    }

    /// Render and deliver one group, returning the rendered text
    pub async fn notify(&self, group: &MessageGroup) -> String {
        let sender = self.resolve_sender(group.event.origin_id).await;

        let mut gateways = HashMap::with_capacity(group.gateways.len());
        for receipt in &group.gateways {
            if let Some(gateway_id) = &receipt.gateway_id {
                let identity = self.resolve_gateway(gateway_id).await;
                gateways.insert(receipt.gateway_key.clone(), identity);
            }
        }

        let text = render_group(group, &sender, &gateways, &self.options);

        match self.sink.send(&text).await {
            Ok(()) => {
                debug!(message_id = group.message_id, "Notification delivered");

                #[cfg(feature = "metrics")]
                metrics::counter!("mesh_processor.notifications_sent").increment(1);
            }
            Err(e) => {
                error!(message_id = group.message_id, error = %e, "Failed to deliver notification");

                #[cfg(feature = "metrics")]
                metrics::counter!("mesh_processor.notifications_failed").increment(1);
            }
        }

        text
    }

    /// Deliver emitted groups until the channel closes
    pub async fn run(self, mut groups: mpsc::UnboundedReceiver<MessageGroup>) {
        while let Some(group) = groups.recv().await {
            self.notify(&group).await;
        }
        debug!("Emitted group channel closed, notifier stopped");
    }
}

fn string_at(value: &Value, path: &[&str]) -> Option<String> {
    path.iter()
        .try_fold(value, |value, key| value.get(*key))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
