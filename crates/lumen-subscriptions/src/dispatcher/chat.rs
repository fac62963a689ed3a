//! Chat-message channel: posts a compact message to a chat webhook.
//!
//! The endpoint is the bot/webhook URL of the chat system; the request
//! carries a short text line plus the full serialized notification, and the
//! response is judged by HTTP status like a REST hook.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use super::DeliveryChannel;
use crate::types::{ChannelConfig, DeliveryOutcome};

pub struct ChatChannel {
    client: Client,
}

impl ChatChannel {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for ChatChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryChannel for ChatChannel {
    fn code(&self) -> &'static str {
        "chat-message"
    }

    async fn deliver(
        &self,
        subscription_id: &str,
        channel: &ChannelConfig,
        payload: &[u8],
        _content_type: &str,
    ) -> DeliveryOutcome {
        let Some(endpoint) = channel.endpoint.as_deref() else {
            return DeliveryOutcome::Fatal("chat-message channel has no endpoint".into());
        };

        let notification: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(e) => return DeliveryOutcome::Fatal(format!("payload is not JSON: {e}")),
        };

        let body = json!({
            "text": format!("Subscription {subscription_id}: new notification"),
            "notification": notification,
            "disable_web_page_preview": true,
        });

        let mut request = self.client.post(endpoint).json(&body);
        for (key, value) in &channel.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                if (200..300).contains(&status) {
                    // Chat APIs routinely answer 200 with {"ok": false}.
                    let body: serde_json::Value = response.json().await.unwrap_or(json!({}));
                    if body.get("ok").and_then(|v| v.as_bool()) == Some(false) {
                        let description = body
                            .get("description")
                            .and_then(|v| v.as_str())
                            .unwrap_or("chat API reported failure");
                        return DeliveryOutcome::Fatal(description.to_string());
                    }
                    tracing::debug!(subscription_id, endpoint, "Chat notification sent");
                    DeliveryOutcome::Ok {
                        http_status: Some(status),
                    }
                } else if matches!(status, 408 | 425 | 429 | 500 | 502 | 503 | 504) {
                    DeliveryOutcome::Retryable(format!("HTTP {status}"))
                } else {
                    DeliveryOutcome::Fatal(format!("HTTP {status}"))
                }
            }
            Err(e) => DeliveryOutcome::Retryable(e.to_string()),
        }
    }
}
