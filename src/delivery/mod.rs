use crate::bus::CombinedMessage;
use crate::config::DeliveryConfig;
use crate::utils::http::{MAX_REPLY_BYTES, http_client, limited_text};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Downstream failure, classified for the retry loop.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("delivery endpoint not configured")]
    NotConfigured,

    #[error("delivery timed out")]
    Timeout,

    #[error("delivery transport error: {0}")]
    Transport(String),

    #[error("delivery endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
}

impl DeliveryError {
    /// Timeouts, connection failures, 5xx and 429 are worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotConfigured => false,
            Self::Timeout | Self::Transport(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
        }
    }
}

/// JSON document posted downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub user_id: String,
    pub channel: String,
    pub text: String,
    /// Set on every attempt after the first.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retry: bool,
}

impl WebhookPayload {
    pub fn from_message(message: &CombinedMessage) -> Self {
        Self {
            user_id: message.key.user_id.clone(),
            channel: message.key.channel.to_string(),
            text: message.text.clone(),
            retry: false,
        }
    }
}

/// Successful downstream response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeliveryAck {
    pub status: u16,
    /// Reply text from the response body, when the endpoint sends one.
    pub reply: Option<String>,
}

#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, payload: &WebhookPayload) -> Result<DeliveryAck, DeliveryError>;

    fn is_configured(&self) -> bool {
        true
    }
}

/// HTTP POST of [`WebhookPayload`] to the configured automation endpoint.
pub struct WebhookDelivery {
    client: Client,
    url: String,
}

impl WebhookDelivery {
    pub fn new(config: &DeliveryConfig) -> Self {
        Self {
            client: http_client(Duration::from_secs(config.timeout_secs)),
            url: config.webhook_url.clone(),
        }
    }

    pub fn with_client(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    /// Send a fixed test payload and report the outcome.
    pub async fn test_webhook(&self) -> Result<DeliveryAck, DeliveryError> {
        let payload = WebhookPayload {
            user_id: "test_user".to_string(),
            channel: "test".to_string(),
            text: "Test message from chatcoalesce".to_string(),
            retry: false,
        };
        self.deliver(&payload).await
    }
}

#[async_trait]
impl Delivery for WebhookDelivery {
    async fn deliver(&self, payload: &WebhookPayload) -> Result<DeliveryAck, DeliveryError> {
        if self.url.is_empty() {
            return Err(DeliveryError::NotConfigured);
        }

        debug!(
            "posting {} chars for {}:{} (retry={})",
            payload.text.chars().count(),
            payload.channel,
            payload.user_id,
            payload.retry
        );
        let resp = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout
                } else {
                    DeliveryError::Transport(e.to_string())
                }
            })?;

        let status = resp.status().as_u16();
        let body = match limited_text(resp, MAX_REPLY_BYTES).await {
            Ok(body) => body,
            Err(e) => {
                warn!("failed to read delivery response body: {}", e);
                String::new()
            }
        };

        if !(200..300).contains(&status) {
            return Err(DeliveryError::Status { status, body });
        }

        info!(
            "delivered to webhook for {}:{} ({})",
            payload.channel, payload.user_id, status
        );
        Ok(DeliveryAck {
            status,
            reply: extract_reply(&body),
        })
    }

    fn is_configured(&self) -> bool {
        !self.url.is_empty()
    }
}

/// Pull human-readable reply text out of a webhook response body.
///
/// JSON bodies are searched for a string `reply`, `message`, or `text`
/// field; any other non-empty body is used verbatim.
pub fn extract_reply(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(obj) = value.as_object() {
            return ["reply", "message", "text"]
                .iter()
                .find_map(|field| obj.get(*field).and_then(|v| v.as_str()))
                .map(str::to_string);
        }
        if let Some(s) = value.as_str() {
            return Some(s.to_string());
        }
        return None;
    }
    Some(trimmed.to_string())
}

#[cfg(test)]
mod tests;
