//! Facebook Messenger and Instagram share the Messenger Platform shape:
//! `entry[0].messaging[0].{sender.id, message}`.

use super::{InboundContent, InboundEnvelope, str_at};
use crate::bus::ChannelType;
use chrono::{DateTime, Utc};
use serde_json::Value;

pub(super) fn parse(payload: &Value, channel: ChannelType) -> Option<InboundEnvelope> {
    let messaging = payload.pointer("/entry/0/messaging/0")?;
    let message = messaging.get("message")?;
    let sender = str_at(messaging, "/sender/id").filter(|s| !s.is_empty())?;

    let text = message.get("text").and_then(Value::as_str).unwrap_or("");
    let attachment = message.pointer("/attachments/0");
    let url = || {
        attachment
            .and_then(|a| str_at(a, "/payload/url"))
            .unwrap_or("")
            .to_string()
    };
    let content = match attachment.and_then(|a| a.get("type")).and_then(Value::as_str) {
        Some("audio") => InboundContent::Audio { url: url() },
        Some("image") => InboundContent::Image { url: url() },
        _ => InboundContent::Text(text.to_string()),
    };

    let observed_at = messaging
        .get("timestamp")
        .and_then(Value::as_i64)
        .and_then(DateTime::<Utc>::from_timestamp_millis);

    Some(InboundEnvelope {
        channel,
        user_id: sender.to_string(),
        content,
        is_echo: message
            .get("is_echo")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        observed_at,
    })
}
