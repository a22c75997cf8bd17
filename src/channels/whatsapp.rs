use super::{InboundContent, InboundEnvelope, str_at};
use crate::bus::ChannelType;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// WhatsApp Cloud API: `entry[0].changes[0].value.{messages[0], contacts[0]}`.
pub(super) fn parse(payload: &Value, our_number_id: &str) -> Option<InboundEnvelope> {
    let value = payload.pointer("/entry/0/changes/0/value")?;
    let message = value.pointer("/messages/0")?;
    let from = message.get("from").and_then(Value::as_str);
    let user_id = str_at(value, "/contacts/0/wa_id")
        .or(from)
        .filter(|s| !s.is_empty())?;

    let content = match message.get("type").and_then(Value::as_str) {
        Some("audio") => InboundContent::Audio {
            url: str_at(message, "/audio/url").unwrap_or("").to_string(),
        },
        Some("image") => InboundContent::Image {
            url: str_at(message, "/image/url").unwrap_or("").to_string(),
        },
        Some("text") => InboundContent::Text(str_at(message, "/text/body").unwrap_or("").to_string()),
        _ => InboundContent::Text(String::new()),
    };

    // Cloud API timestamps are unix seconds as a string.
    let observed_at = message
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));

    Some(InboundEnvelope {
        channel: ChannelType::WhatsApp,
        user_id: user_id.to_string(),
        content,
        is_echo: !our_number_id.is_empty() && from == Some(our_number_id),
        observed_at,
    })
}
