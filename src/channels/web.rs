use super::{InboundContent, InboundEnvelope, str_at};
use crate::bus::ChannelType;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Web widget: `{channel:"web", user_id, type, text?, payload?, observed_at?}`.
pub(super) fn parse(payload: &Value) -> Option<InboundEnvelope> {
    let user_id = payload
        .get("user_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())?;
    let kind = payload.get("type").and_then(Value::as_str)?;

    let content = match kind {
        "text" => {
            let text = payload
                .get("text")
                .and_then(Value::as_str)
                .or_else(|| str_at(payload, "/payload/text"))
                .unwrap_or("");
            InboundContent::Text(text.to_string())
        }
        "audio" => InboundContent::Audio {
            url: str_at(payload, "/payload/audio_url").unwrap_or("").to_string(),
        },
        "image" => InboundContent::Image {
            url: str_at(payload, "/payload/image_url").unwrap_or("").to_string(),
        },
        _ => return None,
    };

    let observed_at = payload
        .get("observed_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    Some(InboundEnvelope {
        channel: ChannelType::Web,
        user_id: user_id.to_string(),
        content,
        is_echo: false,
        observed_at,
    })
}
