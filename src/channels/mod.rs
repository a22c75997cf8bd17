//! Inbound payload detection.
//!
//! Each platform posts its own webhook shape. Detection turns a raw JSON body
//! into an [`InboundEnvelope`]; anything unrecognised yields `None` and is
//! acknowledged as filtered.

mod meta;
mod web;
mod whatsapp;

use crate::bus::ChannelType;
use chrono::{DateTime, Utc};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundContent {
    Text(String),
    Audio { url: String },
    Image { url: String },
}

impl InboundContent {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Audio { .. } => "audio",
            Self::Image { .. } => "image",
        }
    }

    /// Text or URL carried by the message; empty means nothing to aggregate.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.trim().is_empty(),
            Self::Audio { url } | Self::Image { url } => url.trim().is_empty(),
        }
    }
}

/// One inbound message before media resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEnvelope {
    pub channel: ChannelType,
    pub user_id: String,
    pub content: InboundContent,
    /// Sent by us (page echo or our own WhatsApp number).
    pub is_echo: bool,
    /// Client-supplied send time, when the platform provides one.
    pub observed_at: Option<DateTime<Utc>>,
}

/// Identify the platform and extract the first message of `payload`.
pub fn detect(payload: &Value, whatsapp_phone_number_id: &str) -> Option<InboundEnvelope> {
    let object = payload.get("object").and_then(Value::as_str);
    let has_entry = payload.get("entry").is_some();

    match object {
        Some("page") if has_entry => meta::parse(payload, ChannelType::Facebook),
        Some("instagram") if has_entry => meta::parse(payload, ChannelType::Instagram),
        Some("whatsapp_business_account") if has_entry => {
            whatsapp::parse(payload, whatsapp_phone_number_id)
        }
        _ if payload.get("channel").and_then(Value::as_str) == Some("web") => web::parse(payload),
        _ => None,
    }
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}
