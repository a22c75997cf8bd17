//! Inbound boundary: validated envelopes become buffered fragments.

use crate::bus::{ConversationKey, Fragment, FragmentKind};
use crate::channels::{InboundContent, InboundEnvelope};
use crate::errors::CoalesceResult;
use crate::media::MediaResolver;
use crate::utils::truncate_chars;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct InboundProcessor {
    media: Arc<dyn MediaResolver>,
    max_message_length: usize,
}

impl InboundProcessor {
    pub fn new(media: Arc<dyn MediaResolver>, max_message_length: usize) -> Self {
        Self {
            media,
            max_message_length: max_message_length.max(1),
        }
    }

    /// Resolve `envelope` into the fragment to buffer.
    ///
    /// `Ok(None)` means the message is not aggregated: our own echo, or a
    /// message with no text (including media that resolved to nothing).
    pub async fn process(
        &self,
        envelope: InboundEnvelope,
    ) -> CoalesceResult<Option<(ConversationKey, Fragment)>> {
        let key = ConversationKey::new(envelope.channel, envelope.user_id);
        if envelope.is_echo {
            debug!("ignoring echo for {}", key);
            return Ok(None);
        }
        if envelope.content.is_empty() {
            debug!(
                "ignoring empty {} message for {}",
                envelope.content.type_name(),
                key
            );
            return Ok(None);
        }

        let (text, kind) = match envelope.content {
            InboundContent::Text(text) => (text, FragmentKind::Text),
            InboundContent::Audio { url } => {
                (self.media.transcribe(&url).await?, FragmentKind::AudioTranscript)
            }
            InboundContent::Image { url } => (
                self.media.extract_image_text(&url).await?,
                FragmentKind::ImageText,
            ),
        };

        let text = text.trim();
        if text.is_empty() {
            debug!("{} message for {} resolved to no text", kind.as_str(), key);
            return Ok(None);
        }

        let (text, truncated) = truncate_chars(text, self.max_message_length);
        if truncated {
            warn!(
                "inbound {} message for {} truncated to {} chars",
                kind.as_str(),
                key,
                self.max_message_length
            );
        }

        let observed_at = envelope.observed_at.unwrap_or_else(Utc::now);
        Ok(Some((key, Fragment::new(text, kind, observed_at))))
    }
}
