use crate::bus::ChannelType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Identifies one aggregation stream: a single user on a single channel.
///
/// Both the buffer storage keys and the timer-tracking key are derived from
/// this value, so they always refer to the same logical conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    pub channel: ChannelType,
    pub user_id: String,
}

impl ConversationKey {
    pub fn new(channel: ChannelType, user_id: impl Into<String>) -> Self {
        Self {
            channel,
            user_id: user_id.into(),
        }
    }

    /// `{channel}:{user_id}`, used for local timer bookkeeping and as the
    /// member name in the shared deadline schedule.
    pub fn timer_key(&self) -> String {
        format!("{}:{}", self.channel, self.user_id)
    }

    /// Ordered fragment list for this conversation.
    pub fn buffer_key(&self, prefix: &str) -> String {
        format!("{}chat:{}:{}", prefix, self.channel, self.user_id)
    }

    /// "Window open" marker for this conversation.
    pub fn marker_key(&self, prefix: &str) -> String {
        format!("{}start:{}:{}", prefix, self.channel, self.user_id)
    }

    /// Inverse of [`ConversationKey::timer_key`]. User ids may themselves contain
    /// `:`, so only the first separator is significant.
    pub fn parse(timer_key: &str) -> Option<Self> {
        let (channel, user_id) = timer_key.split_once(':')?;
        if user_id.is_empty() {
            return None;
        }
        let channel = ChannelType::from_str(channel).ok()?;
        Some(Self::new(channel, user_id))
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.channel, self.user_id)
    }
}

/// Where a fragment's text came from before it reached the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentKind {
    Text,
    AudioTranscript,
    ImageText,
}

impl FragmentKind {
    /// Short provenance tag prefixed to non-text fragments in the combined message.
    pub fn tag(self) -> Option<&'static str> {
        match self {
            FragmentKind::Text => None,
            FragmentKind::AudioTranscript => Some("[audio]"),
            FragmentKind::ImageText => Some("[image]"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FragmentKind::Text => "text",
            FragmentKind::AudioTranscript => "audio",
            FragmentKind::ImageText => "image",
        }
    }
}

/// One normalized inbound unit of content. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub text: String,
    pub kind: FragmentKind,
    pub observed_at: DateTime<Utc>,
}

impl Fragment {
    pub fn new(text: impl Into<String>, kind: FragmentKind, observed_at: DateTime<Utc>) -> Self {
        Self {
            text: text.into(),
            kind,
            observed_at,
        }
    }

    /// A plain text fragment observed now.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(text, FragmentKind::Text, Utc::now())
    }
}

/// Output of one flush: every fragment of a window, combined in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CombinedMessage {
    pub key: ConversationKey,
    pub text: String,
    pub fragment_count: usize,
    /// Whether `text` was cut to the configured maximum length.
    pub truncated: bool,
}
