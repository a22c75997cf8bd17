use crate::aggregator::dispatch::DeliveryDispatcher;
use crate::aggregator::stats::AggregatorStats;
use crate::aggregator::store::BufferStore;
use crate::bus::{CombinedMessage, ConversationKey, Fragment};
use crate::config::AggregationConfig;
use crate::errors::CoalesceResult;
use crate::notify::{NotifyKind, Notifier};
use crate::utils::truncate_chars;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const PROCESSING_NOTICE: &str = "Processing your message...";

/// Why a window is being flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// Local timer for the window with this deadline fired.
    Timer { deadline_ms: i64 },
    /// Recovery sweep found the window overdue in the shared schedule.
    Sweep { deadline_ms: i64 },
    /// Buffer reached its capacity before the window elapsed.
    BufferFull,
    /// Operator request.
    Manual,
}

impl FlushTrigger {
    /// Deadline that must still be scheduled for this flush to proceed.
    fn claim_token(self) -> Option<i64> {
        match self {
            Self::Timer { deadline_ms } | Self::Sweep { deadline_ms } => Some(deadline_ms),
            Self::BufferFull | Self::Manual => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timer { .. } => "timer",
            Self::Sweep { .. } => "sweep",
            Self::BufferFull => "buffer_full",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CombineOptions {
    pub separator: String,
    pub annotate_media: bool,
    pub max_length: usize,
}

impl CombineOptions {
    pub fn from_config(config: &AggregationConfig) -> Self {
        Self {
            separator: config.separator.clone(),
            annotate_media: config.annotate_media,
            max_length: config.max_message_length,
        }
    }
}

impl Default for CombineOptions {
    fn default() -> Self {
        Self::from_config(&AggregationConfig::default())
    }
}

/// Combine a drained window into one message.
///
/// Fragments are ordered by `observed_at` (stable, so equal timestamps keep
/// append order), blank ones are skipped, media-derived text is tagged when
/// requested, and the result is cut to `max_length` characters. Returns
/// `None` when nothing non-blank remains.
pub fn combine_fragments(
    key: &ConversationKey,
    mut fragments: Vec<Fragment>,
    options: &CombineOptions,
) -> Option<CombinedMessage> {
    fragments.sort_by_key(|f| f.observed_at);

    let parts: Vec<String> = fragments
        .iter()
        .filter_map(|f| {
            let text = f.text.trim();
            if text.is_empty() {
                return None;
            }
            Some(match f.kind.tag() {
                Some(tag) if options.annotate_media => format!("{} {}", tag, text),
                _ => text.to_string(),
            })
        })
        .collect();
    if parts.is_empty() {
        return None;
    }

    let joined = parts.join(&options.separator);
    let (text, truncated) = truncate_chars(&joined, options.max_length);
    Some(CombinedMessage {
        key: key.clone(),
        text: text.to_string(),
        fragment_count: parts.len(),
        truncated,
    })
}

/// Drain → combine → hand off to the delivery queue.
pub struct FlushPipeline {
    store: Arc<dyn BufferStore>,
    dispatcher: Arc<DeliveryDispatcher>,
    notifier: Arc<dyn Notifier>,
    stats: Arc<AggregatorStats>,
    options: CombineOptions,
}

impl FlushPipeline {
    pub fn new(
        store: Arc<dyn BufferStore>,
        dispatcher: Arc<DeliveryDispatcher>,
        notifier: Arc<dyn Notifier>,
        stats: Arc<AggregatorStats>,
        options: CombineOptions,
    ) -> Self {
        Self {
            store,
            dispatcher,
            notifier,
            stats,
            options,
        }
    }

    pub fn dispatcher(&self) -> &Arc<DeliveryDispatcher> {
        &self.dispatcher
    }

    /// Flush one conversation. Returns the message handed to delivery, or
    /// `None` when there was nothing to send (already drained, claimed by
    /// another flusher, or only blank fragments).
    pub async fn flush(
        &self,
        key: &ConversationKey,
        trigger: FlushTrigger,
    ) -> CoalesceResult<Option<CombinedMessage>> {
        let fragments = match trigger.claim_token() {
            Some(deadline_ms) => {
                let Some(fragments) = self.store.claim_and_drain(key, deadline_ms).await? else {
                    debug!(
                        "window {} for {} already claimed, skipping {} flush",
                        deadline_ms,
                        key,
                        trigger.as_str()
                    );
                    return Ok(None);
                };
                fragments
            }
            None => self.store.drain(key).await?,
        };
        if fragments.is_empty() {
            debug!("nothing buffered for {} ({} flush)", key, trigger.as_str());
            return Ok(None);
        }
        let drained = fragments.len();
        self.stats
            .record_flush(matches!(trigger, FlushTrigger::BufferFull));
        self.notifier
            .notify(key, PROCESSING_NOTICE, NotifyKind::Status)
            .await;

        let Some(message) = combine_fragments(key, fragments, &self.options) else {
            debug!("all {} fragments for {} were blank", drained, key);
            return Ok(None);
        };
        if message.truncated {
            warn!(
                "combined text for {} truncated to {} chars",
                key, self.options.max_length
            );
        }
        info!(
            "flushing {} fragments for {} ({} flush, {} chars)",
            message.fragment_count,
            key,
            trigger.as_str(),
            message.text.chars().count()
        );

        // A forced flush runs on the inbound request path and must not wait
        // for queue space.
        let dispatched = if trigger == FlushTrigger::BufferFull {
            self.dispatcher.dispatch_nowait(message.clone())
        } else {
            self.dispatcher.dispatch(message.clone()).await
        };
        if let Err(e) = dispatched {
            self.stats.record_error(key, &e.to_string(), Some("dropped"));
            return Err(e);
        }
        Ok(Some(message))
    }
}
