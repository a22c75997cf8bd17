use crate::bus::ConversationKey;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub error: String,
    pub channel: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessedRecord {
    pub timestamp: DateTime<Utc>,
    pub channel: String,
    pub user_id: String,
    pub message_count: usize,
    pub processing_time_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_fragments: u64,
    pub total_flushes: u64,
    pub forced_flushes: u64,
    pub total_delivered: u64,
    pub total_errors: u64,
    pub total_retries: u64,
    pub last_error: Option<ErrorRecord>,
    pub last_processed: Option<ProcessedRecord>,
}

/// Process-wide aggregation counters, exposed at `/api/stats`.
///
/// Every counter is mirrored to the `metrics` facade so a Prometheus
/// recorder (when installed) sees the same numbers.
#[derive(Default)]
pub struct AggregatorStats {
    fragments: AtomicU64,
    flushes: AtomicU64,
    forced_flushes: AtomicU64,
    delivered: AtomicU64,
    errors: AtomicU64,
    retries: AtomicU64,
    last_error: Mutex<Option<ErrorRecord>>,
    last_processed: Mutex<Option<ProcessedRecord>>,
}

impl AggregatorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_fragment(&self, key: &ConversationKey) {
        self.fragments.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("chatcoalesce_fragments_total", "channel" => key.channel.as_str())
            .increment(1);
    }

    pub fn record_flush(&self, forced: bool) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("chatcoalesce_flushes_total").increment(1);
        if forced {
            self.forced_flushes.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("chatcoalesce_forced_flushes_total").increment(1);
        }
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("chatcoalesce_delivery_retries_total").increment(1);
    }

    pub fn record_delivered(
        &self,
        key: &ConversationKey,
        message_count: usize,
        processing_time_ms: u64,
    ) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("chatcoalesce_deliveries_total", "outcome" => "delivered").increment(1);
        *self
            .last_processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(ProcessedRecord {
            timestamp: Utc::now(),
            channel: key.channel.to_string(),
            user_id: key.user_id.clone(),
            message_count,
            processing_time_ms,
        });
    }

    /// Count a failure against `key`. `outcome` labels delivery failures in
    /// metrics; storage failures pass `None`.
    pub fn record_error(&self, key: &ConversationKey, error: &str, outcome: Option<&'static str>) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        if let Some(outcome) = outcome {
            metrics::counter!("chatcoalesce_deliveries_total", "outcome" => outcome).increment(1);
        }
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(ErrorRecord {
            timestamp: Utc::now(),
            error: error.to_string(),
            channel: key.channel.to_string(),
            user_id: key.user_id.clone(),
        });
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_fragments: self.fragments.load(Ordering::Relaxed),
            total_flushes: self.flushes.load(Ordering::Relaxed),
            forced_flushes: self.forced_flushes.load(Ordering::Relaxed),
            total_delivered: self.delivered.load(Ordering::Relaxed),
            total_errors: self.errors.load(Ordering::Relaxed),
            total_retries: self.retries.load(Ordering::Relaxed),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            last_processed: self
                .last_processed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}
