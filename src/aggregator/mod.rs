//! Message aggregation and debounce.
//!
//! Fragments for one conversation are buffered in a [`store::BufferStore`]
//! until the window that the first fragment opened elapses, then drained,
//! combined in timestamp order, and handed to the delivery queue exactly
//! once. Subsequent fragments join the open window and never extend it.

pub mod dispatch;
pub mod flush;
pub mod stats;
pub mod store;
pub mod sweep;
pub mod timer;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatch::{DeliveryDispatcher, DeliveryOutcome, DeliveryStatus, RetryPolicy};
pub use flush::{CombineOptions, FlushPipeline, FlushTrigger, combine_fragments};
pub use stats::{AggregatorStats, StatsSnapshot};
pub use store::{AppendOutcome, BufferStore, MemoryBufferStore, RedisBufferStore, WindowLease};
pub use sweep::{RecoverySweeper, SweepReport};
pub use timer::TimerCoordinator;

use crate::bus::{CombinedMessage, ConversationKey, Fragment};
use crate::config::AggregationConfig;
use crate::errors::{CoalesceError, CoalesceResult};
use crate::utils::now_ms;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct AggregationEngine {
    store: Arc<dyn BufferStore>,
    timers: Arc<TimerCoordinator>,
    pipeline: Arc<FlushPipeline>,
    stats: Arc<AggregatorStats>,
    window: Duration,
    marker_ttl: Duration,
    max_buffer_size: usize,
}

impl AggregationEngine {
    pub fn new(
        config: &AggregationConfig,
        store: Arc<dyn BufferStore>,
        timers: Arc<TimerCoordinator>,
        pipeline: Arc<FlushPipeline>,
        stats: Arc<AggregatorStats>,
    ) -> Self {
        Self {
            store,
            timers,
            pipeline,
            stats,
            window: config.window(),
            marker_ttl: config.marker_ttl(),
            max_buffer_size: config.max_buffer_size.max(1),
        }
    }

    /// Buffer `fragment` and open a window if the conversation is idle.
    ///
    /// Returns once the fragment is stored; never waits on the flush.
    /// Storage errors propagate so the inbound request can be failed and retried.
    pub async fn add_fragment(
        &self,
        key: &ConversationKey,
        fragment: Fragment,
    ) -> CoalesceResult<()> {
        self.stats.record_fragment(key);
        let result = self.buffer(key, &fragment).await;
        if let Err(e) = &result {
            error!("failed to buffer fragment for {}: {}", key, e);
            self.stats.record_error(key, &e.to_string(), None);
        }
        result
    }

    /// Window a fragment arriving now would open.
    fn lease(&self) -> WindowLease {
        let window_ms = i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX);
        WindowLease {
            deadline_ms: now_ms().saturating_add(window_ms),
            ttl: self.marker_ttl,
        }
    }

    async fn buffer(&self, key: &ConversationKey, fragment: &Fragment) -> CoalesceResult<()> {
        let lease = self.lease();
        let (len, opened, lease) = match self
            .store
            .append(key, fragment, self.max_buffer_size, lease)
            .await?
        {
            AppendOutcome::Full { len } => {
                warn!("buffer full for {} ({} fragments), flushing now", key, len);
                self.force_flush(key).await?;
                let lease = self.lease();
                match self
                    .store
                    .append(key, fragment, self.max_buffer_size, lease)
                    .await?
                {
                    AppendOutcome::Full { len } => {
                        return Err(CoalesceError::storage(format!(
                            "buffer for {} still full ({} fragments) after forced flush",
                            key, len
                        )));
                    }
                    AppendOutcome::Appended { len, opened } => (len, opened, lease),
                }
            }
            AppendOutcome::Appended { len, opened } => (len, opened, lease),
        };

        debug!(
            "buffered fragment for {} ({}/{})",
            key, len, self.max_buffer_size
        );
        if opened {
            self.arm_timer(key, lease.deadline_ms).await;
        } else {
            debug!("window already open for {}", key);
        }
        Ok(())
    }

    /// Flush the current window ahead of its deadline. The superseded timer
    /// is disarmed first so it cannot fire against the next window.
    async fn force_flush(&self, key: &ConversationKey) -> CoalesceResult<()> {
        self.timers.disarm(key).await;
        match self.pipeline.flush(key, FlushTrigger::BufferFull).await {
            Ok(_) => Ok(()),
            Err(e @ CoalesceError::Storage { .. }) => Err(e),
            // The drained text was logged by the dispatcher; keep accepting fragments.
            Err(e) => {
                error!("forced flush for {} could not be dispatched: {}", key, e);
                Ok(())
            }
        }
    }

    /// Schedule the local flush for a window this instance just opened. The
    /// window is already in the shared schedule, so if no timer can be armed
    /// the recovery sweep still flushes it.
    async fn arm_timer(&self, key: &ConversationKey, deadline_ms: i64) {
        let pipeline = self.pipeline.clone();
        let stats = self.stats.clone();
        let task_key = key.clone();
        let armed = self
            .timers
            .arm(key.clone(), self.window, async move {
                if let Err(e) = pipeline
                    .flush(&task_key, FlushTrigger::Timer { deadline_ms })
                    .await
                {
                    error!("timer flush for {} failed: {}", task_key, e);
                    stats.record_error(&task_key, &e.to_string(), None);
                }
            })
            .await;
        if armed {
            info!(
                "window opened for {}, flushing in {}s",
                key,
                self.window.as_secs()
            );
        } else {
            warn!(
                "window opened for {} but a local timer is still pending; recovery sweep will flush it",
                key
            );
        }
    }

    /// Flush `key` immediately regardless of its window.
    pub async fn flush_now(&self, key: &ConversationKey) -> CoalesceResult<Option<CombinedMessage>> {
        self.timers.disarm(key).await;
        self.pipeline.flush(key, FlushTrigger::Manual).await
    }

    pub fn stats(&self) -> &Arc<AggregatorStats> {
        &self.stats
    }

    pub fn timers(&self) -> &Arc<TimerCoordinator> {
        &self.timers
    }

    pub fn store(&self) -> &Arc<dyn BufferStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<DeliveryDispatcher> {
        self.pipeline.dispatcher()
    }

    /// Cancel pending timers. Buffered fragments stay in the store for the
    /// recovery sweep (this or another instance) to flush.
    pub async fn shutdown(&self) {
        self.timers.cancel_all().await;
    }
}

#[cfg(test)]
mod tests;
