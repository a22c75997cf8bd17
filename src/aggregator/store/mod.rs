pub mod memory;
pub mod redis_store;

pub use memory::MemoryBufferStore;
pub use redis_store::RedisBufferStore;

use crate::bus::{ConversationKey, Fragment};
use crate::errors::CoalesceResult;
use async_trait::async_trait;
use std::time::Duration;

/// Window a fragment opens if its conversation has none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLease {
    /// Unix milliseconds; also the window's identity.
    pub deadline_ms: i64,
    /// Marker expiry, slightly longer than the window.
    pub ttl: Duration,
}

/// Result of an attempted append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Fragment stored; `len` is the buffer length including it. `opened`
    /// is set when this append also opened the conversation's window.
    Appended { len: usize, opened: bool },
    /// Buffer already held the maximum number of fragments. Nothing was written.
    Full { len: usize },
}

/// Shared, crash-surviving holding area for pending fragments.
///
/// Each conversation has an ordered fragment list, a "window open" marker
/// with an expiry, and an entry in a deadline schedule that any instance can
/// scan. The marker value and the schedule score are both the window's
/// deadline in unix milliseconds; that value identifies the window.
#[async_trait]
pub trait BufferStore: Send + Sync {
    /// Append to the tail of the conversation's list unless it already holds
    /// `max` entries, and open `window` if no marker is set. Both happen in
    /// one step: an error means nothing was written.
    async fn append(
        &self,
        key: &ConversationKey,
        fragment: &Fragment,
        max: usize,
        window: WindowLease,
    ) -> CoalesceResult<AppendOutcome>;

    /// Set the marker if absent (atomic check-and-set) and schedule the
    /// window's deadline. Returns whether this call opened the window.
    async fn mark_active(
        &self,
        key: &ConversationKey,
        ttl: Duration,
        deadline_ms: i64,
    ) -> CoalesceResult<bool>;

    /// Read every pending fragment and delete the list, the marker, and the
    /// schedule entry in one step. A second call returns an empty list.
    async fn drain(&self, key: &ConversationKey) -> CoalesceResult<Vec<Fragment>>;

    /// [`BufferStore::drain`], but only if the schedule entry still carries
    /// `deadline_ms`. Returns `None` when the window was already claimed or
    /// replaced. At most one caller wins a given window, and a failed call
    /// leaves the window scheduled for the next attempt.
    async fn claim_and_drain(
        &self,
        key: &ConversationKey,
        deadline_ms: i64,
    ) -> CoalesceResult<Option<Vec<Fragment>>>;

    /// Scheduled windows whose deadline is at or before `cutoff_ms`, oldest first.
    async fn due_windows(
        &self,
        cutoff_ms: i64,
        limit: usize,
    ) -> CoalesceResult<Vec<(ConversationKey, i64)>>;

    async fn pending_len(&self, key: &ConversationKey) -> CoalesceResult<usize>;

    async fn ping(&self) -> CoalesceResult<()>;

    fn backend_name(&self) -> &'static str;
}
