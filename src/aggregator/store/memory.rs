use super::{AppendOutcome, BufferStore, WindowLease};
use crate::bus::{ConversationKey, Fragment};
use crate::errors::CoalesceResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Marker {
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    buffers: HashMap<ConversationKey, Vec<Fragment>>,
    markers: HashMap<ConversationKey, Marker>,
    schedule: HashMap<ConversationKey, i64>,
}

impl Inner {
    /// Set the marker if absent or expired and schedule its deadline.
    fn open_window(&mut self, key: &ConversationKey, ttl: Duration, deadline_ms: i64) -> bool {
        let now = Instant::now();
        if self.markers.get(key).is_some_and(|m| m.expires_at > now) {
            return false;
        }
        self.markers.insert(
            key.clone(),
            Marker {
                expires_at: now + ttl,
            },
        );
        self.schedule.insert(key.clone(), deadline_ms);
        true
    }

    fn take(&mut self, key: &ConversationKey) -> Vec<Fragment> {
        self.markers.remove(key);
        self.schedule.remove(key);
        self.buffers.remove(key).unwrap_or_default()
    }
}

/// Process-local store with the same semantics as the Redis backend.
///
/// Suitable for tests and single-instance deployments; contents do not
/// survive a restart.
#[derive(Default)]
pub struct MemoryBufferStore {
    inner: Mutex<Inner>,
}

impl MemoryBufferStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a live (unexpired) marker exists for `key`.
    pub fn is_marked(&self, key: &ConversationKey) -> bool {
        self.lock()
            .markers
            .get(key)
            .is_some_and(|m| m.expires_at > Instant::now())
    }
}

#[async_trait]
impl BufferStore for MemoryBufferStore {
    async fn append(
        &self,
        key: &ConversationKey,
        fragment: &Fragment,
        max: usize,
        window: WindowLease,
    ) -> CoalesceResult<AppendOutcome> {
        let mut inner = self.lock();
        let buffer = inner.buffers.entry(key.clone()).or_default();
        if buffer.len() >= max {
            return Ok(AppendOutcome::Full { len: buffer.len() });
        }
        buffer.push(fragment.clone());
        let len = buffer.len();
        let opened = inner.open_window(key, window.ttl, window.deadline_ms);
        Ok(AppendOutcome::Appended { len, opened })
    }

    async fn mark_active(
        &self,
        key: &ConversationKey,
        ttl: Duration,
        deadline_ms: i64,
    ) -> CoalesceResult<bool> {
        Ok(self.lock().open_window(key, ttl, deadline_ms))
    }

    async fn drain(&self, key: &ConversationKey) -> CoalesceResult<Vec<Fragment>> {
        Ok(self.lock().take(key))
    }

    async fn claim_and_drain(
        &self,
        key: &ConversationKey,
        deadline_ms: i64,
    ) -> CoalesceResult<Option<Vec<Fragment>>> {
        let mut inner = self.lock();
        if inner.schedule.get(key) != Some(&deadline_ms) {
            return Ok(None);
        }
        Ok(Some(inner.take(key)))
    }

    async fn due_windows(
        &self,
        cutoff_ms: i64,
        limit: usize,
    ) -> CoalesceResult<Vec<(ConversationKey, i64)>> {
        let inner = self.lock();
        let mut due: Vec<(ConversationKey, i64)> = inner
            .schedule
            .iter()
            .filter(|(_, deadline)| **deadline <= cutoff_ms)
            .map(|(key, deadline)| (key.clone(), *deadline))
            .collect();
        due.sort_by_key(|(_, deadline)| *deadline);
        due.truncate(limit);
        Ok(due)
    }

    async fn pending_len(&self, key: &ConversationKey) -> CoalesceResult<usize> {
        Ok(self.lock().buffers.get(key).map_or(0, Vec::len))
    }

    async fn ping(&self) -> CoalesceResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

impl std::fmt::Debug for MemoryBufferStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("MemoryBufferStore")
            .field("buffers", &inner.buffers.len())
            .field("markers", &inner.markers.len())
            .field("scheduled", &inner.schedule.len())
            .finish()
    }
}
