//! Scripted collaborators shared by the aggregator unit tests.

use crate::aggregator::store::{AppendOutcome, BufferStore, MemoryBufferStore, WindowLease};
use crate::bus::{ConversationKey, Fragment};
use crate::errors::{CoalesceError, CoalesceResult};
use crate::delivery::{Delivery, DeliveryAck, DeliveryError, WebhookPayload};
use crate::notify::{NotifyKind, Notifier};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Returns queued results in order, then succeeds. Records every payload.
#[derive(Default)]
pub struct ScriptedDelivery {
    script: Mutex<VecDeque<Result<DeliveryAck, DeliveryError>>>,
    pub calls: Mutex<Vec<WebhookPayload>>,
}

impl ScriptedDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_then_ok(failures: Vec<DeliveryError>) -> Self {
        let delivery = Self::default();
        delivery
            .script
            .lock()
            .unwrap()
            .extend(failures.into_iter().map(Err));
        delivery
    }

    pub fn payloads(&self) -> Vec<WebhookPayload> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Delivery for ScriptedDelivery {
    async fn deliver(&self, payload: &WebhookPayload) -> Result<DeliveryAck, DeliveryError> {
        self.calls.lock().unwrap().push(payload.clone());
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(DeliveryAck {
            status: 200,
            reply: None,
        }))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub events: Mutex<Vec<(ConversationKey, String, NotifyKind)>>,
}

impl RecordingNotifier {
    pub fn kinds(&self) -> Vec<NotifyKind> {
        self.events.lock().unwrap().iter().map(|e| e.2).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, key: &ConversationKey, text: &str, kind: NotifyKind) -> bool {
        self.events
            .lock()
            .unwrap()
            .push((key.clone(), text.to_string(), kind));
        true
    }
}

/// Store whose every call fails like a lost connection.
pub struct UnavailableStore;

#[async_trait]
impl BufferStore for UnavailableStore {
    async fn append(
        &self,
        _key: &ConversationKey,
        _fragment: &Fragment,
        _max: usize,
        _window: WindowLease,
    ) -> CoalesceResult<AppendOutcome> {
        Err(CoalesceError::storage("connection refused"))
    }

    async fn mark_active(
        &self,
        _key: &ConversationKey,
        _ttl: Duration,
        _deadline_ms: i64,
    ) -> CoalesceResult<bool> {
        Err(CoalesceError::storage("connection refused"))
    }

    async fn drain(&self, _key: &ConversationKey) -> CoalesceResult<Vec<Fragment>> {
        Err(CoalesceError::storage("connection refused"))
    }

    async fn claim_and_drain(
        &self,
        _key: &ConversationKey,
        _deadline_ms: i64,
    ) -> CoalesceResult<Option<Vec<Fragment>>> {
        Err(CoalesceError::storage("connection refused"))
    }

    async fn due_windows(
        &self,
        _cutoff_ms: i64,
        _limit: usize,
    ) -> CoalesceResult<Vec<(ConversationKey, i64)>> {
        Err(CoalesceError::storage("connection refused"))
    }

    async fn pending_len(&self, _key: &ConversationKey) -> CoalesceResult<usize> {
        Err(CoalesceError::storage("connection refused"))
    }

    async fn ping(&self) -> CoalesceResult<()> {
        Err(CoalesceError::storage("connection refused"))
    }

    fn backend_name(&self) -> &'static str {
        "unavailable"
    }
}

/// In-memory store whose next append or drain can be made to fail once,
/// before any state changes, like a dropped connection.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryBufferStore,
    fail_append: AtomicBool,
    fail_drain: AtomicBool,
}

impl FlakyStore {
    pub fn fail_next_append(&self) {
        self.fail_append.store(true, Ordering::SeqCst);
    }

    /// Applies to both `drain` and `claim_and_drain`.
    pub fn fail_next_drain(&self) {
        self.fail_drain.store(true, Ordering::SeqCst);
    }

    pub fn is_marked(&self, key: &ConversationKey) -> bool {
        self.inner.is_marked(key)
    }

    fn trip(flag: &AtomicBool) -> CoalesceResult<()> {
        if flag.swap(false, Ordering::SeqCst) {
            return Err(CoalesceError::storage("connection reset"));
        }
        Ok(())
    }
}

#[async_trait]
impl BufferStore for FlakyStore {
    async fn append(
        &self,
        key: &ConversationKey,
        fragment: &Fragment,
        max: usize,
        window: WindowLease,
    ) -> CoalesceResult<AppendOutcome> {
        Self::trip(&self.fail_append)?;
        self.inner.append(key, fragment, max, window).await
    }

    async fn mark_active(
        &self,
        key: &ConversationKey,
        ttl: Duration,
        deadline_ms: i64,
    ) -> CoalesceResult<bool> {
        self.inner.mark_active(key, ttl, deadline_ms).await
    }

    async fn drain(&self, key: &ConversationKey) -> CoalesceResult<Vec<Fragment>> {
        Self::trip(&self.fail_drain)?;
        self.inner.drain(key).await
    }

    async fn claim_and_drain(
        &self,
        key: &ConversationKey,
        deadline_ms: i64,
    ) -> CoalesceResult<Option<Vec<Fragment>>> {
        Self::trip(&self.fail_drain)?;
        self.inner.claim_and_drain(key, deadline_ms).await
    }

    async fn due_windows(
        &self,
        cutoff_ms: i64,
        limit: usize,
    ) -> CoalesceResult<Vec<(ConversationKey, i64)>> {
        self.inner.due_windows(cutoff_ms, limit).await
    }

    async fn pending_len(&self, key: &ConversationKey) -> CoalesceResult<usize> {
        self.inner.pending_len(key).await
    }

    async fn ping(&self) -> CoalesceResult<()> {
        self.inner.ping().await
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}
