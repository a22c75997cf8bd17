// Shared test helpers, not all items used by every test binary.
#![allow(unused)]

use async_trait::async_trait;
use chatcoalesce::aggregator::{
    AggregationEngine, AggregatorStats, BufferStore, CombineOptions, DeliveryDispatcher,
    DeliveryOutcome, FlushPipeline, MemoryBufferStore, RetryPolicy, TimerCoordinator,
};
use chatcoalesce::bus::{ChannelType, ConversationKey, Fragment, FragmentKind};
use chatcoalesce::config::AggregationConfig;
use chatcoalesce::delivery::{Delivery, DeliveryAck, DeliveryError, WebhookPayload};
use chatcoalesce::notify::{Notifier, NotifyKind};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Delivery double: replays scripted failures, then acknowledges.
#[derive(Default)]
pub struct MockDelivery {
    script: Mutex<VecDeque<DeliveryError>>,
    pub calls: Mutex<Vec<WebhookPayload>>,
}

impl MockDelivery {
    pub fn failing_then_ok(failures: Vec<DeliveryError>) -> Self {
        Self {
            script: Mutex::new(failures.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn payloads(&self) -> Vec<WebhookPayload> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Delivery for MockDelivery {
    async fn deliver(&self, payload: &WebhookPayload) -> Result<DeliveryAck, DeliveryError> {
        self.calls.lock().unwrap().push(payload.clone());
        match self.script.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(DeliveryAck {
                status: 200,
                reply: None,
            }),
        }
    }
}

#[derive(Default)]
pub struct MockNotifier {
    pub events: Mutex<Vec<(ConversationKey, String, NotifyKind)>>,
}

impl MockNotifier {
    pub fn kinds(&self) -> Vec<NotifyKind> {
        self.events.lock().unwrap().iter().map(|e| e.2).collect()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn notify(&self, key: &ConversationKey, text: &str, kind: NotifyKind) -> bool {
        self.events
            .lock()
            .unwrap()
            .push((key.clone(), text.to_string(), kind));
        true
    }
}

pub struct TestGateway {
    pub engine: AggregationEngine,
    pub store: Arc<MemoryBufferStore>,
    pub delivery: Arc<MockDelivery>,
    pub notifier: Arc<MockNotifier>,
    pub dispatcher: Arc<DeliveryDispatcher>,
    pub outcomes: broadcast::Receiver<DeliveryOutcome>,
}

/// Engine over an in-memory store with the given delivery double.
/// Must be called inside a tokio runtime.
pub fn test_gateway(config: AggregationConfig, delivery: MockDelivery) -> TestGateway {
    let store = Arc::new(MemoryBufferStore::new());
    let delivery = Arc::new(delivery);
    let notifier = Arc::new(MockNotifier::default());
    let stats = Arc::new(AggregatorStats::new());
    let dispatcher = Arc::new(DeliveryDispatcher::spawn(
        delivery.clone(),
        notifier.clone(),
        stats.clone(),
        RetryPolicy::default(),
        64,
        4,
    ));
    let outcomes = dispatcher.subscribe();
    let pipeline = Arc::new(FlushPipeline::new(
        store.clone(),
        dispatcher.clone(),
        notifier.clone(),
        stats.clone(),
        CombineOptions::from_config(&config),
    ));
    let engine = AggregationEngine::new(
        &config,
        store.clone(),
        Arc::new(TimerCoordinator::new()),
        pipeline,
        stats,
    );
    TestGateway {
        engine,
        store,
        delivery,
        notifier,
        dispatcher,
        outcomes,
    }
}

pub fn web_key(user: &str) -> ConversationKey {
    ConversationKey::new(ChannelType::Web, user)
}

pub fn text_at(text: &str, at: DateTime<Utc>) -> Fragment {
    Fragment::new(text, FragmentKind::Text, at)
}

pub fn text_after(text: &str, base: DateTime<Utc>, offset_ms: i64) -> Fragment {
    text_at(text, base + ChronoDuration::milliseconds(offset_ms))
}
