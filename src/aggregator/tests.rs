use super::*;
use crate::aggregator::testing::{FlakyStore, RecordingNotifier, ScriptedDelivery, UnavailableStore};
use crate::bus::{ChannelType, FragmentKind};
use chrono::{Duration as ChronoDuration, Utc};

fn key() -> ConversationKey {
    ConversationKey::new(ChannelType::Web, "u1")
}

struct Harness {
    engine: AggregationEngine,
    store: Arc<FlakyStore>,
    delivery: Arc<ScriptedDelivery>,
    outcomes: tokio::sync::broadcast::Receiver<DeliveryOutcome>,
}

fn harness_with(config: AggregationConfig) -> Harness {
    let store = Arc::new(FlakyStore::default());
    let delivery = Arc::new(ScriptedDelivery::new());
    let notifier = Arc::new(RecordingNotifier::default());
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
        dispatcher,
        notifier,
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
    Harness {
        engine,
        store,
        delivery,
        outcomes,
    }
}

fn harness() -> Harness {
    harness_with(AggregationConfig::default())
}

fn fragment_at(text: &str, offset_ms: i64) -> Fragment {
    Fragment::new(
        text,
        FragmentKind::Text,
        Utc::now() + ChronoDuration::milliseconds(offset_ms),
    )
}

#[tokio::test(start_paused = true)]
async fn test_first_fragment_opens_window_and_timer() {
    let h = harness();
    h.engine.add_fragment(&key(), Fragment::text("hi")).await.unwrap();

    assert!(h.store.is_marked(&key()));
    assert!(h.engine.timers().is_armed(&key()).await);
    assert_eq!(h.engine.timers().active_count().await, 1);

    h.engine.add_fragment(&key(), Fragment::text("again")).await.unwrap();
    assert_eq!(h.engine.timers().active_count().await, 1);
    assert_eq!(h.store.pending_len(&key()).await.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_window_flushes_once_after_duration() {
    let mut h = harness();
    h.engine
        .add_fragment(&key(), fragment_at("hello", 0))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    h.engine
        .add_fragment(&key(), fragment_at("world", 2000))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(17)).await;
    assert!(h.delivery.payloads().is_empty(), "flushed before the window elapsed");

    let outcome = h.outcomes.recv().await.unwrap();
    assert_eq!(outcome.text, "hello world");
    assert_eq!(outcome.fragment_count, 2);
    assert_eq!(h.delivery.payloads().len(), 1);
    assert!(!h.engine.timers().is_armed(&key()).await);
    assert!(!h.store.is_marked(&key()));
}

#[tokio::test(start_paused = true)]
async fn test_buffer_full_forces_flush_and_keeps_overflow() {
    let config = AggregationConfig {
        max_buffer_size: 3,
        ..AggregationConfig::default()
    };
    let mut h = harness_with(config);
    for i in 0..4 {
        h.engine
            .add_fragment(&key(), fragment_at(&format!("m{}", i), i))
            .await
            .unwrap();
    }

    let forced = h.outcomes.recv().await.unwrap();
    assert_eq!(forced.text, "m0 m1 m2");

    // Overflow fragment opened the next window with its own timer.
    assert_eq!(h.store.pending_len(&key()).await.unwrap(), 1);
    assert!(h.engine.timers().is_armed(&key()).await);
    assert_eq!(h.engine.stats().snapshot().forced_flushes, 1);

    let next = h.outcomes.recv().await.unwrap();
    assert_eq!(next.text, "m3");
    assert_eq!(h.delivery.payloads().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_flush_now_bypasses_window() {
    let h = harness();
    h.engine.add_fragment(&key(), Fragment::text("now")).await.unwrap();

    let message = h.engine.flush_now(&key()).await.unwrap().unwrap();
    assert_eq!(message.text, "now");
    assert!(!h.engine.timers().is_armed(&key()).await);
    assert!(h.engine.flush_now(&key()).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_leaves_fragments_buffered() {
    let h = harness();
    h.engine.add_fragment(&key(), Fragment::text("keep")).await.unwrap();
    h.engine.shutdown().await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(h.delivery.payloads().is_empty());
    assert_eq!(h.store.pending_len(&key()).await.unwrap(), 1);
    // The window stays scheduled for a recovery sweep.
    assert_eq!(h.store.due_windows(i64::MAX, 10).await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_append_can_be_retried_without_duplicate() {
    let mut h = harness();
    h.store.fail_next_append();

    let err = h
        .engine
        .add_fragment(&key(), Fragment::text("hello"))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(h.store.pending_len(&key()).await.unwrap(), 0);
    assert!(!h.store.is_marked(&key()));
    assert!(!h.engine.timers().is_armed(&key()).await);

    // The inbound caller retries the same fragment.
    h.engine
        .add_fragment(&key(), Fragment::text("hello"))
        .await
        .unwrap();
    let outcome = h.outcomes.recv().await.unwrap();
    assert_eq!(outcome.text, "hello");
    assert_eq!(h.delivery.payloads().len(), 1);
}

#[tokio::test]
async fn test_storage_errors_propagate_as_retryable() {
    let config = AggregationConfig::default();
    let stats = Arc::new(AggregatorStats::new());
    let store: Arc<dyn BufferStore> = Arc::new(UnavailableStore);
    let dispatcher = Arc::new(DeliveryDispatcher::spawn(
        Arc::new(ScriptedDelivery::new()),
        Arc::new(RecordingNotifier::default()),
        stats.clone(),
        RetryPolicy::default(),
        4,
        1,
    ));
    let pipeline = Arc::new(FlushPipeline::new(
        store.clone(),
        dispatcher,
        Arc::new(RecordingNotifier::default()),
        stats.clone(),
        CombineOptions::default(),
    ));
    let timers = Arc::new(TimerCoordinator::new());
    let engine = AggregationEngine::new(&config, store, timers.clone(), pipeline, stats.clone());

    let err = engine
        .add_fragment(&key(), Fragment::text("lost?"))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(timers.active_count().await, 0);
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.total_errors, 1);
    assert!(snapshot.last_error.unwrap().error.contains("connection refused"));
}
