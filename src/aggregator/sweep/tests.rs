use super::*;
use crate::aggregator::dispatch::{DeliveryDispatcher, RetryPolicy};
use crate::aggregator::flush::CombineOptions;
use crate::aggregator::stats::AggregatorStats;
use crate::aggregator::store::WindowLease;
use crate::aggregator::testing::{FlakyStore, RecordingNotifier, ScriptedDelivery};
use crate::bus::{ChannelType, ConversationKey, Fragment};

const TTL: Duration = Duration::from_secs(25);

fn key(user: &str) -> ConversationKey {
    ConversationKey::new(ChannelType::WhatsApp, user)
}

struct Harness {
    store: Arc<FlakyStore>,
    timers: Arc<TimerCoordinator>,
    delivery: Arc<ScriptedDelivery>,
    pipeline: Arc<FlushPipeline>,
    sweeper: Arc<RecoverySweeper>,
    dispatcher: Arc<DeliveryDispatcher>,
}

fn harness() -> Harness {
    let store = Arc::new(FlakyStore::default());
    let delivery = Arc::new(ScriptedDelivery::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let stats = Arc::new(AggregatorStats::new());
    let dispatcher = Arc::new(DeliveryDispatcher::spawn(
        delivery.clone(),
        notifier.clone(),
        stats.clone(),
        RetryPolicy::default(),
        16,
        2,
    ));
    let pipeline = Arc::new(FlushPipeline::new(
        store.clone(),
        dispatcher.clone(),
        notifier,
        stats,
        CombineOptions::default(),
    ));
    let timers = Arc::new(TimerCoordinator::new());
    let config = SweepConfig {
        grace_secs: 10,
        ..SweepConfig::default()
    };
    let sweeper = Arc::new(RecoverySweeper::new(
        &config,
        store.clone(),
        pipeline.clone(),
        timers.clone(),
    ));
    Harness {
        store,
        timers,
        delivery,
        pipeline,
        sweeper,
        dispatcher,
    }
}

async fn open_window(store: &FlakyStore, key: &ConversationKey, text: &str, deadline: i64) {
    let lease = WindowLease {
        deadline_ms: deadline,
        ttl: TTL,
    };
    store
        .append(key, &Fragment::text(text), 100, lease)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_sweep_flushes_only_windows_past_grace() {
    let h = harness();
    open_window(&h.store, &key("old"), "orphaned", 1_000).await;
    open_window(&h.store, &key("fresh"), "pending", 95_000).await;

    let report = h.sweeper.sweep_once(100_000).await.unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.flushed, 1);
    assert_eq!(h.store.pending_len(&key("old")).await.unwrap(), 0);
    assert_eq!(h.store.pending_len(&key("fresh")).await.unwrap(), 1);

    h.dispatcher.shutdown(Duration::from_secs(5)).await;
    assert_eq!(h.delivery.payloads().len(), 1);
    assert_eq!(h.delivery.payloads()[0].text, "orphaned");
}

#[tokio::test]
async fn test_sweep_skips_locally_armed_windows() {
    let h = harness();
    open_window(&h.store, &key("mine"), "still waiting", 1_000).await;
    h.timers
        .arm(key("mine"), Duration::from_secs(60), async {})
        .await;

    let report = h.sweeper.sweep_once(100_000).await.unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.flushed, 0);
    assert_eq!(h.store.pending_len(&key("mine")).await.unwrap(), 1);
    h.timers.cancel_all().await;
}

#[tokio::test]
async fn test_repeated_sweeps_flush_once() {
    let h = harness();
    open_window(&h.store, &key("u"), "once", 1_000).await;

    assert_eq!(h.sweeper.sweep_once(100_000).await.unwrap().flushed, 1);
    let second = h.sweeper.sweep_once(100_000).await.unwrap();
    assert_eq!(second.scanned, 0);
    assert_eq!(second.flushed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_start_and_stop_loop() {
    let h = harness();
    open_window(&h.store, &key("u"), "late", 1_000).await;

    h.sweeper.start();
    // First tick fires immediately.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.store.pending_len(&key("u")).await.unwrap(), 0);

    h.sweeper.stop().await;
}

#[tokio::test]
async fn test_sweep_recovers_window_after_failed_timer_flush() {
    let h = harness();
    open_window(&h.store, &key("u"), "not lost", 1_000).await;
    h.store.fail_next_drain();

    assert!(
        h.pipeline
            .flush(&key("u"), FlushTrigger::Timer { deadline_ms: 1_000 })
            .await
            .is_err()
    );

    let report = h.sweeper.sweep_once(100_000).await.unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.flushed, 1);
    assert_eq!(h.store.pending_len(&key("u")).await.unwrap(), 0);

    h.dispatcher.shutdown(Duration::from_secs(5)).await;
    let payloads = h.delivery.payloads();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].text, "not lost");
}
