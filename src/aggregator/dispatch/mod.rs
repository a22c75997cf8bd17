//! Background delivery queue.
//!
//! Combined messages are handed off through a bounded channel to a
//! supervisor task, which runs each delivery (with its retry loop) in a
//! `JoinSet` bounded by a semaphore. Every finished job publishes a
//! [`DeliveryOutcome`] so callers and tests can observe completion.

use crate::aggregator::stats::AggregatorStats;
use crate::bus::{CombinedMessage, ConversationKey};
use crate::config::DeliveryConfig;
use crate::delivery::{Delivery, WebhookPayload};
use crate::errors::{CoalesceError, CoalesceResult};
use crate::notify::{NotifyKind, Notifier};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(10);
const OUTCOME_CHANNEL_CAPACITY: usize = 256;

pub const FAILURE_NOTICE: &str =
    "Sorry, we could not process your message. Please try again in a moment.";

/// Configuration for the delivery retry loop
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 10000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay_ms: config.initial_delay_ms,
            max_delay_ms: config.max_delay_ms,
            backoff_multiplier: config.backoff_multiplier,
        }
    }

    /// Delay before retry number `retry` (0-based): exponential, capped at
    /// `max_delay_ms`, plus up to 25% jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = (self.initial_delay_ms as f64 * self.backoff_multiplier.powi(retry as i32))
            .min(self.max_delay_ms as f64) as u64;
        let jitter = (base as f64 * 0.25 * fastrand::f64()) as u64;
        Duration::from_millis(base + jitter)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered { reply: Option<String> },
    Failed { error: String, retryable: bool },
}

/// Completion record for one combined message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub key: ConversationKey,
    pub text: String,
    pub fragment_count: usize,
    pub attempts: u32,
    pub status: DeliveryStatus,
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self.status, DeliveryStatus::Delivered { .. })
    }
}

struct DeliveryJob {
    message: CombinedMessage,
    enqueued_at: Instant,
}

struct Worker {
    delivery: Arc<dyn Delivery>,
    notifier: Arc<dyn Notifier>,
    stats: Arc<AggregatorStats>,
    policy: RetryPolicy,
    outcomes: broadcast::Sender<DeliveryOutcome>,
}

impl Worker {
    async fn run(&self, job: DeliveryJob) {
        let DeliveryJob {
            message,
            enqueued_at,
        } = job;
        let key = message.key.clone();
        let mut payload = WebhookPayload::from_message(&message);
        let mut attempts = 0;

        let status = loop {
            attempts += 1;
            payload.retry = attempts > 1;
            debug!("delivering {} (attempt {})", key, attempts);

            match self.delivery.deliver(&payload).await {
                Ok(ack) => {
                    let elapsed =
                        u64::try_from(enqueued_at.elapsed().as_millis()).unwrap_or(u64::MAX);
                    self.stats
                        .record_delivered(&key, message.fragment_count, elapsed);
                    info!(
                        "delivered {} fragments for {} after {} attempt(s)",
                        message.fragment_count, key, attempts
                    );
                    let reply = ack.reply.as_deref().unwrap_or("delivered");
                    self.notifier.notify(&key, reply, NotifyKind::Message).await;
                    break DeliveryStatus::Delivered { reply: ack.reply };
                }
                Err(e) => {
                    let retryable = e.is_retryable();
                    if !retryable || attempts >= self.policy.max_attempts {
                        // Full text goes to the log: it is never requeued.
                        error!(
                            "delivery for {} failed after {} attempt(s): {}; text: {:?}",
                            key, attempts, e, message.text
                        );
                        let outcome = if retryable { "exhausted" } else { "rejected" };
                        self.stats.record_error(&key, &e.to_string(), Some(outcome));
                        self.notifier
                            .notify(&key, FAILURE_NOTICE, NotifyKind::Error)
                            .await;
                        break DeliveryStatus::Failed {
                            error: e.to_string(),
                            retryable,
                        };
                    }
                    let delay = self.policy.delay_for(attempts - 1);
                    warn!(
                        "delivery attempt {}/{} for {} failed: {}; retrying in {}ms",
                        attempts,
                        self.policy.max_attempts,
                        key,
                        e,
                        delay.as_millis()
                    );
                    self.stats.record_retry();
                    tokio::time::sleep(delay).await;
                }
            }
        };

        // No subscribers is fine.
        let _ = self.outcomes.send(DeliveryOutcome {
            key,
            text: message.text,
            fragment_count: message.fragment_count,
            attempts,
            status,
        });
    }
}

pub struct DeliveryDispatcher {
    tx: Mutex<Option<mpsc::Sender<DeliveryJob>>>,
    outcomes: broadcast::Sender<DeliveryOutcome>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryDispatcher {
    /// Start the supervisor task. Must be called inside a tokio runtime.
    pub fn spawn(
        delivery: Arc<dyn Delivery>,
        notifier: Arc<dyn Notifier>,
        stats: Arc<AggregatorStats>,
        policy: RetryPolicy,
        queue_capacity: usize,
        max_concurrent: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        let worker = Arc::new(Worker {
            delivery,
            notifier,
            stats,
            policy,
            outcomes: outcomes.clone(),
        });
        let supervisor = tokio::spawn(supervise(rx, worker, max_concurrent.max(1)));
        Self {
            tx: Mutex::new(Some(tx)),
            outcomes,
            supervisor: Mutex::new(Some(supervisor)),
        }
    }

    pub fn from_config(
        config: &DeliveryConfig,
        delivery: Arc<dyn Delivery>,
        notifier: Arc<dyn Notifier>,
        stats: Arc<AggregatorStats>,
    ) -> Self {
        Self::spawn(
            delivery,
            notifier,
            stats,
            RetryPolicy::from_config(config),
            config.queue_capacity,
            config.max_concurrent,
        )
    }

    fn sender(&self) -> Option<mpsc::Sender<DeliveryJob>> {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Queue `message` for delivery. Returns once it is accepted by the queue,
    /// never waiting on the downstream call.
    pub async fn dispatch(&self, message: CombinedMessage) -> CoalesceResult<()> {
        let Some(tx) = self.sender() else {
            return Err(stopped(&message));
        };
        enqueue(&tx, DeliveryJob::new(message)).await
    }

    /// Like [`DeliveryDispatcher::dispatch`] but never waits for queue space.
    /// When the queue is full, the bounded wait continues on a background
    /// task and this returns immediately.
    pub fn dispatch_nowait(&self, message: CombinedMessage) -> CoalesceResult<()> {
        let Some(tx) = self.sender() else {
            return Err(stopped(&message));
        };
        match tx.try_send(DeliveryJob::new(message)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!(
                    "delivery queue full, deferring combined message for {}",
                    job.message.key
                );
                tokio::spawn(async move {
                    // enqueue logs the text if it still cannot be queued.
                    let _ = enqueue(&tx, job).await;
                });
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(job)) => Err(closed(&job)),
        }
    }

    /// Receive every future [`DeliveryOutcome`].
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryOutcome> {
        self.outcomes.subscribe()
    }

    /// Close the queue and wait up to `timeout` for queued and in-flight jobs.
    pub async fn shutdown(&self, timeout: Duration) {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };
        let abort = handle.abort_handle();
        if tokio::time::timeout(timeout, handle).await.is_err() {
            warn!(
                "delivery dispatcher did not drain within {}s, abandoning in-flight jobs",
                timeout.as_secs()
            );
            abort.abort();
        } else {
            info!("delivery dispatcher drained");
        }
    }
}

impl DeliveryJob {
    fn new(message: CombinedMessage) -> Self {
        Self {
            message,
            enqueued_at: Instant::now(),
        }
    }
}

fn stopped(message: &CombinedMessage) -> CoalesceError {
    error!(
        "dispatcher stopped, dropping combined message for {}: {:?}",
        message.key, message.text
    );
    CoalesceError::Delivery {
        message: "delivery dispatcher is shut down".into(),
        retryable: false,
    }
}

fn closed(job: &DeliveryJob) -> CoalesceError {
    error!(
        "delivery queue closed, dropping combined message for {}: {:?}",
        job.message.key, job.message.text
    );
    CoalesceError::Delivery {
        message: "delivery queue closed".into(),
        retryable: false,
    }
}

async fn enqueue(tx: &mpsc::Sender<DeliveryJob>, job: DeliveryJob) -> CoalesceResult<()> {
    match tx.send_timeout(job, ENQUEUE_TIMEOUT).await {
        Ok(()) => Ok(()),
        Err(mpsc::error::SendTimeoutError::Timeout(job)) => {
            error!(
                "delivery queue full, dropping combined message for {}: {:?}",
                job.message.key, job.message.text
            );
            Err(CoalesceError::Delivery {
                message: "delivery queue full".into(),
                retryable: true,
            })
        }
        Err(mpsc::error::SendTimeoutError::Closed(job)) => Err(closed(&job)),
    }
}

async fn supervise(
    mut rx: mpsc::Receiver<DeliveryJob>,
    worker: Arc<Worker>,
    max_concurrent: usize,
) {
    let semaphore = Arc::new(Semaphore::new(max_concurrent));
    let mut jobs = JoinSet::new();

    loop {
        tokio::select! {
            next = rx.recv() => {
                let Some(job) = next else { break };
                let Ok(permit) = semaphore.clone().acquire_owned().await else { break };
                let worker = worker.clone();
                jobs.spawn(async move {
                    let _permit = permit;
                    worker.run(job).await;
                });
            }
            Some(result) = jobs.join_next(), if !jobs.is_empty() => {
                if let Err(e) = result {
                    error!("delivery task failed: {}", e);
                }
            }
        }
    }

    while let Some(result) = jobs.join_next().await {
        if let Err(e) = result {
            error!("delivery task failed: {}", e);
        }
    }
    debug!("delivery supervisor exited");
}
