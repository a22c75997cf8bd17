//! Per-conversation one-shot flush timers.
//!
//! A map of join handles keyed by conversation where each task removes its
//! own entry when it fires. Timers are a cache of scheduling intent; losing
//! them (crash) loses timeliness, never fragments.

use crate::bus::ConversationKey;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

struct ArmedTimer {
    id: u64,
    handle: JoinHandle<()>,
}

pub struct TimerCoordinator {
    timers: Arc<Mutex<HashMap<ConversationKey, ArmedTimer>>>,
    next_id: AtomicU64,
}

impl TimerCoordinator {
    pub fn new() -> Self {
        Self {
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Schedule `task` to run once after `delay`.
    ///
    /// No-op returning `false` if `key` already has a pending timer: the
    /// first timer is authoritative and is never extended or reset.
    pub async fn arm<F>(&self, key: ConversationKey, delay: Duration, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Held across spawn + insert so the task cannot look itself up before
        // its entry exists.
        let mut guard = self.timers.lock().await;
        if guard.contains_key(&key) {
            debug!("timer for {} already armed, keeping the original deadline", key);
            return false;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let timers = self.timers.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut guard = timers.lock().await;
                match guard.get(&task_key) {
                    Some(entry) if entry.id == id => {
                        guard.remove(&task_key);
                        record_active(guard.len());
                    }
                    // Disarmed between wake-up and lock.
                    _ => return,
                }
            }
            debug!("timer for {} fired", task_key);
            task.await;
        });
        guard.insert(key, ArmedTimer { id, handle });
        record_active(guard.len());
        true
    }

    /// Cancel the pending timer for `key`, if any. Returns whether one was cancelled.
    pub async fn disarm(&self, key: &ConversationKey) -> bool {
        let mut guard = self.timers.lock().await;
        match guard.remove(key) {
            Some(entry) => {
                entry.handle.abort();
                record_active(guard.len());
                debug!("disarmed timer for {}", key);
                true
            }
            None => false,
        }
    }

    pub async fn is_armed(&self, key: &ConversationKey) -> bool {
        self.timers.lock().await.contains_key(key)
    }

    pub async fn active_count(&self) -> usize {
        self.timers.lock().await.len()
    }

    /// Cancel every pending timer without flushing. Flushes already running
    /// are not affected. Buffered fragments stay in the store.
    pub async fn cancel_all(&self) {
        let timers: HashMap<ConversationKey, ArmedTimer> = {
            let mut guard = self.timers.lock().await;
            guard.drain().collect()
        };
        let count = timers.len();
        for (key, entry) in timers {
            entry.handle.abort();
            debug!("cancelled timer for {}", key);
        }
        record_active(0);
        if count > 0 {
            info!(
                "cancelled {} pending flush timers, their fragments remain buffered",
                count
            );
        }
    }
}

impl Default for TimerCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

fn record_active(count: usize) {
    metrics::gauge!("chatcoalesce_active_timers").set(count as f64);
}
