use crate::aggregator::flush::{FlushPipeline, FlushTrigger};
use crate::aggregator::store::BufferStore;
use crate::aggregator::timer::TimerCoordinator;
use crate::config::SweepConfig;
use crate::errors::CoalesceResult;
use crate::utils::now_ms;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Overdue windows read from the shared schedule.
    pub scanned: usize,
    /// Windows this pass flushed.
    pub flushed: usize,
    /// Windows still owned by a local timer.
    pub skipped: usize,
    pub failed: usize,
}

/// Flushes windows whose timer was lost.
///
/// Any instance sharing the store may run a sweeper. Each window is
/// claimed and drained by its deadline in one step, so concurrent sweepers
/// (and a late local timer) flush it at most once.
pub struct RecoverySweeper {
    store: Arc<dyn BufferStore>,
    pipeline: Arc<FlushPipeline>,
    timers: Arc<TimerCoordinator>,
    interval: Duration,
    grace_ms: i64,
    batch_size: usize,
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RecoverySweeper {
    pub fn new(
        config: &SweepConfig,
        store: Arc<dyn BufferStore>,
        pipeline: Arc<FlushPipeline>,
        timers: Arc<TimerCoordinator>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            store,
            pipeline,
            timers,
            interval: Duration::from_secs(config.interval_secs.max(1)),
            grace_ms: i64::try_from(config.grace_secs.saturating_mul(1000)).unwrap_or(i64::MAX),
            batch_size: config.batch_size.max(1),
            stop_tx,
            handle: Mutex::new(None),
        }
    }

    /// One pass over windows whose deadline is more than the grace period before `now_ms`.
    pub async fn sweep_once(&self, now_ms: i64) -> CoalesceResult<SweepReport> {
        let cutoff = now_ms.saturating_sub(self.grace_ms);
        let due = self.store.due_windows(cutoff, self.batch_size).await?;
        let mut report = SweepReport {
            scanned: due.len(),
            ..SweepReport::default()
        };

        for (key, deadline_ms) in due {
            if self.timers.is_armed(&key).await {
                report.skipped += 1;
                continue;
            }
            match self
                .pipeline
                .flush(&key, FlushTrigger::Sweep { deadline_ms })
                .await
            {
                Ok(Some(_)) => {
                    warn!(
                        "recovered orphaned window for {} ({}ms overdue)",
                        key,
                        now_ms - deadline_ms
                    );
                    report.flushed += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    error!("sweep flush for {} failed: {}", key, e);
                    report.failed += 1;
                }
            }
        }

        if report.scanned > 0 {
            info!(
                "sweep: scanned {}, flushed {}, skipped {}, failed {}",
                report.scanned, report.flushed, report.skipped, report.failed
            );
        }
        Ok(report)
    }

    /// Run [`RecoverySweeper::sweep_once`] every interval until [`RecoverySweeper::stop`].
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return;
        }
        let _ = self.stop_tx.send(false);
        let mut stop_rx = self.stop_tx.subscribe();
        let sweeper = self.clone();
        let interval = self.interval;

        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = sweeper.sweep_once(now_ms()).await {
                            error!("recovery sweep failed: {}", e);
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("recovery sweeper exited");
        }));
        info!("recovery sweeper started (every {}s)", interval.as_secs());
    }

    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!("recovery sweeper task ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests;
