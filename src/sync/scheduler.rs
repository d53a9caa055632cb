use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::sync::sync_engine::{SyncEngine, SyncError};

const MIN_INTERVAL: Duration = Duration::from_secs(60);

/// Requests a pass from a running [`SyncScheduler`].
#[derive(Clone)]
pub struct SyncTrigger {
    sender: mpsc::Sender<()>,
}

impl SyncTrigger {
    /// Returns false when a request is already pending or the scheduler is
    /// gone. A pending request already covers this one.
    pub fn request(&self) -> bool {
        self.sender.try_send(()).is_ok()
    }
}

/// Runs passes one at a time on the calling task.
///
/// Timer ticks, source change signals and manual triggers all land in the
/// same place: whatever arrives while a pass is running yields at most one
/// follow-up pass.
pub struct SyncScheduler {
    engine: SyncEngine,
    interval: Duration,
    trigger_tx: mpsc::Sender<()>,
    trigger_rx: mpsc::Receiver<()>,
}

impl SyncScheduler {
    /// Intervals under a minute are raised to one minute.
    pub fn new(engine: SyncEngine, interval: Duration) -> Self {
        if interval < MIN_INTERVAL {
            tracing::warn!("Sync interval {:?} is too short, using {:?}", interval, MIN_INTERVAL);
        }
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        Self {
            engine,
            interval: interval.max(MIN_INTERVAL),
            trigger_tx,
            trigger_rx,
        }
    }

    pub fn trigger(&self) -> SyncTrigger {
        SyncTrigger {
            sender: self.trigger_tx.clone(),
        }
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    /// Loops until `shutdown` resolves and returns the number of passes run.
    /// The first pass starts immediately.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> usize {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut changes = Some(self.engine.source().subscribe());
        let mut passes = 0;
        tokio::pin!(shutdown);

        tracing::info!(
            "Scheduler started, syncing every {} minutes",
            self.interval.as_secs() / 60
        );

        loop {
            let reason = tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => "timer",
                changed = source_changed(&mut changes) => {
                    if !changed {
                        tracing::warn!("Event source stopped sending change signals");
                        changes = None;
                        continue;
                    }
                    "source change"
                }
                Some(()) = self.trigger_rx.recv() => "manual trigger",
            };

            // Everything pending now is covered by this pass.
            if let Some(receiver) = changes.as_mut() {
                receiver.borrow_and_update();
            }
            while self.trigger_rx.try_recv().is_ok() {}
            ticker.reset();

            tracing::info!("Starting sync pass ({})", reason);
            passes += 1;
            match self.engine.run_pass().await {
                Ok(report) if report.has_failures() => {
                    tracing::warn!(
                        "Sync pass left {} items for the next pass: {}",
                        report.failures.len(),
                        report
                    );
                }
                Ok(_) => {}
                Err(SyncError::Configuration(problem)) => {
                    tracing::warn!("Sync pass skipped: {}", problem);
                }
                Err(e) => tracing::error!("Sync pass failed: {}", e),
            }
        }

        tracing::info!("Scheduler stopped after {} passes", passes);
        passes
    }
}

async fn source_changed(changes: &mut Option<watch::Receiver<u64>>) -> bool {
    match changes.as_mut() {
        Some(receiver) => receiver.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{EventSource, SourceError, SourceEvent, TimeWindow};
    use crate::storage::FingerprintStore;
    use crate::sync::sync_engine::tests::{FakeCalendar, StaticToken, settings};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSource {
        scans: AtomicUsize,
        changes: Option<watch::Sender<u64>>,
    }

    impl CountingSource {
        fn watched() -> Self {
            Self {
                scans: AtomicUsize::new(0),
                changes: Some(watch::channel(0).0),
            }
        }

        fn bump(&self) {
            if let Some(changes) = &self.changes {
                changes.send_modify(|generation| *generation += 1);
            }
        }
    }

    #[async_trait]
    impl EventSource for CountingSource {
        async fn events(
            &self,
            _window: &TimeWindow,
            _calendars: &[String],
        ) -> Result<Vec<SourceEvent>, SourceError> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }

        fn subscribe(&self) -> watch::Receiver<u64> {
            match &self.changes {
                Some(changes) => changes.subscribe(),
                // Dropping the sender right away closes the channel.
                None => watch::channel(0).1,
            }
        }
    }

    fn scheduler(source: Arc<CountingSource>, interval: Duration) -> SyncScheduler {
        let engine = SyncEngine::new(
            FingerprintStore::open_in_memory().unwrap(),
            Arc::new(FakeCalendar::default()),
            Arc::new(StaticToken),
            source,
            settings(),
        );
        SyncScheduler::new(engine, interval)
    }

    #[tokio::test(start_paused = true)]
    async fn timer_drives_passes() {
        let source = Arc::new(CountingSource::watched());
        let scheduler = scheduler(source.clone(), Duration::from_secs(15 * 60));

        let passes = scheduler
            .run(tokio::time::sleep(Duration::from_secs(31 * 60)))
            .await;

        assert_eq!(passes, 3);
        assert_eq!(source.scans.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_triggers_coalesce_into_one_pass() {
        let source = Arc::new(CountingSource::watched());
        let scheduler = scheduler(source, Duration::from_secs(3600));
        let trigger = scheduler.trigger();

        let accepted: Vec<bool> = (0..3).map(|_| trigger.request()).collect();
        let passes = scheduler
            .run(tokio::time::sleep(Duration::from_secs(60)))
            .await;

        assert_eq!(accepted, vec![true, false, false]);
        assert_eq!(passes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn source_change_starts_a_pass() {
        let source = Arc::new(CountingSource::watched());
        let scheduler = scheduler(source.clone(), Duration::from_secs(3600));
        let bumper = source.clone();

        let passes = scheduler
            .run(async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                bumper.bump();
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
            .await;

        assert_eq!(passes, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_change_channel_leaves_timer_running() {
        let source = Arc::new(CountingSource::default());
        let scheduler = scheduler(source.clone(), Duration::from_secs(60));

        let passes = scheduler
            .run(tokio::time::sleep(Duration::from_secs(150)))
            .await;

        assert_eq!(passes, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_falls_back_to_one_minute() {
        let source = Arc::new(CountingSource::watched());
        let scheduler = scheduler(source.clone(), Duration::ZERO);

        let passes = scheduler
            .run(tokio::time::sleep(Duration::from_secs(150)))
            .await;

        assert_eq!(passes, 3);
        assert_eq!(source.scans.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn trigger_fails_once_scheduler_is_gone() {
        let source = Arc::new(CountingSource::watched());
        let scheduler = scheduler(source, Duration::from_secs(3600));
        let trigger = scheduler.trigger();

        drop(scheduler);

        assert!(!trigger.request());
    }
}
