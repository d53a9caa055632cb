use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::calendar::SourceEvent;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to read event source: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse event source: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Event source unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn around(center: DateTime<Utc>, past_days: u32, future_days: u32) -> Self {
        Self {
            start: center - chrono::Duration::days(past_days as i64),
            end: center + chrono::Duration::days(future_days as i64),
        }
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }
}

/// Local calendar store the mirror reads from.
///
/// A bump of the [`subscribe`](EventSource::subscribe) counter only means
/// "something changed, re-scan"; it never identifies the changed event.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn events(
        &self,
        window: &TimeWindow,
        calendars: &[String],
    ) -> Result<Vec<SourceEvent>, SourceError>;

    fn subscribe(&self) -> watch::Receiver<u64>;
}

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Reads occurrences from a JSON export file (an array of [`SourceEvent`]).
pub struct JsonFileSource {
    path: PathBuf,
    poll_interval: Duration,
    changes: Arc<watch::Sender<u64>>,
}

impl JsonFileSource {
    pub fn new(path: PathBuf, poll_interval: Duration) -> Self {
        if poll_interval < MIN_POLL_INTERVAL {
            tracing::warn!(
                "Poll interval {:?} is too short, using {:?}",
                poll_interval,
                MIN_POLL_INTERVAL
            );
        }
        let (changes, _) = watch::channel(0);
        Self {
            path,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            changes: Arc::new(changes),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Polls the export's modification time and bumps the change counter
    /// whenever it moves.
    pub fn spawn_watcher(&self) -> JoinHandle<()> {
        let path = self.path.clone();
        let poll_interval = self.poll_interval;
        let changes = Arc::clone(&self.changes);

        tokio::spawn(async move {
            let mut last_seen = modified_at(&path).await;
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let current = modified_at(&path).await;
                if current != last_seen {
                    tracing::debug!("Event source {} changed", path.display());
                    last_seen = current;
                    changes.send_modify(|generation| *generation += 1);
                }
            }
        })
    }
}

async fn modified_at(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

#[async_trait]
impl EventSource for JsonFileSource {
    async fn events(
        &self,
        window: &TimeWindow,
        calendars: &[String],
    ) -> Result<Vec<SourceEvent>, SourceError> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let events: Vec<SourceEvent> = serde_json::from_str(&content)?;
        let total = events.len();

        let selected: Vec<SourceEvent> = events
            .into_iter()
            .filter(|event| calendars.iter().any(|name| name == &event.calendar))
            .filter(|event| event.overlaps(window.start, window.end))
            .collect();

        tracing::debug!(
            "Read {} of {} source events from {}",
            selected.len(),
            total,
            self.path.display()
        );
        Ok(selected)
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}
