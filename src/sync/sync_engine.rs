use chrono::Utc;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::calendar::{EventSource, OccurrenceKey, RemoteEvent, SourceError, SourceEvent, TimeWindow};
use crate::storage::config::Config;
use crate::storage::{FingerprintStore, StoreError, SyncRecord};
use crate::sync::batch::{BatchResults, MAX_BATCH_SIZE};
use crate::sync::fingerprint::{fingerprint, to_remote};
use crate::sync::google_api::{ApiError, CalendarApi};
use crate::sync::google_auth::{AuthError, TokenSource};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Authentication error: {0}")]
    AuthError(#[from] AuthError),
    #[error("API error: {0}")]
    ApiError(ApiError),
    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),
    #[error("Source error: {0}")]
    SourceError(#[from] SourceError),
}

impl From<ApiError> for SyncError {
    fn from(error: ApiError) -> Self {
        match error {
            ApiError::AuthError(e) => SyncError::AuthError(e),
            other => SyncError::ApiError(other),
        }
    }
}

/// What a pass does with one occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Create,
    Update { remote_id: String },
    /// Record the newer source timestamp; remote content is already current.
    Touch,
    NoOp,
}

/// Decides the action for one occurrence. The fingerprint is authoritative;
/// the source modification time only separates `Touch` from `NoOp`.
pub fn classify(record: Option<&SyncRecord>, event: &SourceEvent, fingerprint: &str) -> Action {
    let Some(record) = record else {
        return Action::Create;
    };

    let modified_newer = match (event.last_modified, record.source_modified) {
        (Some(modified), Some(stored)) => modified > stored,
        (Some(_), None) => true,
        (None, _) => false,
    };

    if record.fingerprint != fingerprint {
        Action::Update {
            remote_id: record.remote_id.clone(),
        }
    } else if modified_newer {
        Action::Touch
    } else {
        Action::NoOp
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => write!(f, "create"),
            Operation::Update => write!(f, "update"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// A remote operation that did not complete. The occurrence is retried on
/// the next pass because its record was never written or removed.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemFailure {
    pub key: OccurrenceKey,
    pub operation: Operation,
    /// Position inside the batch, for batched operations.
    pub index: Option<usize>,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub touched: usize,
    pub unchanged: usize,
    pub deleted: usize,
    /// Updates whose remote event had vanished and was created again.
    pub recreated: usize,
    pub failures: Vec<ItemFailure>,
}

impl SyncReport {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    fn fail(&mut self, key: &OccurrenceKey, operation: Operation, index: Option<usize>, error: &ApiError) {
        tracing::error!(
            "Failed to {} {} (batch index {:?}): {}",
            operation,
            key,
            index,
            error
        );
        self.failures.push(ItemFailure {
            key: key.clone(),
            operation,
            index,
            error: error.to_string(),
        });
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "created {}, updated {}, recreated {}, touched {}, unchanged {}, deleted {}, failed {}",
            self.created,
            self.updated,
            self.recreated,
            self.touched,
            self.unchanged,
            self.deleted,
            self.failures.len()
        )
    }
}

/// Backoff for batches rejected purely by rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// 30s, 60s, 120s with the default base.
    pub fn delay(&self, retry: u32) -> Duration {
        self.base_delay * 2u32.pow(retry)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub calendars: Vec<String>,
    pub past_days: u32,
    pub future_days: u32,
    pub delete_batch_delay: Duration,
    pub retry: RetryPolicy,
    /// OAuth client id and secret are both set.
    pub credentials_configured: bool,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            calendars: config.calendars.sources.clone(),
            past_days: config.sync.sync_past_days,
            future_days: config.sync.sync_future_days,
            delete_batch_delay: Duration::from_millis(config.sync.delete_batch_delay_ms),
            retry: RetryPolicy::default(),
            credentials_configured: !config.google.client_id.is_empty()
                && !config.google.client_secret.is_empty(),
        }
    }
}

struct PendingCreate {
    event: SourceEvent,
    fingerprint: String,
}

struct PendingUpdate {
    event: SourceEvent,
    fingerprint: String,
    remote_id: String,
}

struct PendingDelete {
    key: OccurrenceKey,
    remote_id: String,
}

/// Drives sync passes. Owns its collaborators; nothing holds a reference
/// back to the engine.
pub struct SyncEngine {
    store: FingerprintStore,
    api: Arc<dyn CalendarApi>,
    tokens: Arc<dyn TokenSource>,
    source: Arc<dyn EventSource>,
    settings: EngineSettings,
}

impl SyncEngine {
    pub fn new(
        store: FingerprintStore,
        api: Arc<dyn CalendarApi>,
        tokens: Arc<dyn TokenSource>,
        source: Arc<dyn EventSource>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            api,
            tokens,
            source,
            settings,
        }
    }

    pub fn store(&self) -> &FingerprintStore {
        &self.store
    }

    pub fn source(&self) -> &Arc<dyn EventSource> {
        &self.source
    }

    /// Window of the current pass, centered on now.
    pub fn window(&self) -> TimeWindow {
        TimeWindow::around(Utc::now(), self.settings.past_days, self.settings.future_days)
    }

    /// Runs one full pass. Per-item failures end up in the report; only
    /// configuration, authentication, source and store failures abort it.
    pub async fn run_pass(&self) -> Result<SyncReport, SyncError> {
        if self.settings.calendars.is_empty() {
            return Err(SyncError::Configuration(
                "no source calendars configured".to_string(),
            ));
        }
        if !self.settings.credentials_configured {
            return Err(SyncError::Configuration(
                "google.client_id and google.client_secret are not set".to_string(),
            ));
        }

        // Fail before touching anything if no credential can be obtained.
        self.tokens.bearer_token().await?;

        let window = self.window();
        let events = self.source.events(&window, &self.settings.calendars).await?;
        tracing::info!(
            "Sync pass over {} source events ({} to {})",
            events.len(),
            window.start,
            window.end
        );

        let mut report = SyncReport::default();
        let mut present = HashSet::new();
        let mut creates = Vec::new();
        let mut updates = Vec::new();

        for event in events {
            let key = event.occurrence_key();
            if !present.insert(key.clone()) {
                tracing::debug!("Discarding duplicate occurrence {}", key);
                continue;
            }

            let fingerprint = fingerprint(&event);
            let record = self.store.get(&key)?;
            if let Some(record) = &record
                && record.calendar.is_empty()
            {
                tracing::info!("Assigning imported record {} to {}", key, event.calendar);
                self.store.set_calendar(&key, &event.calendar)?;
            }
            let action = classify(record.as_ref(), &event, &fingerprint);
            tracing::debug!("{} -> {:?}", key, action);

            match action {
                Action::Create => creates.push(PendingCreate { event, fingerprint }),
                Action::Update { remote_id } => updates.push(PendingUpdate {
                    event,
                    fingerprint,
                    remote_id,
                }),
                Action::Touch => {
                    self.store.touch(&key, event.last_modified, &fingerprint)?;
                    report.touched += 1;
                }
                Action::NoOp => report.unchanged += 1,
            }
        }

        for chunk in creates.chunks(MAX_BATCH_SIZE) {
            self.create_chunk(chunk, &mut report).await?;
        }

        for update in &updates {
            self.apply_update(update, &mut report).await?;
        }

        let deletions = self.deletion_candidates(&present)?;
        for chunk in deletions.chunks(MAX_BATCH_SIZE) {
            tokio::time::sleep(self.settings.delete_batch_delay).await;
            let deleted = self.delete_chunk(chunk, &mut report).await?;
            for key in deleted {
                self.store.remove(&key)?;
                report.deleted += 1;
            }
        }

        tracing::info!("Sync pass finished: {}", report);
        Ok(report)
    }

    async fn create_chunk(
        &self,
        chunk: &[PendingCreate],
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let remotes: Vec<RemoteEvent> = chunk.iter().map(|pending| to_remote(&pending.event)).collect();
        let results = self
            .with_rate_limit_retry("create", chunk.len(), || self.api.batch_create(&remotes))
            .await?;

        for (index, pending) in chunk.iter().enumerate() {
            let key = pending.event.occurrence_key();
            match (results.successes.get(&index), results.failures.get(&index)) {
                (Some(remote_id), _) => {
                    self.store.upsert(
                        &key,
                        remote_id,
                        &pending.fingerprint,
                        pending.event.last_modified,
                        &pending.event.calendar,
                    )?;
                    tracing::info!("Created {} as {}", key, remote_id);
                    report.created += 1;
                }
                (None, Some(error)) => report.fail(&key, Operation::Create, Some(index), error),
                (None, None) => report.fail(
                    &key,
                    Operation::Create,
                    Some(index),
                    &ApiError::ParseError("no result for batch item".to_string()),
                ),
            }
        }

        Ok(())
    }

    async fn apply_update(
        &self,
        pending: &PendingUpdate,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let key = pending.event.occurrence_key();
        let remote = to_remote(&pending.event);

        let remote_id = match self.api.update_event(&pending.remote_id, &remote).await {
            Ok(()) => {
                report.updated += 1;
                pending.remote_id.clone()
            }
            Err(error) if error.is_not_found() => {
                tracing::warn!("Remote event for {} is gone, creating it again", key);
                match self.api.create_event(&remote).await {
                    Ok(remote_id) => {
                        report.recreated += 1;
                        remote_id
                    }
                    Err(error) if error.is_authentication() => return Err(error.into()),
                    Err(error) => {
                        report.fail(&key, Operation::Create, None, &error);
                        return Ok(());
                    }
                }
            }
            Err(error) if error.is_authentication() => return Err(error.into()),
            Err(error) => {
                report.fail(&key, Operation::Update, None, &error);
                return Ok(());
            }
        };

        self.store.upsert(
            &key,
            &remote_id,
            &pending.fingerprint,
            pending.event.last_modified,
            &pending.event.calendar,
        )?;
        Ok(())
    }

    fn deletion_candidates(
        &self,
        present: &HashSet<OccurrenceKey>,
    ) -> Result<Vec<PendingDelete>, SyncError> {
        let mut candidates = Vec::new();

        for calendar in &self.settings.calendars {
            for record in self.store.get_by_calendar(calendar)? {
                if !present.contains(&record.key) {
                    candidates.push(PendingDelete {
                        key: record.key,
                        remote_id: record.remote_id,
                    });
                }
            }
        }

        Ok(candidates)
    }

    /// Deletes one chunk and returns the keys whose remote events are gone.
    async fn delete_chunk(
        &self,
        chunk: &[PendingDelete],
        report: &mut SyncReport,
    ) -> Result<Vec<OccurrenceKey>, SyncError> {
        let remote_ids: Vec<String> = chunk.iter().map(|pending| pending.remote_id.clone()).collect();
        let results = self
            .with_rate_limit_retry("delete", chunk.len(), || self.api.batch_delete(&remote_ids))
            .await?;

        let mut deleted = Vec::new();
        for (index, pending) in chunk.iter().enumerate() {
            if results.successes.contains_key(&index) {
                tracing::info!("Deleted {} ({})", pending.key, pending.remote_id);
                deleted.push(pending.key.clone());
            } else if let Some(error) = results.failures.get(&index) {
                report.fail(&pending.key, Operation::Delete, Some(index), error);
            }
        }

        Ok(deleted)
    }

    /// Repeats a batch call while it is rejected by rate limiting alone.
    /// A batch that fails as a whole fails every item; authentication
    /// failures abort the pass.
    async fn with_rate_limit_retry<T, F, Fut>(
        &self,
        operation: &str,
        count: usize,
        call: F,
    ) -> Result<BatchResults<T>, SyncError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<BatchResults<T>, ApiError>>,
    {
        let policy = self.settings.retry;
        let mut retry = 0;

        loop {
            let results = match call().await {
                Ok(results) => results,
                Err(error) if error.is_authentication() => return Err(error.into()),
                Err(error) => {
                    tracing::warn!("Batch {} of {} items failed: {}", operation, count, error);
                    BatchResults::all_failed(count, &error)
                }
            };

            if !results.only_rate_limited() || retry >= policy.max_retries {
                return Ok(results);
            }

            let delay = policy.delay(retry);
            tracing::warn!(
                "Batch {} rate limited, retrying in {}s (retry {} of {})",
                operation,
                delay.as_secs(),
                retry + 1,
                policy.max_retries
            );
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }

    /// Remote events in `window` that carry sync provenance.
    pub async fn remote_provenance_events(
        &self,
        window: &TimeWindow,
    ) -> Result<Vec<RemoteEvent>, SyncError> {
        let events = self.api.list_events(window).await?;
        Ok(events.into_iter().filter(RemoteEvent::has_provenance).collect())
    }

    /// Provenance-tagged remote events the store has no record for, e.g.
    /// left behind by a crash between a remote create and the store write.
    pub async fn orphaned_events(&self, window: &TimeWindow) -> Result<Vec<RemoteEvent>, SyncError> {
        let mut orphans = Vec::new();

        for event in self.remote_provenance_events(window).await? {
            if let Some(key) = event.occurrence_key()
                && self.store.get(&key)?.is_none()
            {
                orphans.push(event);
            }
        }

        Ok(orphans)
    }

    pub async fn cleanup_orphans(&self, window: &TimeWindow) -> Result<SyncReport, SyncError> {
        let orphans = self.orphaned_events(window).await?;
        tracing::info!("Removing {} orphaned remote events", orphans.len());

        let mut report = SyncReport::default();
        let targets = delete_targets(&orphans);
        for chunk in targets.chunks(MAX_BATCH_SIZE) {
            let deleted = self.delete_chunk(chunk, &mut report).await?;
            report.deleted += deleted.len();
        }

        Ok(report)
    }

    /// Deletes every provenance-tagged remote event in `window`, then the
    /// remote event of every record left over, such as those outside the
    /// window. A record is forgotten only once its remote event is gone.
    pub async fn purge(&self, window: &TimeWindow) -> Result<SyncReport, SyncError> {
        let events = self.remote_provenance_events(window).await?;
        let listed = delete_targets(&events);
        let listed_ids: HashSet<&str> = listed.iter().map(|target| target.remote_id.as_str()).collect();
        let recorded: Vec<PendingDelete> = self
            .store
            .get_all()?
            .into_iter()
            .filter(|record| !listed_ids.contains(record.remote_id.as_str()))
            .map(|record| PendingDelete {
                key: record.key,
                remote_id: record.remote_id,
            })
            .collect();
        tracing::info!(
            "Purging {} listed remote events and {} further recorded ones",
            listed.len(),
            recorded.len()
        );

        let mut report = SyncReport::default();
        for chunk in listed.chunks(MAX_BATCH_SIZE).chain(recorded.chunks(MAX_BATCH_SIZE)) {
            for key in self.delete_chunk(chunk, &mut report).await? {
                self.store.remove(&key)?;
                report.deleted += 1;
            }
        }

        if report.has_failures() {
            tracing::warn!(
                "Keeping {} records whose remote deletion failed",
                report.failures.len()
            );
        }

        Ok(report)
    }
}

fn delete_targets(events: &[RemoteEvent]) -> Vec<PendingDelete> {
    events
        .iter()
        .filter_map(|event| {
            Some(PendingDelete {
                key: event.occurrence_key()?,
                remote_id: event.id.clone()?,
            })
        })
        .collect()
}
