use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

const KEY_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// A single occurrence of an event as observed in a local source calendar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceEvent {
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub all_day: bool,
    pub time_zone: String,
    pub location: Option<String>,
    pub notes: Option<String>,
    pub calendar: String,
    pub last_modified: Option<DateTime<Utc>>,
    /// Shared by every occurrence of a recurring series.
    pub base_id: String,
    pub occurrence_start: DateTime<Utc>,
}

impl SourceEvent {
    pub fn occurrence_key(&self) -> OccurrenceKey {
        OccurrenceKey::new(&self.base_id, self.occurrence_start)
    }

    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start < end && start < self.end
    }
}

/// Identity of one occurrence: base identifier plus occurrence start.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OccurrenceKey(String);

impl OccurrenceKey {
    pub fn new(base_id: &str, occurrence_start: DateTime<Utc>) -> Self {
        Self(format!(
            "{}::{}",
            base_id,
            occurrence_start.format(KEY_TIME_FORMAT)
        ))
    }

    /// Wraps a key that was already rendered, e.g. one read back from storage
    /// or from remote provenance metadata.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OccurrenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
