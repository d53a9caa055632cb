use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

use crate::calendar::OccurrenceKey;

const LEGACY_MIGRATION_KEY: &str = "legacy_migration";
const MIGRATION_STARTED: &str = "started";
const MIGRATION_DONE: &str = "done";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),
    #[error("Failed to read legacy mappings: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse legacy mappings: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// What the mirror last pushed for one occurrence.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRecord {
    pub key: OccurrenceKey,
    pub remote_id: String,
    pub fingerprint: String,
    pub last_synced: DateTime<Utc>,
    pub source_modified: Option<DateTime<Utc>>,
    pub calendar: String,
}

/// One entry of the flat JSON mapping file written by earlier releases.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyRecord {
    pub remote_id: String,
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub last_synced: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub calendar: Option<String>,
}

/// Converts the legacy mapping file into records.
///
/// Entries without a fingerprint get an empty one, which never matches a
/// computed fingerprint and so forces one rewrite of the remote copy.
pub fn migrate(legacy: BTreeMap<String, LegacyRecord>, now: DateTime<Utc>) -> Vec<SyncRecord> {
    legacy
        .into_iter()
        .filter(|(key, record)| !key.is_empty() && !record.remote_id.is_empty())
        .map(|(key, record)| SyncRecord {
            key: OccurrenceKey::from_raw(key),
            remote_id: record.remote_id,
            fingerprint: record.fingerprint.unwrap_or_default(),
            last_synced: record.last_synced.unwrap_or(now),
            source_modified: record.source_modified,
            calendar: record.calendar.unwrap_or_default(),
        })
        .collect()
}

/// Durable OccurrenceKey -> SyncRecord table backed by SQLite.
///
/// Every operation is a single statement, so each key is written atomically.
pub struct FingerprintStore {
    conn: Mutex<Connection>,
}

impl FingerprintStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize()?;
        Ok(store)
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&conn)
    }

    fn initialize(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS sync_records (
                    occurrence_key TEXT PRIMARY KEY,
                    remote_id TEXT NOT NULL,
                    fingerprint TEXT NOT NULL,
                    last_synced TEXT NOT NULL,
                    source_modified TEXT,
                    calendar TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_sync_records_calendar
                    ON sync_records (calendar);
                CREATE TABLE IF NOT EXISTS store_meta (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );",
            )?;
            Ok(())
        })
    }

    pub fn get(&self, key: &OccurrenceKey) -> Result<Option<SyncRecord>, StoreError> {
        self.with_conn(|conn| {
            let record = conn
                .query_row(
                    "SELECT occurrence_key, remote_id, fingerprint, last_synced, source_modified, calendar
                     FROM sync_records WHERE occurrence_key = ?1",
                    [key.as_str()],
                    row_to_record,
                )
                .optional()?;
            Ok(record)
        })
    }

    pub fn get_all(&self) -> Result<Vec<SyncRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT occurrence_key, remote_id, fingerprint, last_synced, source_modified, calendar
                 FROM sync_records ORDER BY occurrence_key",
            )?;
            let records = stmt
                .query_map([], row_to_record)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
    }

    pub fn get_by_calendar(&self, calendar: &str) -> Result<Vec<SyncRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT occurrence_key, remote_id, fingerprint, last_synced, source_modified, calendar
                 FROM sync_records WHERE calendar = ?1 ORDER BY occurrence_key",
            )?;
            let records = stmt
                .query_map([calendar], row_to_record)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
    }

    pub fn upsert(
        &self,
        key: &OccurrenceKey,
        remote_id: &str,
        fingerprint: &str,
        source_modified: Option<DateTime<Utc>>,
        calendar: &str,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sync_records
                    (occurrence_key, remote_id, fingerprint, last_synced, source_modified, calendar)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(occurrence_key) DO UPDATE SET
                    remote_id = excluded.remote_id,
                    fingerprint = excluded.fingerprint,
                    last_synced = excluded.last_synced,
                    source_modified = excluded.source_modified,
                    calendar = excluded.calendar",
                params![
                    key.as_str(),
                    remote_id,
                    fingerprint,
                    Utc::now().to_rfc3339(),
                    source_modified.map(|instant| instant.to_rfc3339()),
                    calendar,
                ],
            )?;
            Ok(())
        })
    }

    /// Refreshes timestamps and fingerprint while keeping the remote id.
    /// Returns false when no record exists for `key`.
    pub fn touch(
        &self,
        key: &OccurrenceKey,
        source_modified: Option<DateTime<Utc>>,
        fingerprint: &str,
    ) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sync_records
                 SET fingerprint = ?2, source_modified = ?3, last_synced = ?4
                 WHERE occurrence_key = ?1",
                params![
                    key.as_str(),
                    fingerprint,
                    source_modified.map(|instant| instant.to_rfc3339()),
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(changed > 0)
        })
    }

    /// Assigns a calendar to a record imported without one.
    pub fn set_calendar(&self, key: &OccurrenceKey, calendar: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sync_records SET calendar = ?2 WHERE occurrence_key = ?1",
                params![key.as_str(), calendar],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn remove(&self, key: &OccurrenceKey) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM sync_records WHERE occurrence_key = ?1",
                [key.as_str()],
            )?;
            Ok(())
        })
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM sync_records", [])?;
            Ok(())
        })
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM sync_records", [], |row| row.get(0))?;
            Ok(count as usize)
        })
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    fn meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| {
            let value: Option<String> = conn
                .query_row("SELECT value FROM store_meta WHERE key = ?1", [key], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(value)
        })
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO store_meta (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
            Ok(())
        })
    }

    fn insert_if_absent(&self, record: &SyncRecord) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO sync_records
                    (occurrence_key, remote_id, fingerprint, last_synced, source_modified, calendar)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.key.as_str(),
                    &record.remote_id,
                    &record.fingerprint,
                    record.last_synced.to_rfc3339(),
                    record.source_modified.map(|instant| instant.to_rfc3339()),
                    &record.calendar,
                ],
            )?;
            Ok(())
        })
    }

    /// One-time import of the legacy flat mapping file.
    ///
    /// Runs only while the store is empty or a previous import was cut short.
    /// Each record is committed on its own; the legacy file is renamed to
    /// `<name>.migrated` once every record is in. Returns the number of
    /// records imported.
    pub fn import_legacy(&self, legacy_path: &Path) -> Result<usize, StoreError> {
        if !legacy_path.exists() {
            return Ok(0);
        }

        let resuming = self.meta(LEGACY_MIGRATION_KEY)?.as_deref() == Some(MIGRATION_STARTED);
        if !resuming && !self.is_empty()? {
            tracing::debug!(
                "Fingerprint store already populated, skipping import of {}",
                legacy_path.display()
            );
            return Ok(0);
        }

        let content = std::fs::read_to_string(legacy_path)?;
        let legacy: BTreeMap<String, LegacyRecord> = serde_json::from_str(&content)?;
        let records = migrate(legacy, Utc::now());

        tracing::info!(
            "Importing {} legacy sync records from {}",
            records.len(),
            legacy_path.display()
        );

        self.set_meta(LEGACY_MIGRATION_KEY, MIGRATION_STARTED)?;
        for record in &records {
            self.insert_if_absent(record)?;
        }

        std::fs::rename(legacy_path, archived_path(legacy_path))?;
        self.set_meta(LEGACY_MIGRATION_KEY, MIGRATION_DONE)?;

        let unscoped = self.get_by_calendar("")?;
        if !unscoped.is_empty() {
            tracing::warn!(
                "{} imported records name no calendar; they are assigned one when their occurrence is next seen",
                unscoped.len()
            );
            for record in &unscoped {
                tracing::debug!("Unscoped record {} ({})", record.key, record.remote_id);
            }
        }

        Ok(records.len())
    }
}

fn archived_path(legacy_path: &Path) -> PathBuf {
    let mut name = legacy_path.as_os_str().to_owned();
    name.push(".migrated");
    PathBuf::from(name)
}

fn parse_instant(index: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|instant| instant.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<SyncRecord> {
    let key: String = row.get(0)?;
    let last_synced: String = row.get(3)?;
    let source_modified: Option<String> = row.get(4)?;

    Ok(SyncRecord {
        key: OccurrenceKey::from_raw(key),
        remote_id: row.get(1)?,
        fingerprint: row.get(2)?,
        last_synced: parse_instant(3, &last_synced)?,
        source_modified: source_modified
            .map(|raw| parse_instant(4, &raw))
            .transpose()?,
        calendar: row.get(5)?,
    })
}
