//! SQLite-backed durable state store.
//!
//! One database file holds runs, steps, step results and the sync queue.
//! The file is opened in WAL mode so readers (stats, listings) do not block
//! the single writer. Every operation is a synchronous call; there is no
//! internal locking beyond SQLite's own.
//!
//! The store is an explicit object: open it once at startup, pass it by
//! reference to collaborators, and [`StateStore::close`] it on shutdown.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

pub mod error;
pub mod maintenance;
pub mod results;
pub mod runs;
pub mod schema;
pub mod steps;
pub mod sync_queue;

pub use error::{Result, StoreError};
pub use schema::{Migration, MigrationReport, MIGRATIONS};

/// `SQLite` synchronous mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynchronousMode {
    /// Durable on power loss
    Full,

    /// Durable on process crash (WAL default)
    #[default]
    Normal,
}

impl SynchronousMode {
    pub fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "FULL",
            Self::Normal => "NORMAL",
        }
    }
}

/// Tunables for the state store
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    /// How long a writer waits on a locked database (default: 5000ms)
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default)]
    pub synchronous: SynchronousMode,

    /// Attempts before a sync item is marked failed (default: 3)
    #[serde(default = "default_max_sync_attempts")]
    pub max_sync_attempts: u32,

    /// Priority for sync items enqueued without one (default: 5)
    #[serde(default = "default_priority")]
    pub default_priority: i32,

    /// Backoff suggested to the sync worker (default: 5000ms)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Age after which terminal runs are cleaned up (default: 30 days)
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_max_sync_attempts() -> u32 {
    3
}
fn default_priority() -> i32 {
    crate::domain::DEFAULT_PRIORITY
}
fn default_retry_delay_ms() -> u64 {
    5_000
}
fn default_retention_days() -> u32 {
    30
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: default_busy_timeout_ms(),
            synchronous: SynchronousMode::default(),
            max_sync_attempts: default_max_sync_attempts(),
            default_priority: default_priority(),
            retry_delay_ms: default_retry_delay_ms(),
            retention_days: default_retention_days(),
        }
    }
}

/// Durable execution state store
pub struct StateStore {
    conn: Connection,
    path: PathBuf,
    settings: StoreSettings,
    migrations: MigrationReport,
}

impl StateStore {
    /// Open (or create) the database at `path`.
    ///
    /// Fails if the file cannot be opened or the tables cannot be created.
    /// Migration failures are logged and do not prevent opening.
    pub fn open(path: impl AsRef<Path>, settings: &StoreSettings) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path).map_err(|source| StoreError::Open {
            path: path.clone(),
            source,
        })?;
        apply_pragmas(&conn, settings).map_err(|source| StoreError::Open {
            path: path.clone(),
            source,
        })?;

        schema::create_tables(&conn).map_err(StoreError::Schema)?;
        let migrations = schema::migrate(&conn, MIGRATIONS);
        if !migrations.is_clean() {
            warn!(
                failed = migrations.failed.len(),
                "State store opened with unapplied migrations"
            );
        }

        info!(path = %path.display(), applied = migrations.applied.len(), "State store opened");

        Ok(Self {
            conn,
            path,
            settings: settings.clone(),
            migrations,
        })
    }

    /// Open the database at the configured location
    pub fn open_default() -> anyhow::Result<Self> {
        let config = crate::config::config()?;
        Ok(Self::open(&config.database, &config.store)?)
    }

    /// Close the connection, reporting any error from SQLite
    pub fn close(self) -> Result<()> {
        let path = self.path;
        self.conn.close().map_err(|(_, e)| StoreError::from(e))?;
        info!(path = %path.display(), "State store closed");
        Ok(())
    }

    /// Path to the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Result of the migration pass run at open
    pub fn migration_report(&self) -> &MigrationReport {
        &self.migrations
    }

    /// Active journal mode (expected: "wal")
    pub fn journal_mode(&self) -> Result<String> {
        Ok(self
            .conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))?)
    }
}

/// Applies pragmas required for durability and concurrent reads
fn apply_pragmas(conn: &Connection, settings: &StoreSettings) -> rusqlite::Result<()> {
    // journal_mode reports the resulting mode as a row
    let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        warn!(%mode, "WAL journal mode unavailable");
    }
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.pragma_update(None, "synchronous", settings.synchronous.pragma_value())?;
    conn.busy_timeout(Duration::from_millis(settings.busy_timeout_ms))?;
    Ok(())
}

// ============================================================================
// Column helpers shared by the entity modules
// ============================================================================

/// Timestamps are stored as Unix milliseconds
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(millis)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis))
}

pub(crate) fn opt_time_column(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(millis) => DateTime::from_timestamp_millis(millis)
            .map(Some)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis)),
        None => Ok(None),
    }
}

pub(crate) fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn opt_json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Value>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(text) => serde_json::from_str(&text).map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
        }),
        None => Ok(None),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::create_test_store;
    use super::*;

    #[test]
    fn test_open_uses_wal() {
        let (store, _temp) = create_test_store();

        assert_eq!(store.journal_mode().unwrap().to_lowercase(), "wal");
        assert!(store.migration_report().is_clean());
    }

    #[test]
    fn test_open_creates_parent_directories() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("nested").join("deeper").join("state.db");

        let store = StateStore::open(&path, &StoreSettings::default()).unwrap();
        assert!(path.exists());
        store.close().unwrap();
    }

    #[test]
    fn test_reopen_keeps_data() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("state.db");

        let store = StateStore::open(&path, &StoreSettings::default()).unwrap();
        store
            .conn
            .execute(
                "INSERT INTO runs (run_id, plan_id, plan_json, created_at, updated_at)
                 VALUES ('r1', 'p1', '{}', 0, 0)",
                [],
            )
            .unwrap();
        store.close().unwrap();

        let reopened = StateStore::open(&path, &StoreSettings::default()).unwrap();
        let count: i64 = reopened
            .conn
            .query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
        assert!(reopened.migration_report().applied.is_empty());
    }

    #[test]
    fn test_open_fails_on_directory_path() {
        let temp = tempfile::TempDir::new().unwrap();

        let result = StateStore::open(temp.path(), &StoreSettings::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_settings_defaults_from_empty_yaml() {
        let settings: StoreSettings = serde_yaml::from_str("{}").unwrap();

        assert_eq!(settings.busy_timeout_ms, 5_000);
        assert_eq!(settings.max_sync_attempts, 3);
        assert_eq!(settings.default_priority, 5);
        assert_eq!(settings.retention_days, 30);
        assert_eq!(settings.synchronous, SynchronousMode::Normal);
    }
}
