//! Table creation and additive migrations.
//!
//! Tables are created with `CREATE TABLE IF NOT EXISTS`; a failure there is
//! fatal. Migrations then bring databases created by older builds up to date.
//! Each migration inspects the live schema before acting, so re-running is
//! always safe, and a failing migration is logged and skipped so the store
//! still opens.

use rusqlite::{params, Connection};
use tracing::{debug, warn};

/// Base schema for a fresh database
const CREATE_TABLES: &str = "
    CREATE TABLE IF NOT EXISTS runs (
      run_id TEXT PRIMARY KEY,
      plan_id TEXT NOT NULL,
      user_id TEXT,
      message TEXT,
      status TEXT NOT NULL DEFAULT 'executing',
      total_steps INTEGER NOT NULL DEFAULT 0,
      current_step_index INTEGER NOT NULL DEFAULT 0,
      plan_json TEXT NOT NULL,
      metadata_json TEXT,
      created_at INTEGER NOT NULL,
      updated_at INTEGER NOT NULL,
      completed_at INTEGER,
      final_response TEXT,
      sync_status TEXT NOT NULL DEFAULT 'pending',
      last_synced_at INTEGER
    );

    CREATE TABLE IF NOT EXISTS steps (
      step_id TEXT PRIMARY KEY,
      run_id TEXT NOT NULL,
      step_index INTEGER NOT NULL,
      status TEXT NOT NULL DEFAULT 'pending',
      payload_json TEXT NOT NULL,
      started_at INTEGER,
      completed_at INTEGER,
      created_at INTEGER NOT NULL,
      updated_at INTEGER NOT NULL,
      UNIQUE (run_id, step_index),
      FOREIGN KEY (run_id) REFERENCES runs(run_id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS step_results (
      result_id INTEGER PRIMARY KEY AUTOINCREMENT,
      step_id TEXT NOT NULL,
      run_id TEXT NOT NULL,
      step_index INTEGER NOT NULL,
      success INTEGER NOT NULL,
      stdout TEXT,
      stderr TEXT,
      exit_code INTEGER,
      error TEXT,
      attempts INTEGER NOT NULL DEFAULT 1,
      execution_time_ms INTEGER,
      created_at INTEGER NOT NULL,
      synced_to_cloud INTEGER NOT NULL DEFAULT 0,
      synced_at INTEGER,
      FOREIGN KEY (run_id) REFERENCES runs(run_id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS sync_queue (
      queue_id INTEGER PRIMARY KEY AUTOINCREMENT,
      run_id TEXT NOT NULL,
      step_index INTEGER,
      action TEXT NOT NULL,
      payload_json TEXT NOT NULL,
      priority INTEGER NOT NULL DEFAULT 5,
      status TEXT NOT NULL DEFAULT 'pending',
      attempts INTEGER NOT NULL DEFAULT 0,
      max_attempts INTEGER NOT NULL DEFAULT 3,
      created_at INTEGER NOT NULL,
      last_attempt_at INTEGER,
      next_retry_at INTEGER,
      error TEXT,
      FOREIGN KEY (run_id) REFERENCES runs(run_id) ON DELETE CASCADE
    );
";

/// A single additive schema change
#[derive(Debug, Clone, Copy)]
pub enum Migration {
    /// `ALTER TABLE {table} ADD COLUMN {column} {definition}` unless present
    AddColumn {
        table: &'static str,
        column: &'static str,
        definition: &'static str,
    },

    /// Create a named index unless present
    CreateIndex {
        name: &'static str,
        table: &'static str,
        columns: &'static str,
    },
}

/// Ordered migration list. Append only; never reorder or remove entries.
pub const MIGRATIONS: &[Migration] = &[
    Migration::AddColumn {
        table: "runs",
        column: "user_id",
        definition: "TEXT",
    },
    Migration::AddColumn {
        table: "runs",
        column: "message",
        definition: "TEXT",
    },
    Migration::AddColumn {
        table: "runs",
        column: "final_response",
        definition: "TEXT",
    },
    Migration::AddColumn {
        table: "runs",
        column: "sync_status",
        definition: "TEXT NOT NULL DEFAULT 'pending'",
    },
    Migration::AddColumn {
        table: "runs",
        column: "last_synced_at",
        definition: "INTEGER",
    },
    Migration::AddColumn {
        table: "step_results",
        column: "execution_time_ms",
        definition: "INTEGER",
    },
    Migration::AddColumn {
        table: "step_results",
        column: "synced_at",
        definition: "INTEGER",
    },
    Migration::AddColumn {
        table: "sync_queue",
        column: "last_attempt_at",
        definition: "INTEGER",
    },
    Migration::AddColumn {
        table: "sync_queue",
        column: "next_retry_at",
        definition: "INTEGER",
    },
    Migration::AddColumn {
        table: "sync_queue",
        column: "error",
        definition: "TEXT",
    },
    Migration::CreateIndex {
        name: "idx_runs_status_updated",
        table: "runs",
        columns: "status, updated_at DESC",
    },
    Migration::CreateIndex {
        name: "idx_runs_user",
        table: "runs",
        columns: "user_id, updated_at DESC",
    },
    Migration::CreateIndex {
        name: "idx_steps_run_index",
        table: "steps",
        columns: "run_id, step_index",
    },
    Migration::CreateIndex {
        name: "idx_steps_run_status",
        table: "steps",
        columns: "run_id, status, step_index",
    },
    Migration::CreateIndex {
        name: "idx_step_results_step",
        table: "step_results",
        columns: "step_id, created_at DESC",
    },
    Migration::CreateIndex {
        name: "idx_step_results_unsynced",
        table: "step_results",
        columns: "synced_to_cloud, run_id, created_at",
    },
    Migration::CreateIndex {
        name: "idx_sync_queue_due",
        table: "sync_queue",
        columns: "status, next_retry_at, priority, created_at",
    },
];

impl Migration {
    /// Human-readable name for logs and reports
    pub fn name(&self) -> String {
        match self {
            Self::AddColumn { table, column, .. } => format!("add column {}.{}", table, column),
            Self::CreateIndex { name, .. } => format!("create index {}", name),
        }
    }

    /// Inspect the live schema to see whether this change already exists
    fn is_applied(&self, connection: &Connection) -> rusqlite::Result<bool> {
        match self {
            Self::AddColumn { table, column, .. } => column_exists(connection, table, column),
            Self::CreateIndex { name, .. } => {
                let count: i64 = connection.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = ?1",
                    params![name],
                    |row| row.get(0),
                )?;
                Ok(count > 0)
            }
        }
    }

    fn apply(&self, connection: &Connection) -> rusqlite::Result<()> {
        let sql = match self {
            Self::AddColumn {
                table,
                column,
                definition,
            } => format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"),
            Self::CreateIndex {
                name,
                table,
                columns,
            } => format!("CREATE INDEX IF NOT EXISTS {name} ON {table}({columns})"),
        };
        connection.execute_batch(&sql)
    }
}

/// Outcome of a migration pass
#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    /// Migrations that changed the schema
    pub applied: Vec<String>,

    /// Migrations that were already in place
    pub already_present: usize,

    /// Migrations that failed, with the error message
    pub failed: Vec<(String, String)>,
}

impl MigrationReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Create all tables if absent
pub fn create_tables(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(CREATE_TABLES)
}

/// Apply `migrations` in order, logging and skipping failures
pub fn migrate(connection: &Connection, migrations: &[Migration]) -> MigrationReport {
    let mut report = MigrationReport::default();

    for migration in migrations {
        let name = migration.name();
        let outcome = migration.is_applied(connection).and_then(|applied| {
            if applied {
                Ok(false)
            } else {
                migration.apply(connection).map(|()| true)
            }
        });

        match outcome {
            Ok(true) => {
                debug!(migration = %name, "Migration applied");
                report.applied.push(name);
            }
            Ok(false) => report.already_present += 1,
            Err(e) => {
                warn!(migration = %name, error = %e, "Migration failed, continuing");
                report.failed.push((name, e.to_string()));
            }
        }
    }

    report
}

/// Check a table for a column via `PRAGMA table_info`
pub fn column_exists(connection: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = connection.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_db() -> Connection {
        let connection = Connection::open_in_memory().unwrap();
        create_tables(&connection).unwrap();
        connection
    }

    #[test]
    fn test_fresh_schema_needs_no_column_migrations() {
        let connection = memory_db();
        let report = migrate(&connection, MIGRATIONS);

        assert!(report.is_clean());
        // Only indexes are new on a fresh database
        assert!(report.applied.iter().all(|name| name.starts_with("create index")));
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let connection = memory_db();
        migrate(&connection, MIGRATIONS);

        let second = migrate(&connection, MIGRATIONS);
        assert!(second.applied.is_empty());
        assert_eq!(second.already_present, MIGRATIONS.len());
    }

    #[test]
    fn test_failed_migration_is_swallowed() {
        let connection = memory_db();
        let migrations = [
            Migration::AddColumn {
                table: "no_such_table",
                column: "x",
                definition: "TEXT",
            },
            Migration::CreateIndex {
                name: "idx_runs_plan",
                table: "runs",
                columns: "plan_id",
            },
        ];

        let report = migrate(&connection, &migrations);

        // The broken migration is reported; the next one still runs
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "add column no_such_table.x");
        assert_eq!(report.applied, vec!["create index idx_runs_plan".to_string()]);
    }

    #[test]
    fn test_column_exists() {
        let connection = memory_db();

        assert!(column_exists(&connection, "runs", "plan_json").unwrap());
        assert!(!column_exists(&connection, "runs", "nope").unwrap());
    }
}
