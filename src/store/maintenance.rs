//! Statistics and retention cleanup.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use tracing::{info, instrument};

use super::{to_millis, Result, StateStore};
use crate::domain::{RunStatus, StepStatus, StoreStats, SyncStatus};

/// `status -> count` for one table
fn count_by_status(conn: &Connection, table: &str) -> rusqlite::Result<Vec<(String, u64)>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT status, COUNT(*) FROM {table} GROUP BY status"
    ))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

impl StateStore {
    /// Read-only health snapshot
    pub fn get_stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();

        for (status, count) in count_by_status(&self.conn, "runs")? {
            match status.parse::<RunStatus>() {
                Ok(RunStatus::Executing) => stats.runs.executing = count,
                Ok(RunStatus::Paused) => stats.runs.paused = count,
                Ok(RunStatus::Complete) => stats.runs.complete = count,
                Ok(RunStatus::Failed) => stats.runs.failed = count,
                Ok(RunStatus::Cancelled) => stats.runs.cancelled = count,
                Err(_) => {}
            }
        }

        for (status, count) in count_by_status(&self.conn, "steps")? {
            match status.parse::<StepStatus>() {
                Ok(StepStatus::Pending) => stats.steps.pending = count,
                Ok(StepStatus::Running) => stats.steps.running = count,
                Ok(StepStatus::Complete) => stats.steps.complete = count,
                Ok(StepStatus::Failed) => stats.steps.failed = count,
                Err(_) => {}
            }
        }

        for (status, count) in count_by_status(&self.conn, "sync_queue")? {
            match status.parse::<SyncStatus>() {
                Ok(SyncStatus::Pending) => stats.sync_queue.pending = count,
                Ok(SyncStatus::Completed) => stats.sync_queue.completed = count,
                Ok(SyncStatus::Failed) => stats.sync_queue.failed = count,
                Err(_) => {}
            }
        }

        stats.unsynced_results = self.conn.query_row(
            "SELECT COUNT(*) FROM step_results WHERE synced_to_cloud = 0",
            [],
            |row| row.get(0),
        )?;

        Ok(stats)
    }

    /// Delete terminal runs completed more than `older_than_days` ago.
    ///
    /// Steps, results and queue items of those runs go with them in the same
    /// transaction. Returns the number of runs removed.
    #[instrument(skip(self))]
    pub fn cleanup(&self, older_than_days: u32) -> Result<usize> {
        // Windows reaching past the calendar range match nothing
        let cutoff = Utc::now()
            .checked_sub_signed(Duration::days(i64::from(older_than_days)))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let cutoff = to_millis(cutoff);
        let terminal = [RunStatus::Complete, RunStatus::Failed, RunStatus::Cancelled];
        let expired = "SELECT run_id FROM runs
                       WHERE status IN (?1, ?2, ?3)
                         AND completed_at IS NOT NULL
                         AND completed_at < ?4";

        let tx = self.conn.unchecked_transaction()?;
        let args = params![terminal[0], terminal[1], terminal[2], cutoff];

        for table in ["sync_queue", "step_results", "steps"] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE run_id IN ({expired})"),
                args,
            )?;
        }
        let removed = tx.execute(&format!("DELETE FROM runs WHERE run_id IN ({expired})"), args)?;
        tx.commit()?;

        info!(removed, older_than_days, "Cleanup finished");
        Ok(removed)
    }

    /// Cleanup using the configured retention window
    pub fn cleanup_expired(&self) -> Result<usize> {
        self.cleanup(self.settings.retention_days)
    }
}
