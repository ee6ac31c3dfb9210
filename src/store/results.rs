//! Append-only log of step execution attempts.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, instrument};

use super::{opt_time_column, time_column, to_millis};
use super::{Result, StateStore};
use crate::domain::{StepOutcome, StepResult};

const RESULT_COLUMNS: &str = "result_id, step_id, run_id, step_index, success, stdout, stderr,
    exit_code, error, attempts, execution_time_ms, created_at, synced_to_cloud, synced_at";

fn result_from_row(row: &Row<'_>) -> rusqlite::Result<StepResult> {
    Ok(StepResult {
        result_id: row.get(0)?,
        step_id: row.get(1)?,
        run_id: row.get(2)?,
        step_index: row.get(3)?,
        outcome: StepOutcome {
            success: row.get(4)?,
            stdout: row.get(5)?,
            stderr: row.get(6)?,
            exit_code: row.get(7)?,
            error: row.get(8)?,
            attempts: row.get(9)?,
            execution_time_ms: row.get(10)?,
        },
        created_at: time_column(row, 11)?,
        synced_to_cloud: row.get(12)?,
        synced_at: opt_time_column(row, 13)?,
    })
}

impl StateStore {
    /// Record one execution attempt. Always inserts a new row.
    ///
    /// `outcome.attempts` is stored as supplied; the store does not count
    /// attempts itself.
    #[instrument(skip(self, outcome), fields(success = outcome.success, attempts = outcome.attempts))]
    pub fn save_step_result(
        &self,
        step_id: &str,
        run_id: &str,
        step_index: u32,
        outcome: &StepOutcome,
    ) -> Result<StepResult> {
        self.conn.execute(
            "INSERT INTO step_results (
               step_id, run_id, step_index, success, stdout, stderr, exit_code, error,
               attempts, execution_time_ms, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                step_id,
                run_id,
                step_index,
                outcome.success,
                outcome.stdout,
                outcome.stderr,
                outcome.exit_code,
                outcome.error,
                outcome.attempts,
                outcome.execution_time_ms,
                to_millis(Utc::now()),
            ],
        )?;
        let result_id = self.conn.last_insert_rowid();

        debug!(result_id, "Step result recorded");

        let result = self.conn.query_row(
            &format!("SELECT {RESULT_COLUMNS} FROM step_results WHERE result_id = ?1"),
            params![result_id],
            result_from_row,
        )?;
        Ok(result)
    }

    /// The most recent result for a step, or `None`
    pub fn get_step_result(&self, step_id: &str) -> Result<Option<StepResult>> {
        // result_id breaks ties between attempts recorded in the same millisecond
        let result = self
            .conn
            .query_row(
                &format!(
                    "SELECT {RESULT_COLUMNS} FROM step_results
                     WHERE step_id = ?1
                     ORDER BY created_at DESC, result_id DESC
                     LIMIT 1"
                ),
                params![step_id],
                result_from_row,
            )
            .optional()?;
        Ok(result)
    }

    /// Every recorded attempt for a step, oldest first
    pub fn list_step_results(&self, step_id: &str) -> Result<Vec<StepResult>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RESULT_COLUMNS} FROM step_results
             WHERE step_id = ?1
             ORDER BY created_at ASC, result_id ASC"
        ))?;
        let results = stmt
            .query_map(params![step_id], result_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(results)
    }

    /// Results not yet uploaded, oldest first, optionally for a single run
    pub fn get_unsynced_results(&self, run_id: Option<&str>) -> Result<Vec<StepResult>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RESULT_COLUMNS} FROM step_results
             WHERE synced_to_cloud = 0 AND (?1 IS NULL OR run_id = ?1)
             ORDER BY created_at ASC, result_id ASC"
        ))?;
        let results = stmt
            .query_map(params![run_id], result_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(results)
    }

    /// Flag a result as uploaded. Marking twice keeps the first `synced_at`.
    ///
    /// Returns `false` if the result id is unknown.
    pub fn mark_result_synced(&self, result_id: i64) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE step_results
             SET synced_to_cloud = 1, synced_at = COALESCE(synced_at, ?1)
             WHERE result_id = ?2",
            params![to_millis(Utc::now()), result_id],
        )?;
        Ok(changed > 0)
    }
}
