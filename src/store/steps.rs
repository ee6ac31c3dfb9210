//! Step persistence.
//!
//! Steps may be saved in any order but are always consumed in ascending
//! `step_index` order through [`StateStore::get_next_pending_step`].

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;
use tracing::{debug, instrument};

use super::{json_column, opt_time_column, time_column, to_millis};
use super::{Result, StateStore, StoreError};
use crate::domain::{derive_step_id, Step, StepStatus, StepTimestamps};

const STEP_COLUMNS: &str = "step_id, run_id, step_index, status, payload_json,
    started_at, completed_at, created_at, updated_at";

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<Step> {
    Ok(Step {
        step_id: row.get(0)?,
        run_id: row.get(1)?,
        step_index: row.get(2)?,
        status: row.get(3)?,
        payload: json_column(row, 4)?,
        started_at: opt_time_column(row, 5)?,
        completed_at: opt_time_column(row, 6)?,
        created_at: time_column(row, 7)?,
        updated_at: time_column(row, 8)?,
    })
}

impl StateStore {
    /// Create or replace the step at `(run_id, step_index)`.
    ///
    /// The step id is derived from `run_id` and `step_index` unless the
    /// payload carries a string `step_id`. Re-saving overwrites the payload
    /// and resets the step to `pending`; it never creates a second row.
    #[instrument(skip(self, payload))]
    pub fn save_step(&self, run_id: &str, step_index: u32, payload: &Value) -> Result<Step> {
        let step_id = payload
            .get("step_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| derive_step_id(run_id, step_index));
        let now = to_millis(Utc::now());

        self.conn.execute(
            "INSERT INTO steps (
               step_id, run_id, step_index, status, payload_json, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(run_id, step_index) DO UPDATE SET
               step_id = excluded.step_id,
               status = excluded.status,
               payload_json = excluded.payload_json,
               started_at = NULL,
               completed_at = NULL,
               updated_at = excluded.updated_at",
            params![
                step_id,
                run_id,
                step_index,
                StepStatus::Pending,
                serde_json::to_string(payload)?,
                now,
            ],
        )?;

        debug!(%step_id, "Step saved");

        let step = self.conn.query_row(
            &format!("SELECT {STEP_COLUMNS} FROM steps WHERE step_id = ?1"),
            params![step_id],
            step_from_row,
        )?;
        Ok(step)
    }

    /// Fetch a step, or `None` if the id is unknown
    pub fn get_step(&self, step_id: &str) -> Result<Option<Step>> {
        let step = self
            .conn
            .query_row(
                &format!("SELECT {STEP_COLUMNS} FROM steps WHERE step_id = ?1"),
                params![step_id],
                step_from_row,
            )
            .optional()?;
        Ok(step)
    }

    /// Move a step forward to `status`.
    ///
    /// `started_at` defaults to now when the step starts running and
    /// `completed_at` defaults to now when it finishes; explicit timestamps
    /// win. Backward transitions are rejected.
    #[instrument(skip(self, timestamps))]
    pub fn update_step_status(
        &self,
        step_id: &str,
        status: StepStatus,
        timestamps: StepTimestamps,
    ) -> Result<Option<Step>> {
        let tx = self.conn.unchecked_transaction()?;

        let Some(current) = tx
            .query_row(
                &format!("SELECT {STEP_COLUMNS} FROM steps WHERE step_id = ?1"),
                params![step_id],
                step_from_row,
            )
            .optional()?
        else {
            return Ok(None);
        };

        if !current.status.can_transition_to(status) {
            return Err(StoreError::InvalidStepTransition {
                step_id: step_id.to_string(),
                from: current.status,
                to: status,
            });
        }

        let now = Utc::now();
        let started_at = timestamps.started_at.or(current.started_at).or(
            (status == StepStatus::Running).then_some(now),
        );
        let completed_at = timestamps
            .completed_at
            .or(current.completed_at)
            .or(status.is_terminal().then_some(now));

        tx.execute(
            "UPDATE steps
             SET status = ?1, started_at = ?2, completed_at = ?3, updated_at = ?4
             WHERE step_id = ?5",
            params![
                status,
                started_at.map(to_millis),
                completed_at.map(to_millis),
                to_millis(now),
                step_id,
            ],
        )?;

        let updated = tx.query_row(
            &format!("SELECT {STEP_COLUMNS} FROM steps WHERE step_id = ?1"),
            params![step_id],
            step_from_row,
        )?;
        tx.commit()?;

        debug!(from = %current.status, to = %status, "Step status changed");
        Ok(Some(updated))
    }

    /// The pending step with the smallest index, if any
    pub fn get_next_pending_step(&self, run_id: &str) -> Result<Option<Step>> {
        let step = self
            .conn
            .query_row(
                &format!(
                    "SELECT {STEP_COLUMNS} FROM steps
                     WHERE run_id = ?1 AND status = ?2
                     ORDER BY step_index ASC
                     LIMIT 1"
                ),
                params![run_id, StepStatus::Pending],
                step_from_row,
            )
            .optional()?;
        Ok(step)
    }

    /// All steps of a run, ascending by index
    pub fn list_steps(&self, run_id: &str) -> Result<Vec<Step>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE run_id = ?1 ORDER BY step_index ASC"
        ))?;
        let steps = stmt
            .query_map(params![run_id], step_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(steps)
    }
}
