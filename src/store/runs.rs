//! Run persistence and status lifecycle.

use chrono::Utc;
use rusqlite::{params, params_from_iter, types::Value as SqlValue, OptionalExtension, Row};
use serde_json::Value;
use tracing::{debug, info, instrument};

use super::{json_column, opt_json_column, opt_time_column, time_column, to_millis};
use super::{Result, StateStore, StoreError};
use crate::domain::{Plan, Run, RunFilter, RunStatus, RunUpdate};

const RUN_COLUMNS: &str = "run_id, plan_id, user_id, message, status, total_steps,
    current_step_index, created_at, updated_at, completed_at, final_response,
    plan_json, metadata_json, sync_status, last_synced_at";

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        run_id: row.get(0)?,
        plan_id: row.get(1)?,
        user_id: row.get(2)?,
        message: row.get(3)?,
        status: row.get(4)?,
        total_steps: row.get(5)?,
        current_step_index: row.get(6)?,
        created_at: time_column(row, 7)?,
        updated_at: time_column(row, 8)?,
        completed_at: opt_time_column(row, 9)?,
        final_response: row.get(10)?,
        plan: json_column(row, 11)?,
        metadata: opt_json_column(row, 12)?,
        sync_status: row.get(13)?,
        last_synced_at: opt_time_column(row, 14)?,
    })
}

impl StateStore {
    /// Persist a new run for `plan` with status `executing`.
    ///
    /// `total_steps` is fixed to the number of steps in the plan. Reusing an
    /// existing `run_id` fails with [`StoreError::Constraint`].
    #[instrument(skip(self, plan))]
    pub fn create_run(&self, run_id: &str, plan: &Value) -> Result<Run> {
        let plan = Plan::parse(plan.clone())?;
        let total_steps = u32::try_from(plan.step_count())
            .map_err(|_| StoreError::InvalidPlan("too many steps".to_string()))?;
        let now = to_millis(Utc::now());

        self.conn.execute(
            "INSERT INTO runs (
               run_id, plan_id, user_id, message, status, total_steps, current_step_index,
               plan_json, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?8)",
            params![
                run_id,
                plan.plan_id(),
                plan.user_id(),
                plan.message(),
                RunStatus::Executing,
                total_steps,
                serde_json::to_string(plan.as_value())?,
                now,
            ],
        )?;

        info!(run_id, plan_id = plan.plan_id(), total_steps, "Run created");

        let run = self.conn.query_row(
            &format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"),
            params![run_id],
            run_from_row,
        )?;
        Ok(run)
    }

    /// Fetch a run, or `None` if the id is unknown
    pub fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let run = self
            .conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"),
                params![run_id],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    /// Apply the fields present in `update`; `updated_at` is always refreshed.
    ///
    /// Returns `None` for an unknown run. Once a run is terminal its status
    /// can no longer change ([`StoreError::InvalidRunTransition`]); the
    /// remaining fields stay writable for sync bookkeeping.
    #[instrument(skip(self, update), fields(status = ?update.status))]
    pub fn update_run(&self, run_id: &str, update: RunUpdate) -> Result<Option<Run>> {
        let tx = self.conn.unchecked_transaction()?;

        let Some(current) = tx
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"),
                params![run_id],
                run_from_row,
            )
            .optional()?
        else {
            debug!(run_id, "Update for unknown run");
            return Ok(None);
        };

        let next_status = update.status.unwrap_or(current.status);
        if current.status.is_terminal() && next_status != current.status {
            return Err(StoreError::InvalidRunTransition {
                run_id: run_id.to_string(),
                from: current.status,
                to: next_status,
            });
        }

        let now = Utc::now();
        let completed_at = if next_status.is_terminal() {
            Some(update.completed_at.or(current.completed_at).unwrap_or(now))
        } else if update.completed_at.is_some() {
            return Err(StoreError::InvalidUpdate(format!(
                "completed_at requires a terminal status (run {} is {})",
                run_id, next_status
            )));
        } else {
            None
        };

        let mut assignments: Vec<&str> = vec!["updated_at = ?", "status = ?", "completed_at = ?"];
        let mut values: Vec<SqlValue> = vec![
            to_millis(now).into(),
            next_status.as_str().to_string().into(),
            completed_at.map(to_millis).into(),
        ];

        if let Some(index) = update.current_step_index {
            assignments.push("current_step_index = ?");
            values.push(i64::from(index).into());
        }
        if let Some(metadata) = &update.metadata {
            assignments.push("metadata_json = ?");
            values.push(serde_json::to_string(metadata)?.into());
        }
        if let Some(sync_status) = &update.sync_status {
            assignments.push("sync_status = ?");
            values.push(sync_status.clone().into());
        }
        if let Some(last_synced_at) = update.last_synced_at {
            assignments.push("last_synced_at = ?");
            values.push(to_millis(last_synced_at).into());
        }
        if let Some(final_response) = &update.final_response {
            assignments.push("final_response = ?");
            values.push(final_response.clone().into());
        }
        values.push(run_id.to_string().into());

        tx.execute(
            &format!("UPDATE runs SET {} WHERE run_id = ?", assignments.join(", ")),
            params_from_iter(values),
        )?;

        let updated = tx.query_row(
            &format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"),
            params![run_id],
            run_from_row,
        )?;
        tx.commit()?;

        if updated.status != current.status {
            info!(run_id, from = %current.status, to = %updated.status, "Run status changed");
        }

        Ok(Some(updated))
    }

    /// Runs that are executing or paused, most recently updated first
    pub fn list_active_runs(&self) -> Result<Vec<Run>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs
             WHERE status IN (?1, ?2)
             ORDER BY updated_at DESC, rowid DESC"
        ))?;
        let runs = stmt
            .query_map(params![RunStatus::Executing, RunStatus::Paused], run_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    /// Runs matching `filter`, most recently updated first
    pub fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let mut sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE 1 = 1");
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            values.push(status.as_str().to_string().into());
        }
        if let Some(user_id) = &filter.user_id {
            sql.push_str(" AND user_id = ?");
            values.push(user_id.clone().into());
        }
        sql.push_str(" ORDER BY updated_at DESC, rowid DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            values.push(i64::try_from(limit).unwrap_or(i64::MAX).into());
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let runs = stmt
            .query_map(params_from_iter(values), run_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }
}
