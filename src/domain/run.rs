//! Runs and the plan documents they execute.
//!
//! A Run represents a single execution of a multi-step plan.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::StoreError;

/// A plan document as handed over by the planner.
///
/// The document is stored verbatim. Only the fields the store relies on
/// (`plan_id`/`id`, `steps`, and optionally `user_id`/`message`) are checked,
/// everything else is opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Plan(Value);

impl Plan {
    /// Validate the shape of a plan document
    pub fn parse(document: Value) -> Result<Self, StoreError> {
        let object = document
            .as_object()
            .ok_or_else(|| StoreError::InvalidPlan("plan must be a JSON object".to_string()))?;

        match object.get("steps") {
            Some(Value::Array(_)) => {}
            Some(_) => {
                return Err(StoreError::InvalidPlan(
                    "`steps` must be an array".to_string(),
                ))
            }
            None => return Err(StoreError::InvalidPlan("missing `steps`".to_string())),
        }

        let has_id = ["plan_id", "id"]
            .iter()
            .any(|key| matches!(object.get(*key), Some(Value::String(s)) if !s.is_empty()));
        if !has_id {
            return Err(StoreError::InvalidPlan(
                "missing `plan_id` (or `id`)".to_string(),
            ));
        }

        Ok(Self(document))
    }

    /// Plan identifier (`plan_id`, falling back to `id`)
    pub fn plan_id(&self) -> &str {
        self.str_field("plan_id")
            .or_else(|| self.str_field("id"))
            .unwrap_or_default()
    }

    /// The step payloads, in plan order
    pub fn steps(&self) -> &[Value] {
        self.0
            .get("steps")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Number of steps in the plan
    pub fn step_count(&self) -> usize {
        self.steps().len()
    }

    /// User the plan was created for (if recorded)
    pub fn user_id(&self) -> Option<&str> {
        self.str_field("user_id")
    }

    /// Originating instruction (if recorded)
    pub fn message(&self) -> Option<&str> {
        self.str_field("message")
    }

    /// The raw document
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }
}

/// A persisted plan execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Caller-supplied unique identifier
    pub run_id: String,

    /// Identifier of the plan being executed
    pub plan_id: String,

    pub user_id: Option<String>,

    /// Instruction the plan was generated from
    pub message: Option<String>,

    /// Current lifecycle status
    pub status: RunStatus,

    /// Number of steps in the plan (fixed at creation)
    pub total_steps: u32,

    /// Cursor maintained by the orchestrator
    pub current_step_index: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Set only once the run reaches a terminal status
    pub completed_at: Option<DateTime<Utc>>,

    /// Terminal summary text
    pub final_response: Option<String>,

    /// The full plan document (immutable after creation)
    pub plan: Value,

    /// Free-form caller metadata (replaced wholesale on update)
    pub metadata: Option<Value>,

    /// Sync bookkeeping owned by the sync worker
    pub sync_status: String,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Check if the run is executing or paused
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Check if the run reached a terminal status
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Steps are being executed
    Executing,

    /// Suspended by the orchestrator (can be resumed)
    Paused,

    /// Finished successfully
    Complete,

    /// Finished with an error
    Failed,

    /// Stopped on request
    Cancelled,
}

impl RunStatus {
    pub const ALL: [RunStatus; 5] = [
        Self::Executing,
        Self::Paused,
        Self::Complete,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Executing => "executing",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Executing
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown run status: {s}"))
    }
}

impl ToSql for RunStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for RunStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// Partial update applied by `update_run`.
///
/// Only fields set to `Some` are written; `updated_at` is always refreshed.
#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub current_step_index: Option<u32>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: Option<Value>,
    pub sync_status: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub final_response: Option<String>,
}

impl RunUpdate {
    /// Update that only changes the status
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Update that only advances the step cursor
    pub fn cursor(current_step_index: u32) -> Self {
        Self {
            current_step_index: Some(current_step_index),
            ..Self::default()
        }
    }

    pub fn with_completed_at(mut self, completed_at: DateTime<Utc>) -> Self {
        self.completed_at = Some(completed_at);
        self
    }

    pub fn with_final_response(mut self, final_response: impl Into<String>) -> Self {
        self.final_response = Some(final_response.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Filters for `list_runs`
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub user_id: Option<String>,
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plan_accepts_id_fallback() {
        let plan = Plan::parse(json!({ "id": "plan-7", "steps": [{}, {}] })).unwrap();

        assert_eq!(plan.plan_id(), "plan-7");
        assert_eq!(plan.step_count(), 2);
        assert!(plan.user_id().is_none());
    }

    #[test]
    fn test_plan_rejects_bad_shapes() {
        assert!(Plan::parse(json!([1, 2])).is_err());
        assert!(Plan::parse(json!({ "plan_id": "p" })).is_err());
        assert!(Plan::parse(json!({ "plan_id": "p", "steps": 3 })).is_err());
        assert!(Plan::parse(json!({ "steps": [] })).is_err());
        assert!(Plan::parse(json!({ "plan_id": "", "steps": [] })).is_err());
    }

    #[test]
    fn test_run_status_round_trip() {
        for status in RunStatus::ALL {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("done".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!RunStatus::Executing.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
        assert!(RunStatus::Complete.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }
}
