//! Steps belonging to a run.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One unit of work within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Stable identifier, see [`derive_step_id`]
    pub step_id: String,

    pub run_id: String,

    /// 0-based position within the run
    pub step_index: u32,

    pub status: StepStatus,

    /// The step's action description (opaque)
    pub payload: Value,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Deterministic step identifier for `(run_id, step_index)`.
///
/// Re-submitting the same step always lands on the same row.
pub fn derive_step_id(run_id: &str, step_index: u32) -> String {
    format!("{}_step_{}", run_id, step_index)
}

/// Status of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet started
    Pending,

    /// Currently executing
    Running,

    /// Completed successfully
    Complete,

    /// Failed (after the orchestrator gave up retrying)
    Failed,
}

impl StepStatus {
    pub const ALL: [StepStatus; 4] = [Self::Pending, Self::Running, Self::Complete, Self::Failed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Complete | Self::Failed => 2,
        }
    }

    /// Steps only move forward: pending → running → complete | failed.
    ///
    /// Re-applying the current status is allowed.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        if *self == next {
            return true;
        }
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown step status: {s}"))
    }
}

impl ToSql for StepStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for StepStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// Timestamps recorded alongside a status change
#[derive(Debug, Clone, Copy, Default)]
pub struct StepTimestamps {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_id_is_deterministic() {
        assert_eq!(derive_step_id("run-1", 3), derive_step_id("run-1", 3));
        assert_ne!(derive_step_id("run-1", 3), derive_step_id("run-1", 4));
        assert_eq!(derive_step_id("run-1", 0), "run-1_step_0");
    }

    #[test]
    fn test_forward_only_transitions() {
        use StepStatus::*;

        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Complete));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Running));

        assert!(!Running.can_transition_to(Pending));
        assert!(!Complete.can_transition_to(Running));
        assert!(!Complete.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Pending));
    }
}
