//! Outcomes of step execution attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome reported by the orchestrator for one execution attempt.
///
/// `attempts` is taken as-is: the orchestrator owns retry policy and is the
/// source of truth for attempt counting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub success: bool,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,

    /// Attempt counter at the time of this result
    pub attempts: u32,

    pub execution_time_ms: Option<u64>,
}

impl StepOutcome {
    /// Successful attempt with captured stdout
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: Some(stdout.into()),
            exit_code: Some(0),
            attempts: 1,
            ..Self::default()
        }
    }

    /// Failed attempt with an error message
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = Some(stderr.into());
        self
    }

    pub fn with_duration(mut self, execution_time_ms: u64) -> Self {
        self.execution_time_ms = Some(execution_time_ms);
        self
    }
}

/// Append-only record of one execution attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub result_id: i64,
    pub step_id: String,
    pub run_id: String,
    pub step_index: u32,

    #[serde(flatten)]
    pub outcome: StepOutcome,

    pub created_at: DateTime<Utc>,

    /// Set by the sync worker once the result was uploaded
    pub synced_to_cloud: bool,
    pub synced_at: Option<DateTime<Utc>>,
}
