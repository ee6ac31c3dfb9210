//! Outbox entries awaiting replay against the remote backend.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// A run was created
pub const ACTION_RUN_CREATED: &str = "run_created";

/// Run fields changed (status, cursor, metadata)
pub const ACTION_RUN_UPDATED: &str = "run_updated";

/// A step changed status
pub const ACTION_STEP_UPDATED: &str = "step_updated";

/// A step result was recorded
pub const ACTION_STEP_RESULT: &str = "step_result";

/// Default priority for new queue items (lower = more urgent)
pub const DEFAULT_PRIORITY: i32 = 5;

/// A pending replay action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub queue_id: i64,
    pub run_id: String,

    /// Extracted from `payload.step_index` when present
    pub step_index: Option<u32>,

    /// Tag identifying what must be replayed
    pub action: String,

    pub payload: Value,

    /// Lower is more urgent
    pub priority: i32,

    pub status: SyncStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// Not eligible for replay before this instant
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Last failure reported by the sync worker
    pub error: Option<String>,
}

impl SyncQueueItem {
    /// Key the remote side can use to deduplicate replays.
    ///
    /// Format: `{run_id}:{action}:{payload_hash}`. Stable across retries of
    /// the same item and across re-enqueues of an identical change.
    pub fn idempotency_key(&self) -> String {
        idempotency_key(&self.run_id, &self.action, &self.payload)
    }

    /// Whether the item may be handed to the drain loop at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == SyncStatus::Pending && self.next_retry_at.map_or(true, |at| at <= now)
    }
}

/// Build the deduplication key for a change
pub fn idempotency_key(run_id: &str, action: &str, payload: &Value) -> String {
    format!("{}:{}:{}", run_id, action, hash_payload(payload))
}

/// Hash a payload document (first 16 hex chars of SHA256)
pub fn hash_payload(payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

/// Status of a queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Waiting for (re)play
    Pending,

    /// Replayed successfully (terminal)
    Completed,

    /// Gave up after `max_attempts` (terminal)
    Failed,
}

impl SyncStatus {
    pub const ALL: [SyncStatus; 3] = [Self::Pending, Self::Completed, Self::Failed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown sync status: {s}"))
    }
}

impl ToSql for SyncStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for SyncStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// A change to enqueue for replay
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub run_id: String,
    pub action: String,
    pub payload: Value,

    /// Lower is more urgent; falls back to the store's configured default
    pub priority: Option<i32>,

    /// Falls back to the store's configured default when unset
    pub max_attempts: Option<u32>,
}

impl SyncRequest {
    pub fn new(run_id: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self {
            run_id: run_id.into(),
            action: action.into(),
            payload,
            priority: None,
            max_attempts: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// `payload.step_index`, if it is a non-negative integer
    pub fn step_index(&self) -> Option<u32> {
        self.payload
            .get("step_index")
            .and_then(Value::as_u64)
            .and_then(|index| u32::try_from(index).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_index_extraction() {
        let with_index = SyncRequest::new("r", ACTION_STEP_RESULT, json!({ "step_index": 4 }));
        let without = SyncRequest::new("r", ACTION_RUN_UPDATED, json!({ "status": "paused" }));
        let negative = SyncRequest::new("r", ACTION_STEP_UPDATED, json!({ "step_index": -1 }));

        assert_eq!(with_index.step_index(), Some(4));
        assert_eq!(without.step_index(), None);
        assert_eq!(negative.step_index(), None);
        assert!(with_index.priority.is_none());
    }

    #[test]
    fn test_idempotency_key_format() {
        let payload = json!({ "step_index": 1, "status": "complete" });
        let key = idempotency_key("run-1", ACTION_STEP_UPDATED, &payload);

        // Format: {run_id}:{action}:{hash16}
        let parts: Vec<&str> = key.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "run-1");
        assert_eq!(parts[1], ACTION_STEP_UPDATED);
        assert_eq!(parts[2].len(), 16);

        assert_eq!(key, idempotency_key("run-1", ACTION_STEP_UPDATED, &payload));
        assert_ne!(
            key,
            idempotency_key("run-1", ACTION_STEP_UPDATED, &json!({ "step_index": 2 }))
        );
    }
}
