//! Outbox of changes awaiting replay against the remote backend.
//!
//! Items move pending → completed, or pending → pending (retry with
//! backoff) → … → failed once `attempts` reaches `max_attempts`. Nothing is
//! deleted here; completed and failed items stay for audit.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info, instrument, warn};

use super::{json_column, opt_time_column, time_column, to_millis};
use super::{Result, StateStore, StoreError};
use crate::domain::{SyncQueueItem, SyncRequest, SyncStatus};

const SYNC_COLUMNS: &str = "queue_id, run_id, step_index, action, payload_json, priority,
    status, attempts, max_attempts, created_at, last_attempt_at, next_retry_at, error";

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<SyncQueueItem> {
    Ok(SyncQueueItem {
        queue_id: row.get(0)?,
        run_id: row.get(1)?,
        step_index: row.get(2)?,
        action: row.get(3)?,
        payload: json_column(row, 4)?,
        priority: row.get(5)?,
        status: row.get(6)?,
        attempts: row.get(7)?,
        max_attempts: row.get(8)?,
        created_at: time_column(row, 9)?,
        last_attempt_at: opt_time_column(row, 10)?,
        next_retry_at: opt_time_column(row, 11)?,
        error: row.get(12)?,
    })
}

fn fetch_item(conn: &Connection, queue_id: i64) -> rusqlite::Result<Option<SyncQueueItem>> {
    conn.query_row(
        &format!("SELECT {SYNC_COLUMNS} FROM sync_queue WHERE queue_id = ?1"),
        params![queue_id],
        item_from_row,
    )
    .optional()
}

impl StateStore {
    /// Enqueue a pending replay action.
    ///
    /// Priority and `max_attempts` fall back to the store settings when the
    /// request leaves them unset.
    #[instrument(skip(self, request), fields(run_id = %request.run_id, action = %request.action))]
    pub fn queue_sync(&self, request: &SyncRequest) -> Result<SyncQueueItem> {
        let max_attempts = request
            .max_attempts
            .unwrap_or(self.settings.max_sync_attempts)
            .max(1);
        let priority = request.priority.unwrap_or(self.settings.default_priority);

        self.conn.execute(
            "INSERT INTO sync_queue (
               run_id, step_index, action, payload_json, priority, status, attempts,
               max_attempts, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8)",
            params![
                request.run_id,
                request.step_index(),
                request.action,
                serde_json::to_string(&request.payload)?,
                priority,
                SyncStatus::Pending,
                max_attempts,
                to_millis(Utc::now()),
            ],
        )?;
        let queue_id = self.conn.last_insert_rowid();

        debug!(queue_id, priority, "Sync queued");

        let item = self.conn.query_row(
            &format!("SELECT {SYNC_COLUMNS} FROM sync_queue WHERE queue_id = ?1"),
            params![queue_id],
            item_from_row,
        )?;
        Ok(item)
    }

    /// Up to `limit` pending items whose backoff has elapsed.
    ///
    /// Ordered by priority (lower first), then age (oldest first).
    pub fn get_pending_syncs(&self, limit: usize) -> Result<Vec<SyncQueueItem>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SYNC_COLUMNS} FROM sync_queue
             WHERE status = ?1 AND (next_retry_at IS NULL OR next_retry_at <= ?2)
             ORDER BY priority ASC, created_at ASC, queue_id ASC
             LIMIT ?3"
        ))?;
        let items = stmt
            .query_map(
                params![
                    SyncStatus::Pending,
                    to_millis(Utc::now()),
                    i64::try_from(limit).unwrap_or(i64::MAX),
                ],
                item_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    /// Fetch a queue item, or `None` if the id is unknown
    pub fn get_sync_item(&self, queue_id: i64) -> Result<Option<SyncQueueItem>> {
        Ok(fetch_item(&self.conn, queue_id)?)
    }

    /// Every queue item for a run regardless of status, oldest first
    pub fn list_sync_items(&self, run_id: &str) -> Result<Vec<SyncQueueItem>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SYNC_COLUMNS} FROM sync_queue WHERE run_id = ?1 ORDER BY queue_id ASC"
        ))?;
        let items = stmt
            .query_map(params![run_id], item_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    /// Mark an item replayed. Completing twice is a no-op; completing a
    /// failed item is rejected.
    pub fn mark_sync_completed(&self, queue_id: i64) -> Result<Option<SyncQueueItem>> {
        let tx = self.conn.unchecked_transaction()?;

        let Some(item) = fetch_item(&tx, queue_id)? else {
            return Ok(None);
        };

        match item.status {
            SyncStatus::Completed => return Ok(Some(item)),
            SyncStatus::Failed => {
                return Err(StoreError::InvalidSyncTransition {
                    queue_id,
                    status: item.status,
                    action: "completed",
                })
            }
            SyncStatus::Pending => {}
        }

        tx.execute(
            "UPDATE sync_queue SET status = ?1, last_attempt_at = ?2, error = NULL
             WHERE queue_id = ?3",
            params![SyncStatus::Completed, to_millis(Utc::now()), queue_id],
        )?;
        let updated = fetch_item(&tx, queue_id)?;
        tx.commit()?;

        debug!(queue_id, "Sync completed");
        Ok(updated)
    }

    /// Record a failed replay attempt.
    ///
    /// Increments `attempts` and pushes `next_retry_at` to now +
    /// `retry_delay_ms`. The item becomes `failed` once `attempts` reaches
    /// `max_attempts`; otherwise it stays `pending`. Backoff growth is up to
    /// the caller, which passes the delay on every failure.
    #[instrument(skip(self, error))]
    pub fn mark_sync_failed(
        &self,
        queue_id: i64,
        error: &str,
        retry_delay_ms: u64,
    ) -> Result<Option<SyncQueueItem>> {
        let tx = self.conn.unchecked_transaction()?;

        let Some(item) = fetch_item(&tx, queue_id)? else {
            return Ok(None);
        };

        if item.status != SyncStatus::Pending {
            return Err(StoreError::InvalidSyncTransition {
                queue_id,
                status: item.status,
                action: "retried",
            });
        }

        let now = Utc::now();
        let delay = Duration::milliseconds(i64::try_from(retry_delay_ms).unwrap_or(i64::MAX));
        // Delays past the calendar range never become due
        let next_retry_at = now
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let attempts = item.attempts.saturating_add(1);
        let status = if attempts >= item.max_attempts {
            SyncStatus::Failed
        } else {
            SyncStatus::Pending
        };

        tx.execute(
            "UPDATE sync_queue
             SET attempts = ?1, status = ?2, last_attempt_at = ?3, next_retry_at = ?4, error = ?5
             WHERE queue_id = ?6",
            params![
                attempts,
                status,
                to_millis(now),
                to_millis(next_retry_at),
                error,
                queue_id,
            ],
        )?;
        let updated = fetch_item(&tx, queue_id)?;
        tx.commit()?;

        if status == SyncStatus::Failed {
            warn!(queue_id, attempts, error, "Sync gave up after max attempts");
        } else {
            info!(queue_id, attempts, retry_delay_ms, "Sync rescheduled");
        }

        Ok(updated)
    }

    /// Record a failed attempt using the configured default delay
    pub fn mark_sync_failed_default(
        &self,
        queue_id: i64,
        error: &str,
    ) -> Result<Option<SyncQueueItem>> {
        self.mark_sync_failed(queue_id, error, self.settings.retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ACTION_RUN_CREATED, ACTION_STEP_RESULT};
    use crate::store::test_support::create_test_store;
    use serde_json::json;

    fn seed(store: &StateStore) {
        store
            .create_run("r1", &json!({ "plan_id": "p", "steps": [] }))
            .unwrap();
    }

    #[test]
    fn test_queue_extracts_step_index() {
        let (store, _temp) = create_test_store();
        seed(&store);

        let item = store
            .queue_sync(&SyncRequest::new(
                "r1",
                ACTION_STEP_RESULT,
                json!({ "step_index": 2, "success": true }),
            ))
            .unwrap();

        assert_eq!(item.step_index, Some(2));
        assert_eq!(item.status, SyncStatus::Pending);
        assert_eq!(item.attempts, 0);
        assert_eq!(item.max_attempts, 3);
        assert_eq!(item.priority, 5);
        assert!(item.next_retry_at.is_none());
    }

    #[test]
    fn test_pending_order_priority_then_age() {
        let (store, _temp) = create_test_store();
        seed(&store);

        let low = store
            .queue_sync(&SyncRequest::new("r1", "a", json!({})).with_priority(9))
            .unwrap();
        let first_urgent = store
            .queue_sync(&SyncRequest::new("r1", "b", json!({})).with_priority(1))
            .unwrap();
        let second_urgent = store
            .queue_sync(&SyncRequest::new("r1", "c", json!({})).with_priority(1))
            .unwrap();

        let ids: Vec<i64> = store
            .get_pending_syncs(10)
            .unwrap()
            .into_iter()
            .map(|item| item.queue_id)
            .collect();
        assert_eq!(
            ids,
            vec![first_urgent.queue_id, second_urgent.queue_id, low.queue_id]
        );

        assert_eq!(store.get_pending_syncs(2).unwrap().len(), 2);
    }

    #[test]
    fn test_completed_is_terminal_and_retained() {
        let (store, _temp) = create_test_store();
        seed(&store);
        let item = store
            .queue_sync(&SyncRequest::new("r1", ACTION_RUN_CREATED, json!({})))
            .unwrap();

        let done = store.mark_sync_completed(item.queue_id).unwrap().unwrap();
        assert_eq!(done.status, SyncStatus::Completed);

        // Completing again is a no-op, the row stays for audit
        assert!(store.mark_sync_completed(item.queue_id).unwrap().is_some());
        assert!(store.get_pending_syncs(10).unwrap().is_empty());
        assert_eq!(store.list_sync_items("r1").unwrap().len(), 1);

        let err = store
            .mark_sync_failed(item.queue_id, "late failure", 0)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidSyncTransition { .. }));
    }

    #[test]
    fn test_unknown_item_is_none() {
        let (store, _temp) = create_test_store();

        assert!(store.mark_sync_completed(42).unwrap().is_none());
        assert!(store.mark_sync_failed(42, "boom", 0).unwrap().is_none());
    }

    #[test]
    fn test_huge_delay_keeps_item_backed_off() {
        let (store, _temp) = create_test_store();
        seed(&store);
        let item = store
            .queue_sync(&SyncRequest::new("r1", "a", json!({})))
            .unwrap();

        let delayed = store
            .mark_sync_failed(item.queue_id, "e", u64::MAX)
            .unwrap()
            .unwrap();

        assert_eq!(delayed.status, SyncStatus::Pending);
        assert!(delayed.next_retry_at.unwrap() > Utc::now());
        assert!(store.get_pending_syncs(10).unwrap().is_empty());
    }

    #[test]
    fn test_max_attempts_override() {
        let (store, _temp) = create_test_store();
        seed(&store);
        let item = store
            .queue_sync(&SyncRequest::new("r1", "a", json!({})).with_max_attempts(1))
            .unwrap();

        let failed = store
            .mark_sync_failed(item.queue_id, "boom", 0)
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, SyncStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }
}
