//! Sync Queue Integration Tests
//!
//! Retry accounting, backoff eligibility and audit retention for the outbox.

use chrono::Utc;
use runstore::domain::{ACTION_RUN_UPDATED, ACTION_STEP_RESULT};
use runstore::{StateStore, StoreSettings, SyncRequest, SyncStatus};
use serde_json::json;
use tempfile::TempDir;

fn open(temp: &TempDir) -> StateStore {
    let store = StateStore::open(temp.path().join("state.db"), &StoreSettings::default()).unwrap();
    store
        .create_run("run-1", &json!({ "plan_id": "p", "steps": [{}] }))
        .unwrap();
    store
}

#[test]
fn test_gives_up_after_max_attempts() {
    let temp = TempDir::new().unwrap();
    let store = open(&temp);
    let item = store
        .queue_sync(&SyncRequest::new("run-1", ACTION_RUN_UPDATED, json!({ "status": "paused" })))
        .unwrap();
    assert_eq!(item.max_attempts, 3);

    let expected = [SyncStatus::Pending, SyncStatus::Pending, SyncStatus::Failed];
    for (attempt, status) in expected.into_iter().enumerate() {
        let updated = store
            .mark_sync_failed(item.queue_id, "connection refused", 0)
            .unwrap()
            .unwrap();
        assert_eq!(updated.attempts as usize, attempt + 1);
        assert_eq!(updated.status, status);
        assert_eq!(updated.error.as_deref(), Some("connection refused"));
    }

    assert!(store.get_pending_syncs(10).unwrap().is_empty());
    // Failed items stay for audit
    let kept = store.get_sync_item(item.queue_id).unwrap().unwrap();
    assert_eq!(kept.status, SyncStatus::Failed);
}

#[test]
fn test_backoff_hides_item_until_due() {
    let temp = TempDir::new().unwrap();
    let store = open(&temp);
    let item = store
        .queue_sync(&SyncRequest::new("run-1", ACTION_STEP_RESULT, json!({ "step_index": 0 })))
        .unwrap();

    let delayed = store
        .mark_sync_failed(item.queue_id, "503", 60_000)
        .unwrap()
        .unwrap();
    assert_eq!(delayed.status, SyncStatus::Pending);
    assert!(delayed.next_retry_at.is_some());
    assert!(!delayed.is_due(Utc::now()));
    assert!(store.get_pending_syncs(10).unwrap().is_empty());

    // A zero delay makes it eligible again immediately
    store.mark_sync_failed(item.queue_id, "503", 0).unwrap();
    let due = store.get_pending_syncs(10).unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].attempts, 2);
    assert_eq!(due[0].step_index, Some(0));
    assert!(due[0].is_due(Utc::now()));
}

#[test]
fn test_drain_loop() {
    let temp = TempDir::new().unwrap();
    let store = open(&temp);
    for index in 0..4 {
        store
            .queue_sync(&SyncRequest::new(
                "run-1",
                ACTION_STEP_RESULT,
                json!({ "step_index": index }),
            ))
            .unwrap();
    }

    let mut keys = Vec::new();
    loop {
        let batch = store.get_pending_syncs(3).unwrap();
        if batch.is_empty() {
            break;
        }
        for item in batch {
            keys.push(item.idempotency_key());
            store.mark_sync_completed(item.queue_id).unwrap();
        }
    }

    assert_eq!(keys.len(), 4);
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), 4);
    assert_eq!(store.list_sync_items("run-1").unwrap().len(), 4);
    assert_eq!(store.get_stats().unwrap().sync_queue.completed, 4);
}

#[test]
fn test_configured_defaults_apply() {
    let temp = TempDir::new().unwrap();
    let settings = StoreSettings {
        max_sync_attempts: 1,
        default_priority: 2,
        ..StoreSettings::default()
    };
    let store = StateStore::open(temp.path().join("state.db"), &settings).unwrap();
    store
        .create_run("run-1", &json!({ "plan_id": "p", "steps": [] }))
        .unwrap();

    let item = store
        .queue_sync(&SyncRequest::new("run-1", ACTION_RUN_UPDATED, json!({})))
        .unwrap();
    assert_eq!(item.priority, 2);
    assert_eq!(item.max_attempts, 1);

    let failed = store
        .mark_sync_failed_default(item.queue_id, "boom")
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, SyncStatus::Failed);
}
