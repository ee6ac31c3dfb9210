//! Maintenance Integration Tests
//!
//! Retention cleanup removes old terminal runs with everything they own and
//! leaves active runs alone.

use chrono::{Duration, Utc};
use runstore::{
    RunStatus, RunUpdate, StateStore, StepOutcome, StepStatus, StepTimestamps, StoreSettings,
    SyncRequest,
};
use serde_json::json;
use tempfile::TempDir;

fn open(temp: &TempDir) -> StateStore {
    StateStore::open(temp.path().join("state.db"), &StoreSettings::default()).unwrap()
}

/// A run with one step, one result and one queue item
fn seed_run(store: &StateStore, run_id: &str) {
    store
        .create_run(run_id, &json!({ "plan_id": "p", "steps": [{}] }))
        .unwrap();
    let step = store.save_step(run_id, 0, &json!({})).unwrap();
    store
        .save_step_result(&step.step_id, run_id, 0, &StepOutcome::success("ok"))
        .unwrap();
    store
        .queue_sync(&SyncRequest::new(run_id, "step_result", json!({ "step_index": 0 })))
        .unwrap();
}

#[test]
fn test_cleanup_removes_old_terminal_runs() {
    let temp = TempDir::new().unwrap();
    let store = open(&temp);
    seed_run(&store, "old");
    seed_run(&store, "live");

    store
        .update_run(
            "old",
            RunUpdate::status(RunStatus::Complete).with_completed_at(Utc::now() - Duration::days(10)),
        )
        .unwrap();

    let removed = store.cleanup(7).unwrap();
    assert_eq!(removed, 1);

    assert!(store.get_run("old").unwrap().is_none());
    assert!(store.list_steps("old").unwrap().is_empty());
    assert!(store.list_sync_items("old").unwrap().is_empty());
    assert!(store.get_unsynced_results(Some("old")).unwrap().is_empty());

    // Executing runs are never removed
    assert!(store.get_run("live").unwrap().is_some());
    assert_eq!(store.list_steps("live").unwrap().len(), 1);
    assert_eq!(store.list_sync_items("live").unwrap().len(), 1);
    assert_eq!(store.get_unsynced_results(Some("live")).unwrap().len(), 1);
}

#[test]
fn test_cleanup_ignores_old_active_runs() {
    let temp = TempDir::new().unwrap();
    let store = open(&temp);
    seed_run(&store, "paused");
    store
        .update_run("paused", RunUpdate::status(RunStatus::Paused))
        .unwrap();

    assert_eq!(store.cleanup(0).unwrap(), 0);
    assert!(store.get_run("paused").unwrap().is_some());
}

#[test]
fn test_cleanup_expired_uses_retention_setting() {
    let temp = TempDir::new().unwrap();
    let settings = StoreSettings {
        retention_days: 3,
        ..StoreSettings::default()
    };
    let store = StateStore::open(temp.path().join("state.db"), &settings).unwrap();
    seed_run(&store, "a");
    seed_run(&store, "b");

    let now = Utc::now();
    store
        .update_run(
            "a",
            RunUpdate::status(RunStatus::Failed).with_completed_at(now - Duration::days(4)),
        )
        .unwrap();
    store
        .update_run(
            "b",
            RunUpdate::status(RunStatus::Cancelled).with_completed_at(now - Duration::days(2)),
        )
        .unwrap();

    assert_eq!(store.cleanup_expired().unwrap(), 1);
    assert!(store.get_run("a").unwrap().is_none());
    assert!(store.get_run("b").unwrap().is_some());
}

#[test]
fn test_stats_reflect_activity() {
    let temp = TempDir::new().unwrap();
    let store = open(&temp);
    seed_run(&store, "a");
    seed_run(&store, "b");

    let step = store.list_steps("a").unwrap().remove(0);
    store
        .update_step_status(&step.step_id, StepStatus::Complete, StepTimestamps::default())
        .unwrap();
    let result = store.get_step_result(&step.step_id).unwrap().unwrap();
    store.mark_result_synced(result.result_id).unwrap();
    store
        .update_run("b", RunUpdate::status(RunStatus::Paused))
        .unwrap();

    let stats = store.get_stats().unwrap();
    assert_eq!(stats.runs.executing, 1);
    assert_eq!(stats.runs.paused, 1);
    assert_eq!(stats.runs.active(), 2);
    assert_eq!(stats.steps.complete, 1);
    assert_eq!(stats.steps.pending, 1);
    assert_eq!(stats.sync_queue.pending, 2);
    assert_eq!(stats.unsynced_results, 1);
}
