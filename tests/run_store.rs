//! Run Store Integration Tests
//!
//! Runs survive a reopen, keep their plan document intact and follow the
//! status lifecycle.

use chrono::Utc;
use runstore::{RunStatus, RunUpdate, StateStore, StoreError, StoreSettings};
use serde_json::json;
use tempfile::TempDir;

fn open(temp: &TempDir) -> StateStore {
    StateStore::open(temp.path().join("state.db"), &StoreSettings::default()).unwrap()
}

#[test]
fn test_run_survives_reopen() {
    let temp = TempDir::new().unwrap();
    let plan = json!({
        "plan_id": "plan-42",
        "user_id": "user-1",
        "message": "tidy the downloads folder",
        "steps": [
            { "tool": "shell", "args": { "cmd": "ls ~/Downloads" } },
            { "tool": "shell", "args": { "cmd": "rm ~/Downloads/*.tmp" } },
            { "tool": "reply", "text": "done" }
        ],
        "extra": { "nested": [1, 2, 3], "flag": null }
    });

    {
        let store = open(&temp);
        store.create_run("run-1", &plan).unwrap();
        store
            .update_run(
                "run-1",
                RunUpdate::cursor(1).with_metadata(json!({ "host": "laptop" })),
            )
            .unwrap();
        store.close().unwrap();
    }

    // Simulated crash: a fresh store over the same file
    let store = open(&temp);
    let run = store.get_run("run-1").unwrap().unwrap();

    assert_eq!(run.plan, plan);
    assert_eq!(run.plan_id, "plan-42");
    assert_eq!(run.user_id.as_deref(), Some("user-1"));
    assert_eq!(run.message.as_deref(), Some("tidy the downloads folder"));
    assert_eq!(run.total_steps, 3);
    assert_eq!(run.current_step_index, 1);
    assert_eq!(run.status, RunStatus::Executing);
    assert_eq!(run.metadata, Some(json!({ "host": "laptop" })));
    assert!(run.completed_at.is_none());
}

#[test]
fn test_full_lifecycle() {
    let temp = TempDir::new().unwrap();
    let store = open(&temp);
    store
        .create_run("run-1", &json!({ "plan_id": "p", "steps": [{}] }))
        .unwrap();

    let paused = store
        .update_run("run-1", RunUpdate::status(RunStatus::Paused))
        .unwrap()
        .unwrap();
    assert!(paused.is_active());
    assert!(paused.completed_at.is_none());

    let resumed = store
        .update_run("run-1", RunUpdate::status(RunStatus::Executing))
        .unwrap()
        .unwrap();
    assert_eq!(resumed.status, RunStatus::Executing);

    let finished_at = Utc::now();
    let done = store
        .update_run(
            "run-1",
            RunUpdate::status(RunStatus::Complete)
                .with_completed_at(finished_at)
                .with_final_response("all good"),
        )
        .unwrap()
        .unwrap();
    assert!(done.is_finished());
    assert_eq!(
        done.completed_at.map(|t| t.timestamp_millis()),
        Some(finished_at.timestamp_millis())
    );
    assert_eq!(done.final_response.as_deref(), Some("all good"));

    // Terminal runs are not reopened
    let err = store
        .update_run("run-1", RunUpdate::status(RunStatus::Executing))
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidRunTransition { .. }));
    assert!(store.list_active_runs().unwrap().is_empty());
}

#[test]
fn test_duplicate_run_id_is_constraint_error() {
    let temp = TempDir::new().unwrap();
    let store = open(&temp);
    let plan = json!({ "plan_id": "p", "steps": [] });

    store.create_run("run-1", &plan).unwrap();
    let err = store.create_run("run-1", &plan).unwrap_err();

    assert!(err.is_constraint(), "unexpected error: {err}");
}

#[test]
fn test_update_unknown_run_is_none() {
    let temp = TempDir::new().unwrap();
    let store = open(&temp);

    assert!(store.get_run("missing").unwrap().is_none());
    assert!(store
        .update_run("missing", RunUpdate::cursor(3))
        .unwrap()
        .is_none());
}
