//! Domain types for the run store.
//!
//! This module contains the persisted entities:
//! - Run: one execution of a plan
//! - Step: one ordered unit of work within a run
//! - StepResult: append-only outcome of an execution attempt
//! - SyncQueueItem: outbox entry awaiting replay

pub mod result;
pub mod run;
pub mod stats;
pub mod step;
pub mod sync;

// Re-export commonly used types
pub use result::{StepOutcome, StepResult};
pub use run::{Plan, Run, RunFilter, RunStatus, RunUpdate};
pub use stats::{RunCounts, StepCounts, StoreStats, SyncCounts};
pub use step::{derive_step_id, Step, StepStatus, StepTimestamps};
pub use sync::{
    idempotency_key, SyncQueueItem, SyncRequest, SyncStatus, ACTION_RUN_CREATED,
    ACTION_RUN_UPDATED, ACTION_STEP_RESULT, ACTION_STEP_UPDATED, DEFAULT_PRIORITY,
};
