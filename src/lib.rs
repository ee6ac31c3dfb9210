//! runstore - Local-first durable execution state store
//!
//! Persists the state of multi-step agent runs in a single SQLite file so
//! that execution survives process crashes and can resume from the last
//! completed step.
//!
//! # Architecture
//!
//! - A run is created from a plan document and moves through
//!   executing / paused to a terminal status (complete, failed, cancelled)
//! - Steps are keyed by `(run_id, step_index)` and consumed in index order
//! - Every execution attempt is appended to the step result log
//! - Changes destined for the remote backend go through an outbox
//!   (the sync queue) with bounded retries and backoff
//!
//! # Modules
//!
//! - `domain`: Data structures (Run, Step, StepResult, SyncQueueItem)
//! - `store`: SQLite-backed `StateStore` (schema, migrations, operations)
//! - `config`: Path and settings resolution
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Seed a run from a plan file
//! runstore create plan.json
//!
//! # Check run status
//! runstore status <run-id>
//!
//! # Inspect the outbox
//! runstore queue
//! ```

pub mod cli;
pub mod config;
pub mod domain;
pub mod store;

// Re-export main types at crate root for convenience
pub use domain::{
    Plan, Run, RunFilter, RunStatus, RunUpdate, Step, StepOutcome, StepResult, StepStatus,
    StepTimestamps, StoreStats, SyncQueueItem, SyncRequest, SyncStatus,
};
pub use store::{StateStore, StoreError, StoreSettings};
