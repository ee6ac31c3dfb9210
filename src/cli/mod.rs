//! Command-line interface for runstore.
//!
//! Operator commands for seeding runs from a plan file, inspecting runs,
//! steps, results and the sync queue, cancelling runs and running cleanup.

use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config;
use crate::domain::{
    idempotency_key, Plan, Run, RunFilter, RunStatus, RunUpdate, SyncRequest,
    ACTION_RUN_CREATED, ACTION_RUN_UPDATED,
};
use crate::store::StateStore;

/// runstore - Local-first durable execution state for agent runs
#[derive(Parser, Debug)]
#[command(name = "runstore")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Database file (overrides config)
    #[arg(long, global = true, env = "RUNSTORE_DB")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a run and its steps from a plan JSON file
    Create {
        /// Plan file ("-" reads from stdin)
        plan: PathBuf,

        /// Run ID (generated if not provided)
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Show a run
    Status {
        run_id: String,
    },

    /// List runs
    Runs {
        /// Only runs in this status
        #[arg(short, long)]
        status: Option<RunStatus>,

        /// Only runs owned by this user
        #[arg(short, long)]
        user: Option<String>,

        /// Maximum number of runs to show
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Only executing or paused runs
        #[arg(long, conflicts_with = "status")]
        active: bool,
    },

    /// List the steps of a run
    Steps {
        run_id: String,
    },

    /// List step results of a run
    Results {
        run_id: String,

        /// Only results not yet uploaded
        #[arg(long)]
        unsynced: bool,
    },

    /// Cancel a run
    Cancel {
        run_id: String,
    },

    /// Show sync items awaiting replay
    Queue {
        /// Maximum number of items to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show store statistics
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete finished runs older than the retention window
    Cleanup {
        /// Retention in days (defaults to the configured value)
        #[arg(short, long)]
        days: Option<u32>,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub fn execute(self) -> Result<()> {
        // Config does not need the database
        if let Commands::Config = self.command {
            return show_config();
        }

        let store = open_store(self.db.as_deref())?;
        match self.command {
            Commands::Create { plan, run_id } => create_run(&store, &plan, run_id)?,
            Commands::Status { run_id } => show_status(&store, &run_id)?,
            Commands::Runs {
                status,
                user,
                limit,
                active,
            } => list_runs(&store, status, user, limit, active)?,
            Commands::Steps { run_id } => list_steps(&store, &run_id)?,
            Commands::Results { run_id, unsynced } => list_results(&store, &run_id, unsynced)?,
            Commands::Cancel { run_id } => cancel_run(&store, &run_id)?,
            Commands::Queue { limit } => show_queue(&store, limit)?,
            Commands::Stats { json } => show_stats(&store, json)?,
            Commands::Cleanup { days } => cleanup(&store, days)?,
            Commands::Config => {}
        }
        store.close()?;
        Ok(())
    }
}

/// Open the store at `--db` or the configured location
fn open_store(db: Option<&Path>) -> Result<StateStore> {
    match db {
        Some(path) => {
            let cfg = config::config()?;
            StateStore::open(path, &cfg.store)
                .with_context(|| format!("Failed to open state store at {}", path.display()))
        }
        None => StateStore::open_default(),
    }
}

/// Read a plan document from a file or stdin
fn read_plan(path: &Path) -> Result<Value> {
    let content = if path == Path::new("-") {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        buffer
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file: {}", path.display()))?
    };

    serde_json::from_str(&content).context("Plan is not valid JSON")
}

/// Create a run, save each plan step and queue the creation for replay
fn create_run(store: &StateStore, plan_path: &Path, run_id: Option<String>) -> Result<()> {
    let document = read_plan(plan_path)?;
    let plan = Plan::parse(document)?;
    let run_id = run_id.unwrap_or_else(|| Uuid::new_v4().to_string());

    let run = store.create_run(&run_id, plan.as_value())?;
    for (index, step) in plan.steps().iter().enumerate() {
        let index = u32::try_from(index).context("Too many steps in plan")?;
        store.save_step(&run_id, index, step)?;
    }

    let request = SyncRequest::new(
        &run_id,
        ACTION_RUN_CREATED,
        json!({ "plan_id": run.plan_id, "total_steps": run.total_steps }),
    );
    let item = store.queue_sync(&request)?;

    println!("Created run {}", run.run_id);
    println!("  Plan:  {}", run.plan_id);
    println!("  Steps: {}", run.total_steps);
    println!("  Sync:  {}", item.idempotency_key());

    Ok(())
}

/// Check the status of a run
fn show_status(store: &StateStore, run_id: &str) -> Result<()> {
    let run = store
        .get_run(run_id)?
        .with_context(|| format!("Run not found: {}", run_id))?;

    println!("Run ID: {}", run.run_id);
    println!("Plan: {}", run.plan_id);
    if let Some(ref user) = run.user_id {
        println!("User: {}", user);
    }
    if let Some(ref message) = run.message {
        println!("Message: {}", message);
    }
    println!("Status: {}", run.status);
    println!("Progress: {}/{}", run.current_step_index, run.total_steps);
    println!("Created: {}", run.created_at);
    println!("Updated: {}", run.updated_at);
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed);
    }
    if let Some(ref response) = run.final_response {
        println!("\nFinal response:\n{}", response);
    }

    if let Some(next) = store.get_next_pending_step(run_id)? {
        println!("\nNext step: {} ({})", next.step_index, next.step_id);
    }

    Ok(())
}

/// List runs matching the filters
fn list_runs(
    store: &StateStore,
    status: Option<RunStatus>,
    user_id: Option<String>,
    limit: usize,
    active: bool,
) -> Result<()> {
    let runs: Vec<Run> = if active {
        store
            .list_active_runs()?
            .into_iter()
            .filter(|run| user_id.as_ref().map_or(true, |u| run.user_id.as_ref() == Some(u)))
            .take(limit)
            .collect()
    } else {
        store.list_runs(&RunFilter {
            status,
            user_id,
            limit: Some(limit),
        })?
    };

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<20} {:<10} {:<8}", "RUN ID", "PLAN", "STATUS", "STEP");
    println!("{}", "-".repeat(80));

    for run in runs {
        println!(
            "{:<38} {:<20} {:<10} {}/{}",
            run.run_id,
            truncate(&run.plan_id, 20),
            run.status,
            run.current_step_index,
            run.total_steps
        );
    }

    Ok(())
}

/// List the steps of a run
fn list_steps(store: &StateStore, run_id: &str) -> Result<()> {
    let steps = store.list_steps(run_id)?;

    if steps.is_empty() {
        println!("No steps for run {}", run_id);
        return Ok(());
    }

    println!("{:<6} {:<10} {:<40}", "INDEX", "STATUS", "STEP ID");
    println!("{}", "-".repeat(60));

    for step in steps {
        println!("{:<6} {:<10} {:<40}", step.step_index, step.status, step.step_id);
    }

    Ok(())
}

/// List step results of a run
fn list_results(store: &StateStore, run_id: &str, unsynced_only: bool) -> Result<()> {
    let results = if unsynced_only {
        store.get_unsynced_results(Some(run_id))?
    } else {
        let mut all = Vec::new();
        for step in store.list_steps(run_id)? {
            all.extend(store.list_step_results(&step.step_id)?);
        }
        all
    };

    if results.is_empty() {
        println!("No results for run {}", run_id);
        return Ok(());
    }

    println!(
        "{:<8} {:<6} {:<8} {:<9} {:<7}",
        "RESULT", "STEP", "SUCCESS", "ATTEMPTS", "SYNCED"
    );
    println!("{}", "-".repeat(45));

    for result in results {
        println!(
            "{:<8} {:<6} {:<8} {:<9} {:<7}",
            result.result_id,
            result.step_index,
            result.outcome.success,
            result.outcome.attempts,
            result.synced_to_cloud
        );
    }

    Ok(())
}

/// Cancel a run and queue the change for replay
fn cancel_run(store: &StateStore, run_id: &str) -> Result<()> {
    let run = store
        .update_run(run_id, RunUpdate::status(RunStatus::Cancelled))?
        .with_context(|| format!("Run not found: {}", run_id))?;

    store.queue_sync(&SyncRequest::new(
        run_id,
        ACTION_RUN_UPDATED,
        json!({ "status": run.status }),
    ))?;

    println!("Cancelled run {}", run.run_id);
    Ok(())
}

/// Show sync items due for replay
fn show_queue(store: &StateStore, limit: usize) -> Result<()> {
    let items = store.get_pending_syncs(limit)?;

    if items.is_empty() {
        println!("Sync queue is empty");
        return Ok(());
    }

    println!(
        "{:<8} {:<4} {:<16} {:<9} {:<38}",
        "QUEUE", "PRI", "ACTION", "ATTEMPTS", "KEY"
    );
    println!("{}", "-".repeat(80));

    for item in items {
        println!(
            "{:<8} {:<4} {:<16} {:<9} {}",
            item.queue_id,
            item.priority,
            item.action,
            format!("{}/{}", item.attempts, item.max_attempts),
            idempotency_key(&item.run_id, &item.action, &item.payload)
        );
    }

    Ok(())
}

/// Show store statistics
fn show_stats(store: &StateStore, as_json: bool) -> Result<()> {
    let stats = store.get_stats()?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Database: {}", store.path().display());
    println!();
    println!("Runs ({} total, {} active):", stats.runs.total(), stats.runs.active());
    println!("  executing: {}", stats.runs.executing);
    println!("  paused:    {}", stats.runs.paused);
    println!("  complete:  {}", stats.runs.complete);
    println!("  failed:    {}", stats.runs.failed);
    println!("  cancelled: {}", stats.runs.cancelled);
    println!();
    println!("Steps ({} total):", stats.steps.total());
    println!("  pending:  {}", stats.steps.pending);
    println!("  running:  {}", stats.steps.running);
    println!("  complete: {}", stats.steps.complete);
    println!("  failed:   {}", stats.steps.failed);
    println!();
    println!("Sync queue ({} total):", stats.sync_queue.total());
    println!("  pending:   {}", stats.sync_queue.pending);
    println!("  completed: {}", stats.sync_queue.completed);
    println!("  failed:    {}", stats.sync_queue.failed);
    println!();
    println!("Unsynced results: {}", stats.unsynced_results);

    Ok(())
}

/// Delete finished runs past the retention window
fn cleanup(store: &StateStore, days: Option<u32>) -> Result<()> {
    let days = days.unwrap_or(store.settings().retention_days);
    let removed = store.cleanup(days)?;

    println!("Removed {} run(s) finished more than {} day(s) ago", removed, days);
    Ok(())
}

/// Show resolved configuration
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("Config file: {}", cfg.config_file.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "(none - using defaults)".to_string()));
    println!();
    println!("Paths:");
    println!("  Home:     {}", cfg.home.display());
    println!("  Database: {}", cfg.database.display());
    println!();
    println!("Store settings:");
    println!("  Busy timeout:      {}ms", cfg.store.busy_timeout_ms);
    println!("  Synchronous:       {}", cfg.store.synchronous.pragma_value());
    println!("  Max sync attempts: {}", cfg.store.max_sync_attempts);
    println!("  Default priority:  {}", cfg.store.default_priority);
    println!("  Retry delay:       {}ms", cfg.store.retry_delay_ms);
    println!("  Retention:         {} days", cfg.store.retention_days);

    Ok(())
}

/// Truncate a string for table output
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
