//! Read-only health snapshot of the store.

use serde::Serialize;

/// Runs by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub executing: u64,
    pub paused: u64,
    pub complete: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl RunCounts {
    pub fn total(&self) -> u64 {
        self.executing + self.paused + self.complete + self.failed + self.cancelled
    }

    /// Runs that have not reached a terminal status
    pub fn active(&self) -> u64 {
        self.executing + self.paused
    }
}

/// Steps by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StepCounts {
    pub pending: u64,
    pub running: u64,
    pub complete: u64,
    pub failed: u64,
}

impl StepCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.running + self.complete + self.failed
    }
}

/// Sync queue items by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounts {
    pub pending: u64,
    pub completed: u64,
    pub failed: u64,
}

impl SyncCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.completed + self.failed
    }
}

/// Store statistics summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub runs: RunCounts,
    pub steps: StepCounts,
    pub sync_queue: SyncCounts,
    pub unsynced_results: u64,
}
