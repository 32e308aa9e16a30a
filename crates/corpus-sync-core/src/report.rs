//! Run reports returned by the sync orchestrator.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{ItemKey, SyncCursor};

/// Orchestrator phase. A run ends in `Idle` (committed) or `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Idle,
    Listing,
    Processing,
    Committing,
    Aborted,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Index updated and state committed.
    Committed,
    /// Too many item failures; cursor not advanced.
    Aborted,
    /// Cancelled; cursor not advanced.
    Cancelled,
    /// Listing or the state layer failed; cursor not advanced.
    Failed,
    /// Delta computed but nothing processed.
    DryRun,
}

/// Pipeline stage at which an item failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    Fetch,
    Extract,
    Embed,
    Publish,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemFailure {
    pub key: ItemKey,
    pub stage: FailureStage,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    /// Unsupported formats.
    pub skipped: usize,
    /// Supported formats that yielded no text.
    pub empty: usize,
    pub failed: usize,
    /// Items indexed without vectors after embedding retries ran out.
    pub embedding_degraded: usize,
    /// Items indexed with an empty filter set.
    pub acl_closed: usize,
    pub records_written: usize,
}

/// Outcome of one sync run. Not persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub library_id: String,
    pub phase: RunPhase,
    pub outcome: RunOutcome,
    pub full_resync: bool,
    /// Items dispatched for processing (upserts plus deletes).
    pub attempted: usize,
    pub counts: RunCounts,
    pub failures: Vec<ItemFailure>,
    pub cursor_before: Option<SyncCursor>,
    pub cursor_after: Option<SyncCursor>,
    /// Why the run did not commit.
    pub reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunReport {
    pub fn new(run_id: impl Into<String>, library_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            library_id: library_id.into(),
            phase: RunPhase::Idle,
            outcome: RunOutcome::Committed,
            full_resync: false,
            attempted: 0,
            counts: RunCounts::default(),
            failures: Vec::new(),
            cursor_before: None,
            cursor_after: None,
            reason: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn record_failure(&mut self, key: ItemKey, stage: FailureStage, reason: impl Into<String>) {
        self.counts.failed += 1;
        self.failures.push(ItemFailure {
            key,
            stage,
            reason: reason.into(),
        });
    }

    /// `failed / attempted`, `0.0` when nothing was attempted.
    pub fn failure_fraction(&self) -> f64 {
        if self.attempted == 0 {
            0.0
        } else {
            self.counts.failed as f64 / self.attempted as f64
        }
    }

    pub fn committed(&self) -> bool {
        self.outcome == RunOutcome::Committed
    }

    pub fn finish(&mut self, phase: RunPhase, outcome: RunOutcome) {
        self.phase = phase;
        self.outcome = outcome;
        self.finished_at = Some(Utc::now());
    }
}
