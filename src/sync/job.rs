// ABOUTME: Job definitions, run status, and the per-run result summary
// ABOUTME: Also defines the typed error categories caught at the job boundary

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use super::change::ChangeCounts;

/// Lifecycle status of a job, updated by the scheduler after each run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Running => "running",
            SyncStatus::Success => "success",
            SyncStatus::Failed => "failed",
            SyncStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One source table mirrored into one destination table.
///
/// `name` keys the checkpoint and the dead-letter entries, so it must be
/// unique across the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncJob {
    pub name: String,
    pub source_connection: String,
    pub destination_connection: String,
    pub source_table: String,
    pub destination_table: String,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub status: SyncStatus,
}

impl SyncJob {
    pub fn new(
        name: &str,
        source_connection: &str,
        destination_connection: &str,
        source_table: &str,
        destination_table: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            source_connection: source_connection.to_string(),
            destination_connection: destination_connection.to_string(),
            source_table: source_table.to_string(),
            destination_table: destination_table.to_string(),
            enabled: true,
            last_run: None,
            status: SyncStatus::Pending,
        }
    }
}

/// Steps of a single run, in the order they are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncPhase {
    Validating,
    CheckingChangeTracking,
    ValidatingSchema,
    ResolvingKeys,
    ReadingChanges,
    Reconciling,
    CheckpointingVersion,
    Done,
    Failed,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncPhase::Validating => "validating",
            SyncPhase::CheckingChangeTracking => "checking change tracking",
            SyncPhase::ValidatingSchema => "validating schema",
            SyncPhase::ResolvingKeys => "resolving keys",
            SyncPhase::ReadingChanges => "reading changes",
            SyncPhase::Reconciling => "reconciling",
            SyncPhase::CheckpointingVersion => "checkpointing version",
            SyncPhase::Done => "done",
            SyncPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Failure categories reported in a [`SyncResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    /// Missing or malformed job definition. Nothing was touched.
    Configuration,
    /// Change tracking off, schema incompatible, or no primary key.
    Precondition,
    /// Staging or reconciliation failed; the batch was dead-lettered.
    Data,
    /// Connection failure, timeout, or checkpoint I/O.
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{0}")]
    Configuration(String),
    #[error("{0}")]
    Precondition(String),
    #[error("{0}")]
    Data(String),
    #[error("{0}")]
    Infrastructure(String),
}

impl SyncError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SyncError::Configuration(_) => FailureKind::Configuration,
            SyncError::Precondition(_) => FailureKind::Precondition,
            SyncError::Data(_) => FailureKind::Data,
            SyncError::Infrastructure(_) => FailureKind::Infrastructure,
        }
    }

    /// Wrap a lower-level error, keeping its full context chain in the message.
    pub fn infrastructure(context: &str, err: anyhow::Error) -> Self {
        SyncError::Infrastructure(format!("{}: {:#}", context, err))
    }
}

/// Summary of one `synchronize` call. Never persisted by the core.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncResult {
    pub success: bool,
    pub rows_inserted: u64,
    pub rows_updated: u64,
    pub rows_deleted: u64,
    /// Records superseded by a later change to the same key in the window.
    pub rows_skipped: u64,
    pub duration: Duration,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// `Done` on success; otherwise the phase the run failed in.
    pub phase: SyncPhase,
    pub failure: Option<FailureKind>,
    /// Checkpoint written by this run, if it advanced.
    pub checkpoint: Option<i64>,
}

impl SyncResult {
    pub fn succeeded(
        counts: ChangeCounts,
        checkpoint: Option<i64>,
        duration: Duration,
    ) -> Self {
        Self {
            success: true,
            rows_inserted: counts.inserted,
            rows_updated: counts.updated,
            rows_deleted: counts.deleted,
            rows_skipped: counts.skipped,
            duration,
            error_message: None,
            timestamp: Utc::now(),
            phase: SyncPhase::Done,
            failure: None,
            checkpoint,
        }
    }

    pub fn failed(error: &SyncError, phase: SyncPhase, duration: Duration) -> Self {
        Self {
            success: false,
            rows_inserted: 0,
            rows_updated: 0,
            rows_deleted: 0,
            rows_skipped: 0,
            duration,
            error_message: Some(error.to_string()),
            timestamp: Utc::now(),
            phase,
            failure: Some(error.kind()),
            checkpoint: None,
        }
    }

    pub fn total_rows(&self) -> u64 {
        self.rows_inserted + self.rows_updated + self.rows_deleted
    }
}
