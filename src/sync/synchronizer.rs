// ABOUTME: Per-job synchronization state machine driven by change-tracking versions
// ABOUTME: Validates, reads changes since the checkpoint, merges, dead-letters, and checkpoints

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::time::timeout;

use super::backend::{ChangeSource, Connector, SyncTarget};
use super::change::ChangeCounts;
use super::dead_letter::record_failed_batch;
use super::job::{SyncError, SyncJob, SyncPhase, SyncResult};
use super::schema::check_compatibility;
use super::table::TableName;
use crate::utils::{same_database, validate_identifiers};

/// Default bound on a single change read or merge.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(300);

/// Runs one job to completion. Never returns an error: every failure is
/// reported through the [`SyncResult`].
#[async_trait]
pub trait Synchronizer: Send + Sync {
    async fn synchronize(&self, job: &SyncJob) -> SyncResult;
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Client-side bound on reading changes and on the staged merge.
    pub operation_timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

/// What a successful run applied.
struct RunOutcome {
    counts: ChangeCounts,
    checkpoint: Option<i64>,
}

/// Incremental synchronizer that applies the changes recorded since the
/// job's last checkpoint.
///
/// Each run opens its own source and destination connections and drops
/// both on every exit path. Runs hold no state between calls.
pub struct ChangeTrackingSynchronizer<C: Connector> {
    connector: C,
    options: SyncOptions,
}

impl<C: Connector> ChangeTrackingSynchronizer<C> {
    pub fn new(connector: C) -> Self {
        Self::with_options(connector, SyncOptions::default())
    }

    pub fn with_options(connector: C, options: SyncOptions) -> Self {
        Self { connector, options }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    fn enter(&self, job: &SyncJob, phase: &mut SyncPhase, next: SyncPhase) {
        tracing::debug!("[{}] {} -> {}", job.name, phase, next);
        *phase = next;
    }

    /// Check the job definition and resolve its table names.
    fn validate_job(&self, job: &SyncJob) -> Result<(TableName, TableName), SyncError> {
        let required = [
            ("job name", &job.name),
            ("source connection string", &job.source_connection),
            ("destination connection string", &job.destination_connection),
            ("source table name", &job.source_table),
            ("destination table name", &job.destination_table),
        ];
        for (what, value) in required {
            if value.trim().is_empty() {
                return Err(SyncError::Configuration(format!(
                    "Job '{}' has an empty {}",
                    job.name, what
                )));
            }
        }

        self.connector
            .validate_endpoint(&job.source_connection)
            .map_err(|e| SyncError::Configuration(format!("Invalid source connection: {:#}", e)))?;
        self.connector
            .validate_endpoint(&job.destination_connection)
            .map_err(|e| {
                SyncError::Configuration(format!("Invalid destination connection: {:#}", e))
            })?;

        let source_table = TableName::parse(&job.source_table)
            .map_err(|e| SyncError::Configuration(format!("Invalid source table: {:#}", e)))?;
        let destination_table = TableName::parse(&job.destination_table).map_err(|e| {
            SyncError::Configuration(format!("Invalid destination table: {:#}", e))
        })?;

        if source_table == destination_table
            && same_database(&job.source_connection, &job.destination_connection)
        {
            return Err(SyncError::Configuration(format!(
                "Source and destination are the same table ({})",
                source_table
            )));
        }

        Ok((source_table, destination_table))
    }

    async fn run(&self, job: &SyncJob, phase: &mut SyncPhase) -> Result<RunOutcome, SyncError> {
        let (source_table, destination_table) = self.validate_job(job)?;

        self.enter(job, phase, SyncPhase::CheckingChangeTracking);
        let source = self
            .connector
            .connect_source(&job.source_connection)
            .await
            .map_err(|e| SyncError::infrastructure("Failed to connect to source database", e))?;
        let target = self
            .connector
            .connect_target(&job.destination_connection)
            .await
            .map_err(|e| {
                SyncError::infrastructure("Failed to connect to destination database", e)
            })?;

        if !source.change_tracking_enabled(&source_table).await {
            return Err(SyncError::Precondition(format!(
                "Change tracking is not enabled on source table '{}'. \
                 Run 'table-replicator enable-tracking' for this job first.",
                source_table
            )));
        }

        self.enter(job, phase, SyncPhase::ValidatingSchema);
        let source_schema = source.columns(&source_table).await;
        let destination_schema = target.columns(&destination_table).await;
        let validation = check_compatibility(
            &source_table,
            &source_schema,
            &destination_table,
            &destination_schema,
        );
        for warning in &validation.warnings {
            tracing::warn!("[{}] Schema warning: {}", job.name, warning);
        }
        if !validation.is_valid {
            return Err(SyncError::Precondition(format!(
                "Schema validation failed: {}",
                validation.error_message.unwrap_or_default()
            )));
        }
        let columns = source_schema.names();
        validate_identifiers(&columns)
            .map_err(|e| SyncError::Precondition(format!("Unsupported column name: {:#}", e)))?;

        self.enter(job, phase, SyncPhase::ResolvingKeys);
        let primary_key = source.primary_key(&source_table).await;
        if primary_key.is_empty() {
            return Err(SyncError::Precondition(format!(
                "Table '{}' has no primary key. Change tracking synchronization requires a primary key.",
                source_table
            )));
        }
        if let Some(missing) = primary_key.iter().find(|pk| !columns.contains(pk)) {
            return Err(SyncError::Precondition(format!(
                "Primary key column '{}' of '{}' was not found among its columns",
                missing, source_table
            )));
        }

        self.enter(job, phase, SyncPhase::ReadingChanges);
        let baseline = target
            .last_version(&job.name)
            .await
            .map_err(|e| SyncError::infrastructure("Failed to read last sync version", e))?;

        let limit = self.options.operation_timeout;
        let raw = timeout(
            limit,
            source.read_changes(&source_table, &columns, &primary_key, baseline),
        )
        .await
        .map_err(|_| {
            SyncError::Infrastructure(format!(
                "Reading changes from '{}' timed out after {}s",
                source_table,
                limit.as_secs()
            ))
        })?
        .map_err(|e| SyncError::infrastructure("Failed to read changes", e))?;

        let captured = raw.len();
        let (batch, skipped) = raw
            .clone()
            .collapse()
            .map_err(|e| SyncError::Data(format!("Failed to collapse change batch: {:#}", e)))?;

        if batch.is_empty() {
            tracing::info!("[{}] No changes since version {}", job.name, baseline);
            return Ok(RunOutcome {
                counts: ChangeCounts::default(),
                checkpoint: None,
            });
        }
        tracing::info!(
            "[{}] Found {} change(s) since version {} ({} after collapsing)",
            job.name,
            captured,
            baseline,
            batch.len()
        );

        self.enter(job, phase, SyncPhase::Reconciling);
        let merged = match timeout(limit, target.merge_batch(&destination_table, &batch)).await {
            Ok(Ok(applied)) => Ok(applied),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(_) => Err(format!("merge timed out after {}s", limit.as_secs())),
        };
        let applied = match merged {
            Ok(applied) => applied,
            Err(message) => {
                record_failed_batch(&target, &job.name, &message, &raw).await;
                return Err(SyncError::Data(format!(
                    "Failed to apply changes to '{}': {}",
                    destination_table, message
                )));
            }
        };
        tracing::debug!(
            "[{}] Merge affected {} inserted, {} updated, {} deleted",
            job.name,
            applied.inserted,
            applied.updated,
            applied.deleted
        );

        self.enter(job, phase, SyncPhase::CheckpointingVersion);
        let mut counts = batch.counts();
        counts.skipped = skipped;

        let checkpoint = match batch.checkpoint_version() {
            Some(version) if version > baseline => {
                target
                    .set_version(&job.name, version)
                    .await
                    .map_err(|e| SyncError::infrastructure("Failed to store sync version", e))?;
                Some(version)
            }
            Some(version) => {
                tracing::warn!(
                    "[{}] Batch version {} is not ahead of checkpoint {}; leaving checkpoint unchanged",
                    job.name,
                    version,
                    baseline
                );
                None
            }
            None => None,
        };

        Ok(RunOutcome { counts, checkpoint })
    }
}

#[async_trait]
impl<C: Connector> Synchronizer for ChangeTrackingSynchronizer<C> {
    async fn synchronize(&self, job: &SyncJob) -> SyncResult {
        let start = Instant::now();
        let mut phase = SyncPhase::Validating;
        tracing::info!("[{}] Starting sync", job.name);

        match self.run(job, &mut phase).await {
            Ok(outcome) => {
                self.enter(job, &mut phase, SyncPhase::Done);
                let result =
                    SyncResult::succeeded(outcome.counts, outcome.checkpoint, start.elapsed());
                tracing::info!(
                    "[{}] Sync completed: {} inserted, {} updated, {} deleted, {} skipped in {}ms",
                    job.name,
                    result.rows_inserted,
                    result.rows_updated,
                    result.rows_deleted,
                    result.rows_skipped,
                    result.duration.as_millis()
                );
                result
            }
            Err(err) => {
                let failed_in = phase;
                self.enter(job, &mut phase, SyncPhase::Failed);
                tracing::error!("[{}] Sync failed while {}: {}", job.name, failed_in, err);
                SyncResult::failed(&err, failed_in, start.elapsed())
            }
        }
    }
}
