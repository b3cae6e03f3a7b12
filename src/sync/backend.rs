// ABOUTME: Database capabilities the synchronizer needs from a source and a destination
// ABOUTME: Implemented by the PostgreSQL backend and by in-memory test doubles

use anyhow::Result;
use async_trait::async_trait;

use super::change::{ChangeBatch, ChangeCounts};
use super::dead_letter::DeadLetterEntry;
use super::schema::TableSchema;
use super::table::TableName;

/// Read side of a job: catalog lookups plus the change-tracking facility.
///
/// Catalog lookups never fail: a lookup error is logged by the implementation
/// and reported as an empty result, leaving severity to the caller.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    async fn change_tracking_enabled(&self, table: &TableName) -> bool;

    async fn columns(&self, table: &TableName) -> TableSchema;

    /// Primary-key column names in key order. Empty when the table has none.
    async fn primary_key(&self, table: &TableName) -> Vec<String>;

    /// Every change with a version greater than `since`, ascending by
    /// version, with the current row image (nulls for rows no longer present).
    async fn read_changes(
        &self,
        table: &TableName,
        columns: &[String],
        primary_key: &[String],
        since: i64,
    ) -> Result<ChangeBatch>;
}

/// Write side of a job: the destination table plus the checkpoint and
/// dead-letter stores that live next to it.
#[async_trait]
pub trait SyncTarget: Send + Sync {
    async fn columns(&self, table: &TableName) -> TableSchema;

    /// Last applied version for `job`, 0 when none has been stored.
    async fn last_version(&self, job: &str) -> Result<i64>;

    async fn set_version(&self, job: &str, version: i64) -> Result<()>;

    /// Stage `batch` and reconcile it into `table` as one set operation.
    /// Returns the row counts the engine reported, for logging only.
    async fn merge_batch(&self, table: &TableName, batch: &ChangeBatch) -> Result<ChangeCounts>;

    async fn record_dead_letters(&self, entries: &[DeadLetterEntry]) -> Result<()>;
}

/// Opens the two connections a job run holds. Dropping a returned handle
/// releases its connection.
#[async_trait]
pub trait Connector: Send + Sync {
    type Source: ChangeSource;
    type Target: SyncTarget;

    /// Reject endpoints this backend cannot open, before any connection attempt.
    fn validate_endpoint(&self, _endpoint: &str) -> Result<()> {
        Ok(())
    }

    async fn connect_source(&self, endpoint: &str) -> Result<Self::Source>;

    async fn connect_target(&self, endpoint: &str) -> Result<Self::Target>;
}
