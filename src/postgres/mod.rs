// ABOUTME: PostgreSQL backend for the synchronization core
// ABOUTME: Wires connections, catalog lookups, change tracking, staging, and stores to the core traits

pub mod checkpoint;
pub mod connection;
pub mod dead_letter;
pub mod inspector;
pub mod staging;
pub mod tracking;
pub mod value;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio_postgres::Client;

pub use checkpoint::{Checkpoint, VersionStore};
pub use connection::{connect, connect_with_timeout, init_tls_policy};
pub use dead_letter::{AckSelection, DeadLetterQueue, StoredDeadLetter};
pub use inspector::SchemaInspector;
pub use staging::StagedMerge;
pub use tracking::ChangeReader;

use crate::sync::backend::{ChangeSource, Connector, SyncTarget};
use crate::sync::change::{ChangeBatch, ChangeCounts};
use crate::sync::dead_letter::DeadLetterEntry;
use crate::sync::schema::TableSchema;
use crate::sync::synchronizer::DEFAULT_OPERATION_TIMEOUT;
use crate::sync::table::TableName;
use crate::utils::validate_connection_string;

/// Opens PostgreSQL connections for job runs.
#[derive(Debug, Clone)]
pub struct PgConnector {
    statement_timeout: Duration,
}

impl PgConnector {
    /// `statement_timeout` is applied server-side to every session.
    pub fn new(statement_timeout: Duration) -> Self {
        Self { statement_timeout }
    }
}

impl Default for PgConnector {
    fn default() -> Self {
        Self::new(DEFAULT_OPERATION_TIMEOUT)
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Source = PgSource;
    type Target = PgTarget;

    fn validate_endpoint(&self, endpoint: &str) -> Result<()> {
        validate_connection_string(endpoint)
    }

    async fn connect_source(&self, endpoint: &str) -> Result<PgSource> {
        let client = connect_with_timeout(endpoint, self.statement_timeout).await?;
        Ok(PgSource { client })
    }

    async fn connect_target(&self, endpoint: &str) -> Result<PgTarget> {
        let client = connect_with_timeout(endpoint, self.statement_timeout).await?;
        Ok(PgTarget { client })
    }
}

/// Source connection held for one job run.
pub struct PgSource {
    client: Client,
}

impl PgSource {
    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl ChangeSource for PgSource {
    async fn change_tracking_enabled(&self, table: &TableName) -> bool {
        match SchemaInspector::new(&self.client)
            .change_tracking_enabled(table)
            .await
        {
            Ok(enabled) => enabled,
            Err(e) => {
                tracing::warn!("Could not determine change tracking state of {}: {:#}", table, e);
                false
            }
        }
    }

    async fn columns(&self, table: &TableName) -> TableSchema {
        SchemaInspector::new(&self.client)
            .columns(table)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("Could not read columns of {}: {:#}", table, e);
                TableSchema::default()
            })
    }

    async fn primary_key(&self, table: &TableName) -> Vec<String> {
        SchemaInspector::new(&self.client)
            .primary_key(table)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("Could not read primary key of {}: {:#}", table, e);
                Vec::new()
            })
    }

    async fn read_changes(
        &self,
        table: &TableName,
        columns: &[String],
        primary_key: &[String],
        since: i64,
    ) -> Result<ChangeBatch> {
        ChangeReader::new(&self.client)
            .read_changes(table, columns, primary_key, since)
            .await
    }
}

/// Destination connection held for one job run.
pub struct PgTarget {
    client: Client,
}

impl PgTarget {
    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl SyncTarget for PgTarget {
    async fn columns(&self, table: &TableName) -> TableSchema {
        SchemaInspector::new(&self.client)
            .columns(table)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("Could not read columns of {}: {:#}", table, e);
                TableSchema::default()
            })
    }

    async fn last_version(&self, job: &str) -> Result<i64> {
        VersionStore::new(&self.client).get_last_version(job).await
    }

    async fn set_version(&self, job: &str, version: i64) -> Result<()> {
        VersionStore::new(&self.client).set_version(job, version).await
    }

    async fn merge_batch(&self, table: &TableName, batch: &ChangeBatch) -> Result<ChangeCounts> {
        StagedMerge::new(&self.client).merge(table, batch).await
    }

    async fn record_dead_letters(&self, entries: &[DeadLetterEntry]) -> Result<()> {
        DeadLetterQueue::new(&self.client).append(entries).await
    }
}
