// ABOUTME: Per-job change-version checkpoints stored in the destination database
// ABOUTME: Lazily creates sync_metadata and never lets a stored version go backwards

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio_postgres::Client;

/// A stored checkpoint row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub job_name: String,
    pub last_sync_version: i64,
    pub last_sync_time: Option<DateTime<Utc>>,
}

/// Reads and writes `sync_metadata`, keyed by job name.
pub struct VersionStore<'a> {
    client: &'a Client,
}

impl<'a> VersionStore<'a> {
    pub fn new(client: &'a Client) -> Self {
        Self { client }
    }

    async fn ensure_table(&self) -> Result<()> {
        self.client
            .execute(
                r#"CREATE TABLE IF NOT EXISTS sync_metadata (
                    job_name TEXT PRIMARY KEY,
                    last_sync_version BIGINT NOT NULL DEFAULT 0,
                    last_sync_time TIMESTAMPTZ DEFAULT NOW()
                )"#,
                &[],
            )
            .await
            .context("Failed to create sync_metadata table")?;
        Ok(())
    }

    /// Last applied version for `job_name`, 0 when none is stored.
    pub async fn get_last_version(&self, job_name: &str) -> Result<i64> {
        Ok(self
            .get(job_name)
            .await?
            .map(|c| c.last_sync_version)
            .unwrap_or(0))
    }

    pub async fn get(&self, job_name: &str) -> Result<Option<Checkpoint>> {
        self.ensure_table().await?;
        let row = self
            .client
            .query_opt(
                "SELECT job_name, last_sync_version, last_sync_time FROM sync_metadata WHERE job_name = $1",
                &[&job_name],
            )
            .await
            .with_context(|| format!("Failed to read checkpoint for job '{}'", job_name))?;

        Ok(row.map(|row| Checkpoint {
            job_name: row.get(0),
            last_sync_version: row.get(1),
            last_sync_time: row.get(2),
        }))
    }

    /// Upsert the checkpoint for `job_name` and stamp the time. A lower
    /// version than the stored one leaves the stored version in place.
    pub async fn set_version(&self, job_name: &str, version: i64) -> Result<()> {
        self.ensure_table().await?;
        self.client
            .execute(
                "INSERT INTO sync_metadata (job_name, last_sync_version, last_sync_time)
                 VALUES ($1, $2, NOW())
                 ON CONFLICT (job_name) DO UPDATE SET
                     last_sync_version = GREATEST(sync_metadata.last_sync_version, EXCLUDED.last_sync_version),
                     last_sync_time = NOW()",
                &[&job_name, &version],
            )
            .await
            .with_context(|| format!("Failed to store checkpoint for job '{}'", job_name))?;

        tracing::debug!("[{}] Checkpoint set to version {}", job_name, version);
        Ok(())
    }
}
