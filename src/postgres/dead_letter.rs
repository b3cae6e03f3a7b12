// ABOUTME: Durable dead-letter table in the destination database
// ABOUTME: Appends failed records and lets operators list and acknowledge them

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

use crate::sync::dead_letter::DeadLetterEntry;

/// Four bound values per appended entry.
const PARAMS_PER_ENTRY: usize = 4;
const MAX_PARAMS: usize = 65000;

/// A dead-letter row as stored, for operator listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredDeadLetter {
    pub id: i64,
    pub job_name: String,
    pub error_timestamp: DateTime<Utc>,
    pub error_message: String,
    pub record_data: String,
    pub processed: bool,
    pub processed_timestamp: Option<DateTime<Utc>>,
}

/// Which entries an acknowledgement applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckSelection {
    All,
    Ids(Vec<i64>),
}

/// Reads and writes `sync_dead_letter`.
pub struct DeadLetterQueue<'a> {
    client: &'a Client,
}

impl<'a> DeadLetterQueue<'a> {
    pub fn new(client: &'a Client) -> Self {
        Self { client }
    }

    async fn ensure_table(&self) -> Result<()> {
        self.client
            .batch_execute(
                r#"CREATE TABLE IF NOT EXISTS sync_dead_letter (
                    id BIGSERIAL PRIMARY KEY,
                    job_name TEXT NOT NULL,
                    error_timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    error_message TEXT,
                    record_data TEXT,
                    processed BOOLEAN NOT NULL DEFAULT FALSE,
                    processed_timestamp TIMESTAMPTZ
                );
                CREATE INDEX IF NOT EXISTS sync_dead_letter_job_time_idx
                    ON sync_dead_letter (job_name, error_timestamp);"#,
            )
            .await
            .context("Failed to create sync_dead_letter table")?;
        Ok(())
    }

    /// Append `entries`. Chunks are written in one transaction so a batch is
    /// either fully recorded or not at all.
    pub async fn append(&self, entries: &[DeadLetterEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.ensure_table().await?;

        self.client
            .batch_execute("BEGIN")
            .await
            .context("Failed to begin dead letter transaction")?;

        let chunk_size = MAX_PARAMS / PARAMS_PER_ENTRY;
        for chunk in entries.chunks(chunk_size) {
            if let Err(e) = self.insert_chunk(chunk).await {
                let _ = self.client.batch_execute("ROLLBACK").await;
                return Err(e);
            }
        }

        self.client
            .batch_execute("COMMIT")
            .await
            .context("Failed to commit dead letter entries")?;
        Ok(())
    }

    async fn insert_chunk(&self, chunk: &[DeadLetterEntry]) -> Result<()> {
        let query = build_append_query(chunk.len());
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(chunk.len() * PARAMS_PER_ENTRY);
        for entry in chunk {
            params.push(&entry.job_name);
            params.push(&entry.error_timestamp);
            params.push(&entry.error_message);
            params.push(&entry.record_data);
        }
        self.client
            .execute(&query, &params)
            .await
            .context("Failed to write dead letter entries")?;
        Ok(())
    }

    /// Entries for `job_name` (or all jobs), newest first.
    pub async fn list(
        &self,
        job_name: Option<&str>,
        include_processed: bool,
        limit: i64,
    ) -> Result<Vec<StoredDeadLetter>> {
        self.ensure_table().await?;
        let rows = self
            .client
            .query(
                "SELECT id, job_name, error_timestamp, COALESCE(error_message, ''),
                        COALESCE(record_data, ''), processed, processed_timestamp
                 FROM sync_dead_letter
                 WHERE ($1::text IS NULL OR job_name = $1)
                   AND ($2 OR NOT processed)
                 ORDER BY error_timestamp DESC, id DESC
                 LIMIT $3",
                &[&job_name, &include_processed, &limit],
            )
            .await
            .context("Failed to list dead letter entries")?;

        Ok(rows
            .iter()
            .map(|row| StoredDeadLetter {
                id: row.get(0),
                job_name: row.get(1),
                error_timestamp: row.get(2),
                error_message: row.get(3),
                record_data: row.get(4),
                processed: row.get(5),
                processed_timestamp: row.get(6),
            })
            .collect())
    }

    /// Mark unprocessed entries of `job_name` as processed. Returns how many
    /// rows changed.
    pub async fn mark_processed(&self, job_name: &str, selection: &AckSelection) -> Result<u64> {
        self.ensure_table().await?;
        let updated = match selection {
            AckSelection::All => self
                .client
                .execute(
                    "UPDATE sync_dead_letter
                     SET processed = TRUE, processed_timestamp = NOW()
                     WHERE job_name = $1 AND NOT processed",
                    &[&job_name],
                )
                .await,
            AckSelection::Ids(ids) => self
                .client
                .execute(
                    "UPDATE sync_dead_letter
                     SET processed = TRUE, processed_timestamp = NOW()
                     WHERE job_name = $1 AND NOT processed AND id = ANY($2)",
                    &[&job_name, ids],
                )
                .await,
        }
        .with_context(|| format!("Failed to acknowledge dead letters for job '{}'", job_name))?;

        Ok(updated)
    }
}

fn build_append_query(num_rows: usize) -> String {
    let rows: Vec<String> = (0..num_rows)
        .map(|i| {
            let base = i * PARAMS_PER_ENTRY;
            format!("(${}, ${}, ${}, ${})", base + 1, base + 2, base + 3, base + 4)
        })
        .collect();
    format!(
        "INSERT INTO sync_dead_letter (job_name, error_timestamp, error_message, record_data) VALUES {}",
        rows.join(", ")
    )
}
