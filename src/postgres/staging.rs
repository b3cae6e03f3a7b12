// ABOUTME: Staged set-based merge of a change batch into a destination table
// ABOUTME: Loads a per-run temp table, reconciles in one statement, then always drops it

use anyhow::{Context, Result};
use std::future::Future;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

use super::value::to_param;
use crate::sync::change::{
    ChangeBatch, ChangeCounts, ChangeOperation, CHANGE_OPERATION_COLUMN, CHANGE_VERSION_COLUMN,
};
use crate::sync::table::TableName;
use crate::sync::value::SqlValue;
use crate::utils::quote_ident;

/// PostgreSQL accepts at most 65535 bind parameters per statement.
const MAX_PARAMS: usize = 65000;

/// Fresh staging table name, unique per merge.
fn staging_table_name() -> String {
    format!("_sync_stage_{}", uuid::Uuid::new_v4().simple())
}

/// Staging mirrors the destination's column shape (without its constraints)
/// plus the two change-tracking columns.
fn build_create_staging(staging: &str, table: &TableName) -> String {
    let staging = quote_ident(staging);
    format!(
        "CREATE TEMP TABLE {staging} AS SELECT * FROM {table} WITH NO DATA;\n\
         ALTER TABLE {staging} ADD COLUMN {version} BIGINT, ADD COLUMN {operation} CHAR(1);",
        staging = staging,
        table = table.quoted(),
        version = quote_ident(CHANGE_VERSION_COLUMN),
        operation = quote_ident(CHANGE_OPERATION_COLUMN),
    )
}

/// Multi-row INSERT into the staging table.
///
/// ```sql
/// INSERT INTO "_sync_stage_..." ("__sync_change_version", "__sync_change_operation", "id")
/// VALUES ($1, $2, $3), ($4, $5, $6)
/// ```
fn build_staging_insert(staging: &str, columns: &[String], num_rows: usize) -> String {
    let quoted: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let num_cols = columns.len();
    let value_rows: Vec<String> = (0..num_rows)
        .map(|row_idx| {
            let placeholders: Vec<String> = (0..num_cols)
                .map(|col_idx| format!("${}", row_idx * num_cols + col_idx + 1))
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_ident(staging),
        quoted.join(", "),
        value_rows.join(", ")
    )
}

/// One statement that applies the staged batch to `table`:
///
/// - `U` rows matching a destination key overwrite its non-key columns
/// - `I`/`U` rows with no destination match are inserted
/// - `D` rows delete their destination match
///
/// A matched `I` row is left alone. The statement returns the affected counts
/// as (updated, inserted, deleted).
fn build_reconcile(
    table: &TableName,
    staging: &str,
    columns: &[String],
    primary_key: &[String],
) -> String {
    let target = table.quoted();
    let staging = quote_ident(staging);
    let op = quote_ident(CHANGE_OPERATION_COLUMN);

    let key_match: Vec<String> = primary_key
        .iter()
        .map(|c| format!("d.{col} = s.{col}", col = quote_ident(c)))
        .collect();
    let key_match = key_match.join(" AND ");

    let quoted: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let from_staging: Vec<String> = quoted.iter().map(|c| format!("s.{}", c)).collect();

    let assignments: Vec<String> = columns
        .iter()
        .filter(|c| !primary_key.contains(c))
        .map(|c| format!("{col} = s.{col}", col = quote_ident(c)))
        .collect();

    let mut ctes = Vec::with_capacity(3);
    if !assignments.is_empty() {
        ctes.push(format!(
            "updated AS (UPDATE {target} AS d SET {set} FROM {staging} AS s \
             WHERE {key_match} AND s.{op} = 'U' RETURNING 1)",
            target = target,
            set = assignments.join(", "),
            staging = staging,
            key_match = key_match,
            op = op,
        ));
    }
    ctes.push(format!(
        "inserted AS (INSERT INTO {target} ({cols}) SELECT {vals} FROM {staging} AS s \
         WHERE s.{op} IN ('I', 'U') \
         AND NOT EXISTS (SELECT 1 FROM {target} AS d WHERE {key_match}) RETURNING 1)",
        target = target,
        cols = quoted.join(", "),
        vals = from_staging.join(", "),
        staging = staging,
        op = op,
        key_match = key_match,
    ));
    ctes.push(format!(
        "deleted AS (DELETE FROM {target} AS d USING {staging} AS s \
         WHERE {key_match} AND s.{op} = 'D' RETURNING 1)",
        target = target,
        staging = staging,
        key_match = key_match,
        op = op,
    ));

    let updated_count = if assignments.is_empty() {
        "0::bigint"
    } else {
        "(SELECT COUNT(*) FROM updated)"
    };

    format!(
        "WITH {} SELECT {}, (SELECT COUNT(*) FROM inserted), (SELECT COUNT(*) FROM deleted)",
        ctes.join(", "),
        updated_count
    )
}

/// Applies change batches to a destination table through a staging table.
pub struct StagedMerge<'a> {
    client: &'a Client,
}

impl<'a> StagedMerge<'a> {
    pub fn new(client: &'a Client) -> Self {
        Self { client }
    }

    /// Stage `batch` and reconcile it into `table`.
    ///
    /// Returns the engine-reported affected counts. The staging table is
    /// dropped whether or not the merge succeeds.
    pub async fn merge(&self, table: &TableName, batch: &ChangeBatch) -> Result<ChangeCounts> {
        if batch.is_empty() {
            return Ok(ChangeCounts::default());
        }

        let staging = staging_table_name();
        self.with_staging_table(&staging, || async {
            self.client
                .batch_execute(&build_create_staging(&staging, table))
                .await
                .with_context(|| format!("Failed to create staging table for {}", table))?;

            self.load(&staging, batch).await?;

            let query = build_reconcile(table, &staging, &batch.columns, &batch.primary_key);
            let row = self
                .client
                .query_one(&query, &[])
                .await
                .with_context(|| format!("Failed to reconcile staged changes into {}", table))?;

            let updated: i64 = row.get(0);
            let inserted: i64 = row.get(1);
            let deleted: i64 = row.get(2);
            Ok::<_, anyhow::Error>(ChangeCounts {
                inserted: inserted as u64,
                updated: updated as u64,
                deleted: deleted as u64,
                skipped: 0,
            })
        })
        .await
    }

    /// Run `body`, then drop the staging table on every path. A failed drop
    /// is logged; the temp table goes away with the session anyway.
    async fn with_staging_table<F, Fut, T>(&self, staging: &str, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let result = body().await;

        let drop_sql = format!("DROP TABLE IF EXISTS {}", quote_ident(staging));
        if let Err(e) = self.client.execute(&drop_sql, &[]).await {
            tracing::warn!("Failed to drop staging table {}: {}", staging, e);
        }

        result
    }

    /// Bulk-load the batch into staging in parameter-bounded chunks.
    async fn load(&self, staging: &str, batch: &ChangeBatch) -> Result<()> {
        let mut columns = Vec::with_capacity(batch.columns.len() + 2);
        columns.push(CHANGE_VERSION_COLUMN.to_string());
        columns.push(CHANGE_OPERATION_COLUMN.to_string());
        columns.extend(batch.columns.iter().cloned());

        let chunk_size = std::cmp::max(1, MAX_PARAMS / columns.len());
        for chunk in batch.records.chunks(chunk_size) {
            let query = build_staging_insert(staging, &columns, chunk.len());
            let statement = self
                .client
                .prepare(&query)
                .await
                .context("Failed to prepare staging insert")?;
            let types = statement.params();

            let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::with_capacity(types.len());
            for record in chunk {
                let row = staged_row(record.version, record.operation, &record.values);
                for value in row {
                    let ty = types
                        .get(params.len())
                        .context("staging insert has fewer parameters than values")?;
                    let column = &columns[params.len() % columns.len()];
                    params.push(
                        to_param(value.as_ref(), ty)
                            .with_context(|| format!("Failed to bind column '{}'", column))?,
                    );
                }
            }

            let refs: Vec<&(dyn ToSql + Sync)> = params
                .iter()
                .map(|p| p.as_ref() as &(dyn ToSql + Sync))
                .collect();
            self.client
                .execute(&statement, &refs)
                .await
                .context("Failed to load changes into staging table")?;
        }

        tracing::debug!("Staged {} change(s) in {}", batch.len(), staging);
        Ok(())
    }
}

/// Values of one staged row: version, operation code, then the batch columns.
fn staged_row(
    version: i64,
    operation: ChangeOperation,
    values: &[SqlValue],
) -> Vec<std::borrow::Cow<'_, SqlValue>> {
    use std::borrow::Cow;
    let mut row = Vec::with_capacity(values.len() + 2);
    row.push(Cow::Owned(SqlValue::Int64(version)));
    row.push(Cow::Owned(SqlValue::from(operation.code())));
    row.extend(values.iter().map(Cow::Borrowed));
    row
}
