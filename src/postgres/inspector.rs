// ABOUTME: Catalog lookups for column metadata, primary keys, and tracking triggers
// ABOUTME: Reads information_schema and pg_catalog; never modifies the database

use anyhow::{Context, Result};
use tokio_postgres::Client;

use super::tracking::TRACKING_TRIGGER;
use crate::sync::schema::{ColumnInfo, TableSchema};
use crate::sync::table::TableName;

/// Reads table metadata from either side of a job.
pub struct SchemaInspector<'a> {
    client: &'a Client,
}

impl<'a> SchemaInspector<'a> {
    pub fn new(client: &'a Client) -> Self {
        Self { client }
    }

    /// Columns of `table` in ordinal order. Empty if the table does not exist.
    pub async fn columns(&self, table: &TableName) -> Result<TableSchema> {
        let rows = self
            .client
            .query(
                "SELECT column_name::text,
                        data_type::text,
                        is_nullable = 'YES',
                        character_maximum_length::int,
                        numeric_precision::int,
                        numeric_scale::int
                 FROM information_schema.columns
                 WHERE table_schema = $1 AND table_name = $2
                 ORDER BY ordinal_position",
                &[&table.schema(), &table.name()],
            )
            .await
            .with_context(|| format!("Failed to get columns for {}", table))?;

        Ok(TableSchema::new(
            rows.iter()
                .map(|row| ColumnInfo {
                    name: row.get(0),
                    data_type: row.get(1),
                    is_nullable: row.get(2),
                    max_length: row.get(3),
                    numeric_precision: row.get(4),
                    numeric_scale: row.get(5),
                })
                .collect(),
        ))
    }

    /// Primary-key columns of `table` in key order. Empty when there is no
    /// primary key.
    pub async fn primary_key(&self, table: &TableName) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT a.attname::text
                 FROM pg_index i
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
                 JOIN pg_class c ON c.oid = i.indrelid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE i.indisprimary
                   AND n.nspname = $1
                   AND c.relname = $2
                 ORDER BY array_position(i.indkey, a.attnum)",
                &[&table.schema(), &table.name()],
            )
            .await
            .with_context(|| format!("Failed to get primary key for {}", table))?;

        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    /// Whether the change-tracking trigger is installed and enabled on `table`.
    pub async fn change_tracking_enabled(&self, table: &TableName) -> Result<bool> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (
                     SELECT 1
                     FROM pg_trigger tg
                     JOIN pg_class c ON c.oid = tg.tgrelid
                     JOIN pg_namespace n ON n.oid = c.relnamespace
                     WHERE n.nspname = $1
                       AND c.relname = $2
                       AND tg.tgname = $3
                       AND NOT tg.tgisinternal
                       AND tg.tgenabled <> 'D'
                 )",
                &[&table.schema(), &table.name(), &TRACKING_TRIGGER],
            )
            .await
            .with_context(|| format!("Failed to check change tracking on {}", table))?;

        Ok(row.get(0))
    }

    pub async fn table_exists(&self, table: &TableName) -> Result<bool> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (
                     SELECT 1 FROM information_schema.tables
                     WHERE table_schema = $1 AND table_name = $2
                 )",
                &[&table.schema(), &table.name()],
            )
            .await
            .with_context(|| format!("Failed to check whether {} exists", table))?;

        Ok(row.get(0))
    }
}
