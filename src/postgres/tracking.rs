// ABOUTME: Trigger-based change tracking for PostgreSQL source tables
// ABOUTME: Installs the change log and capture trigger, reads committed changes, and prunes the log

use anyhow::{Context, Result};
use tokio_postgres::Client;

use super::value::decode_value;
use crate::sync::change::{ChangeBatch, ChangeOperation, ChangeRecord};
use crate::sync::table::TableName;
use crate::utils::{quote_ident, quote_literal};

/// Source-side log of row changes.
///
/// `version` orders entries in write order. `txid` is the writing
/// transaction and is what checkpoints are measured in: a transaction id below
/// the oldest one still running can no longer gain log entries.
pub const CHANGE_LOG_TABLE: &str = "public.sync_change_log";
/// Row trigger that feeds the change log.
pub const TRACKING_TRIGGER: &str = "sync_change_tracking";
/// Trigger function; its arguments are the table's primary-key column names.
pub const CAPTURE_FUNCTION: &str = "public.sync_capture_change";

/// Highest transaction id below every transaction still in progress.
const COMMIT_HORIZON_QUERY: &str = "SELECT txid_snapshot_xmin(txid_current_snapshot()) - 1";

/// DDL for the change log and the capture function. Idempotent.
///
/// An update that changes the key is logged as a delete of the old key
/// followed by an insert of the new one.
fn change_log_ddl() -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {log} (
    version BIGSERIAL PRIMARY KEY,
    txid BIGINT NOT NULL DEFAULT txid_current(),
    table_schema TEXT NOT NULL,
    table_name TEXT NOT NULL,
    operation CHAR(1) NOT NULL CHECK (operation IN ('I', 'U', 'D')),
    primary_key JSONB NOT NULL,
    changed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
ALTER TABLE {log} ADD COLUMN IF NOT EXISTS txid BIGINT NOT NULL DEFAULT txid_current();
CREATE INDEX IF NOT EXISTS sync_change_log_table_txid_idx
    ON {log} (table_schema, table_name, txid);

CREATE OR REPLACE FUNCTION {func}() RETURNS trigger
LANGUAGE plpgsql AS $sync$
DECLARE
    new_key JSONB;
    old_key JSONB;
BEGIN
    IF TG_OP IN ('INSERT', 'UPDATE') THEN
        SELECT jsonb_object_agg(k, to_jsonb(NEW) -> k) INTO new_key FROM unnest(TG_ARGV) AS k;
    END IF;
    IF TG_OP IN ('UPDATE', 'DELETE') THEN
        SELECT jsonb_object_agg(k, to_jsonb(OLD) -> k) INTO old_key FROM unnest(TG_ARGV) AS k;
    END IF;

    IF TG_OP = 'UPDATE' AND new_key IS DISTINCT FROM old_key THEN
        INSERT INTO {log} (table_schema, table_name, operation, primary_key)
        VALUES (TG_TABLE_SCHEMA, TG_TABLE_NAME, 'D', old_key);
        INSERT INTO {log} (table_schema, table_name, operation, primary_key)
        VALUES (TG_TABLE_SCHEMA, TG_TABLE_NAME, 'I', new_key);
    ELSE
        INSERT INTO {log} (table_schema, table_name, operation, primary_key)
        VALUES (TG_TABLE_SCHEMA, TG_TABLE_NAME, left(TG_OP, 1), COALESCE(new_key, old_key));
    END IF;
    RETURN NULL;
END;
$sync$;
"#,
        log = CHANGE_LOG_TABLE,
        func = CAPTURE_FUNCTION,
    )
}

/// Removes every logged change of `table`.
fn clear_log_sql(table: &TableName) -> String {
    format!(
        "DELETE FROM {} WHERE table_schema = {} AND table_name = {};",
        CHANGE_LOG_TABLE,
        quote_literal(table.schema()),
        quote_literal(table.name())
    )
}

/// Full tracking install for `table`. A fresh install (no trigger on the
/// table yet) also clears entries left by an earlier table of the same name.
fn build_enable_ddl(table: &TableName, primary_key: &[String], fresh: bool) -> String {
    let mut ddl = change_log_ddl();
    if fresh {
        ddl.push_str(&clear_log_sql(table));
        ddl.push('\n');
    }
    ddl.push_str(&trigger_ddl(table, primary_key));
    ddl
}

/// DDL that (re)creates the capture trigger on `table`.
fn trigger_ddl(table: &TableName, primary_key: &[String]) -> String {
    let args: Vec<String> = primary_key.iter().map(|c| quote_literal(c)).collect();
    format!(
        "DROP TRIGGER IF EXISTS {trigger} ON {table};\n\
         CREATE TRIGGER {trigger} AFTER INSERT OR UPDATE OR DELETE ON {table} \
         FOR EACH ROW EXECUTE FUNCTION {func}({args});",
        trigger = quote_ident(TRACKING_TRIGGER),
        table = table.quoted(),
        func = CAPTURE_FUNCTION,
        args = args.join(", ")
    )
}

/// Build the change query: one row per log entry whose transaction lies in
/// `($3, $4]`, ascending by version, with the current row image for `columns`.
///
/// Key columns come from the logged key so deletes still carry them;
/// non-key columns come from the live row and are NULL once it is gone.
///
/// ```sql
/// SELECT ct.version, ct.operation, k."id", t."val"
/// FROM public.sync_change_log ct
/// CROSS JOIN LATERAL jsonb_populate_record(NULL::"public"."items", ct.primary_key) AS k
/// LEFT JOIN "public"."items" t ON t."id" = k."id"
/// WHERE ct.table_schema = $1 AND ct.table_name = $2
///   AND ct.txid > $3 AND ct.txid <= $4
/// ORDER BY ct.version
/// ```
fn build_changes_query(table: &TableName, columns: &[String], primary_key: &[String]) -> String {
    let select_list: Vec<String> = columns
        .iter()
        .map(|c| {
            if primary_key.contains(c) {
                format!("k.{}", quote_ident(c))
            } else {
                format!("t.{}", quote_ident(c))
            }
        })
        .collect();

    let join_condition: Vec<String> = primary_key
        .iter()
        .map(|c| format!("t.{col} = k.{col}", col = quote_ident(c)))
        .collect();

    format!(
        "SELECT ct.version, ct.operation, {select} \
         FROM {log} ct \
         CROSS JOIN LATERAL jsonb_populate_record(NULL::{table}, ct.primary_key) AS k \
         LEFT JOIN {table} t ON {join} \
         WHERE ct.table_schema = $1 AND ct.table_name = $2 \
         AND ct.txid > $3 AND ct.txid <= $4 \
         ORDER BY ct.version",
        select = select_list.join(", "),
        log = CHANGE_LOG_TABLE,
        table = table.quoted(),
        join = join_condition.join(" AND ")
    )
}

/// Reads a source table's changes from the change log.
pub struct ChangeReader<'a> {
    client: &'a Client,
}

impl<'a> ChangeReader<'a> {
    pub fn new(client: &'a Client) -> Self {
        Self { client }
    }

    /// Install or refresh change tracking for `table`.
    ///
    /// Creates the change log and capture function if needed, then recreates
    /// the trigger with the current primary key. When the table had no
    /// trigger yet, logged changes of an earlier table with the same name are
    /// discarded. Runs as a single implicit transaction.
    pub async fn enable_change_tracking(
        &self,
        table: &TableName,
        primary_key: &[String],
    ) -> Result<()> {
        if primary_key.is_empty() {
            anyhow::bail!(
                "Table {} has no primary key; change tracking requires one",
                table
            );
        }

        let fresh = !self.trigger_installed(table).await?;
        let ddl = build_enable_ddl(table, primary_key, fresh);
        self.client
            .batch_execute(&ddl)
            .await
            .with_context(|| format!("Failed to enable change tracking on {}", table))?;

        if fresh {
            tracing::info!("Change tracking enabled on {}", table);
        } else {
            tracing::info!("Change tracking refreshed on {}", table);
        }
        Ok(())
    }

    /// Whether `table` carries the capture trigger, enabled or not.
    async fn trigger_installed(&self, table: &TableName) -> Result<bool> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (
                     SELECT 1
                     FROM pg_trigger tg
                     JOIN pg_class c ON c.oid = tg.tgrelid
                     JOIN pg_namespace n ON n.oid = c.relnamespace
                     WHERE n.nspname = $1 AND c.relname = $2 AND tg.tgname = $3
                 )",
                &[&table.schema(), &table.name(), &TRACKING_TRIGGER],
            )
            .await
            .with_context(|| format!("Failed to look up tracking trigger on {}", table))?;
        Ok(row.get(0))
    }

    /// Transaction id below which every write has committed or aborted.
    ///
    /// Log entries at or below the horizon are final, so it is safe to
    /// checkpoint there. The value only grows.
    pub async fn commit_horizon(&self) -> Result<i64> {
        let row = self
            .client
            .query_one(COMMIT_HORIZON_QUERY, &[])
            .await
            .context("Failed to read the commit horizon")?;
        Ok(row.get(0))
    }

    /// Number of log entries for `table` written by transactions after `since`.
    pub async fn pending_changes(&self, table: &TableName, since: i64) -> Result<i64> {
        let row = self
            .client
            .query_one(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE table_schema = $1 AND table_name = $2 AND txid > $3",
                    CHANGE_LOG_TABLE
                ),
                &[&table.schema(), &table.name(), &since],
            )
            .await
            .with_context(|| format!("Failed to count pending changes for {}", table))?;
        Ok(row.get(0))
    }

    /// Delete the log entries of `table` at or below checkpoint `through`.
    /// Returns the number of entries removed.
    pub async fn prune(&self, table: &TableName, through: i64) -> Result<u64> {
        let removed = self
            .client
            .execute(
                &format!(
                    "DELETE FROM {} WHERE table_schema = $1 AND table_name = $2 AND txid <= $3",
                    CHANGE_LOG_TABLE
                ),
                &[&table.schema(), &table.name(), &through],
            )
            .await
            .with_context(|| format!("Failed to prune change log for {}", table))?;

        tracing::info!(
            "Pruned {} change(s) of {} through checkpoint {}",
            removed,
            table,
            through
        );
        Ok(removed)
    }

    /// All committed changes to `table` after checkpoint `since`, in
    /// version order, uncollapsed. The batch carries the commit horizon it
    /// was read up to as its checkpoint.
    pub async fn read_changes(
        &self,
        table: &TableName,
        columns: &[String],
        primary_key: &[String],
        since: i64,
    ) -> Result<ChangeBatch> {
        let horizon = self.commit_horizon().await?.max(since);
        let query = build_changes_query(table, columns, primary_key);
        let rows = self
            .client
            .query(&query, &[&table.schema(), &table.name(), &since, &horizon])
            .await
            .with_context(|| format!("Failed to read changes from {}", table))?;

        let mut batch =
            ChangeBatch::new(columns.to_vec(), primary_key.to_vec()).with_checkpoint(horizon);
        for row in &rows {
            let version: i64 = row.try_get(0).context("Failed to read change version")?;
            let code: String = row.try_get(1).context("Failed to read change operation")?;
            let operation = ChangeOperation::from_code(&code)?;

            let mut values = Vec::with_capacity(columns.len());
            for idx in 0..columns.len() {
                values.push(decode_value(row, idx + 2)?);
            }

            batch.push(ChangeRecord {
                version,
                operation,
                values,
            });
        }

        tracing::debug!(
            "Read {} change(s) from {} in ({}, {}]",
            batch.len(),
            table,
            since,
            horizon
        );
        Ok(batch)
    }
}
