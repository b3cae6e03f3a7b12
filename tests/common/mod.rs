// ABOUTME: In-memory source/destination backend for driving the synchronizer in tests
// ABOUTME: Models a change log, destination tables, checkpoints, and dead letters

#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use table_replicator::sync::{
    ChangeBatch, ChangeCounts, ChangeOperation, ChangeRecord, ChangeSource, ColumnInfo, Connector,
    DeadLetterEntry, SqlValue, SyncJob, SyncTarget, TableName, TableSchema,
};

pub const SOURCE_URL: &str = "postgresql://app@source-host/sales";
pub const TARGET_URL: &str = "postgresql://etl@target-host/mirror";

#[derive(Debug, Clone)]
pub struct MemTable {
    pub schema: TableSchema,
    pub primary_key: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl MemTable {
    fn position(&self, column: &str) -> Option<usize> {
        self.schema.names().iter().position(|c| c == column)
    }

    fn key_of(&self, row: &[SqlValue]) -> Vec<SqlValue> {
        self.primary_key
            .iter()
            .filter_map(|pk| self.position(pk).map(|i| row[i].clone()))
            .collect()
    }

    fn find(&self, key: &[SqlValue]) -> Option<usize> {
        self.rows.iter().position(|row| self.key_of(row) == key)
    }
}

#[derive(Debug, Clone)]
struct LogEntry {
    version: i64,
    table: String,
    operation: ChangeOperation,
    key: Vec<SqlValue>,
    committed: bool,
}

#[derive(Default)]
struct State {
    source: HashMap<String, MemTable>,
    tracked: HashSet<String>,
    log: Vec<LogEntry>,
    last_version: i64,
    /// Rows written by transactions that have not committed, by version.
    uncommitted_rows: HashMap<i64, Vec<SqlValue>>,
    destination: HashMap<String, MemTable>,
    checkpoints: HashMap<String, i64>,
    dead_letters: Vec<DeadLetterEntry>,
    fail_connect: bool,
    fail_merge: Option<String>,
    fail_dead_letters: bool,
    merge_delay: Option<Duration>,
    connects: usize,
    open_connections: usize,
    merge_calls: usize,
    data_statements: usize,
    checkpoint_writes: Vec<(String, i64)>,
}

/// Shared handle to both in-memory databases.
#[derive(Clone, Default)]
pub struct MemoryDb {
    state: Arc<Mutex<State>>,
}

fn key_string(table: &TableName) -> String {
    table.to_string()
}

fn schema(cols: &[(&str, &str, bool)]) -> TableSchema {
    TableSchema::new(
        cols.iter()
            .map(|(name, ty, nullable)| ColumnInfo::new(name, ty, *nullable))
            .collect(),
    )
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector { db: self.clone() }
    }

    // --- source side ---

    pub fn create_source_table(&self, name: &str, cols: &[(&str, &str, bool)], pk: &[&str]) {
        let table = TableName::parse(name).unwrap();
        self.lock().source.insert(
            key_string(&table),
            MemTable {
                schema: schema(cols),
                primary_key: pk.iter().map(|s| s.to_string()).collect(),
                rows: Vec::new(),
            },
        );
    }

    pub fn enable_tracking(&self, name: &str) {
        let table = TableName::parse(name).unwrap();
        self.lock().tracked.insert(key_string(&table));
    }

    /// Make the next logged change get `version + 1`.
    pub fn set_last_version(&self, version: i64) {
        self.lock().last_version = version;
    }

    fn log_change(state: &mut State, table: &str, operation: ChangeOperation, key: Vec<SqlValue>) -> i64 {
        if !state.tracked.contains(table) {
            return state.last_version;
        }
        state.last_version += 1;
        let version = state.last_version;
        state.log.push(LogEntry {
            version,
            table: table.to_string(),
            operation,
            key,
            committed: true,
        });
        version
    }

    /// Highest version with no uncommitted change at or below it.
    fn commit_horizon(state: &State) -> i64 {
        state
            .log
            .iter()
            .filter(|e| !e.committed)
            .map(|e| e.version - 1)
            .min()
            .unwrap_or(state.last_version)
    }

    pub fn source_insert(&self, name: &str, row: Vec<SqlValue>) -> i64 {
        let table = key_string(&TableName::parse(name).unwrap());
        let mut state = self.lock();
        let mem = state.source.get_mut(&table).unwrap();
        let key = mem.key_of(&row);
        mem.rows.push(row);
        Self::log_change(&mut state, &table, ChangeOperation::Insert, key)
    }

    /// Insert inside a transaction that stays open until [`commit`](Self::commit).
    /// The change gets its version now but is invisible until then.
    pub fn source_insert_uncommitted(&self, name: &str, row: Vec<SqlValue>) -> i64 {
        let table = key_string(&TableName::parse(name).unwrap());
        let mut state = self.lock();
        let key = state.source[&table].key_of(&row);
        let version = Self::log_change(&mut state, &table, ChangeOperation::Insert, key);
        let entry = state.log.iter_mut().find(|e| e.version == version).unwrap();
        entry.committed = false;
        state.uncommitted_rows.insert(version, row);
        version
    }

    pub fn commit(&self, version: i64) {
        let mut state = self.lock();
        let row = state.uncommitted_rows.remove(&version).unwrap();
        let entry = state.log.iter_mut().find(|e| e.version == version).unwrap();
        entry.committed = true;
        let table = entry.table.clone();
        state.source.get_mut(&table).unwrap().rows.push(row);
    }

    pub fn source_update(&self, name: &str, row: Vec<SqlValue>) -> i64 {
        let table = key_string(&TableName::parse(name).unwrap());
        let mut state = self.lock();
        let mem = state.source.get_mut(&table).unwrap();
        let key = mem.key_of(&row);
        let idx = mem.find(&key).unwrap();
        mem.rows[idx] = row;
        Self::log_change(&mut state, &table, ChangeOperation::Update, key)
    }

    pub fn source_delete(&self, name: &str, key: Vec<SqlValue>) -> i64 {
        let table = key_string(&TableName::parse(name).unwrap());
        let mut state = self.lock();
        let mem = state.source.get_mut(&table).unwrap();
        if let Some(idx) = mem.find(&key) {
            mem.rows.remove(idx);
        }
        Self::log_change(&mut state, &table, ChangeOperation::Delete, key)
    }

    // --- destination side ---

    pub fn create_dest_table(&self, name: &str, cols: &[(&str, &str, bool)], pk: &[&str]) {
        let table = TableName::parse(name).unwrap();
        self.lock().destination.insert(
            key_string(&table),
            MemTable {
                schema: schema(cols),
                primary_key: pk.iter().map(|s| s.to_string()).collect(),
                rows: Vec::new(),
            },
        );
    }

    pub fn dest_insert(&self, name: &str, row: Vec<SqlValue>) {
        let table = key_string(&TableName::parse(name).unwrap());
        self.lock().destination.get_mut(&table).unwrap().rows.push(row);
    }

    pub fn dest_rows(&self, name: &str) -> Vec<Vec<SqlValue>> {
        let table = key_string(&TableName::parse(name).unwrap());
        self.lock().destination[&table].rows.clone()
    }

    pub fn checkpoint(&self, job: &str) -> Option<i64> {
        self.lock().checkpoints.get(job).copied()
    }

    pub fn checkpoint_writes(&self) -> Vec<(String, i64)> {
        self.lock().checkpoint_writes.clone()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.lock().dead_letters.clone()
    }

    // --- fault injection and counters ---

    pub fn fail_connect(&self, fail: bool) {
        self.lock().fail_connect = fail;
    }

    pub fn fail_merge(&self, message: Option<&str>) {
        self.lock().fail_merge = message.map(str::to_string);
    }

    pub fn fail_dead_letters(&self, fail: bool) {
        self.lock().fail_dead_letters = fail;
    }

    pub fn delay_merge(&self, delay: Option<Duration>) {
        self.lock().merge_delay = delay;
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn open_connections(&self) -> usize {
        self.lock().open_connections
    }

    pub fn merge_calls(&self) -> usize {
        self.lock().merge_calls
    }

    /// Merges, checkpoint writes, and dead-letter appends issued so far.
    pub fn data_statements(&self) -> usize {
        self.lock().data_statements
    }

    fn open(&self) -> Result<ConnectionGuard> {
        let mut state = self.lock();
        if state.fail_connect {
            bail!("connection refused");
        }
        state.connects += 1;
        state.open_connections += 1;
        Ok(ConnectionGuard { db: self.clone() })
    }
}

/// Decrements the open-connection count when a handle is dropped.
struct ConnectionGuard {
    db: MemoryDb,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.db.lock().open_connections -= 1;
    }
}

pub struct MemoryConnector {
    db: MemoryDb,
}

#[async_trait]
impl Connector for MemoryConnector {
    type Source = MemorySource;
    type Target = MemoryTarget;

    async fn connect_source(&self, _endpoint: &str) -> Result<MemorySource> {
        Ok(MemorySource {
            _guard: self.db.open()?,
            db: self.db.clone(),
        })
    }

    async fn connect_target(&self, _endpoint: &str) -> Result<MemoryTarget> {
        Ok(MemoryTarget {
            _guard: self.db.open()?,
            db: self.db.clone(),
        })
    }
}

pub struct MemorySource {
    _guard: ConnectionGuard,
    db: MemoryDb,
}

#[async_trait]
impl ChangeSource for MemorySource {
    async fn change_tracking_enabled(&self, table: &TableName) -> bool {
        self.db.lock().tracked.contains(&key_string(table))
    }

    async fn columns(&self, table: &TableName) -> TableSchema {
        self.db
            .lock()
            .source
            .get(&key_string(table))
            .map(|t| t.schema.clone())
            .unwrap_or_default()
    }

    async fn primary_key(&self, table: &TableName) -> Vec<String> {
        self.db
            .lock()
            .source
            .get(&key_string(table))
            .map(|t| t.primary_key.clone())
            .unwrap_or_default()
    }

    async fn read_changes(
        &self,
        table: &TableName,
        columns: &[String],
        primary_key: &[String],
        since: i64,
    ) -> Result<ChangeBatch> {
        let state = self.db.lock();
        let name = key_string(table);
        let mem = state
            .source
            .get(&name)
            .ok_or_else(|| anyhow!("relation {} does not exist", name))?;

        let horizon = MemoryDb::commit_horizon(&state);
        let mut entries: Vec<&LogEntry> = state
            .log
            .iter()
            .filter(|e| e.table == name && e.version > since && e.version <= horizon)
            .collect();
        entries.sort_by_key(|e| e.version);

        let mut batch = ChangeBatch::new(columns.to_vec(), primary_key.to_vec())
            .with_checkpoint(horizon);
        for entry in entries {
            let current = mem.find(&entry.key).map(|idx| &mem.rows[idx]);
            let values = columns
                .iter()
                .map(|column| {
                    if let Some(k) = primary_key.iter().position(|pk| pk == column) {
                        entry.key[k].clone()
                    } else {
                        current
                            .and_then(|row| mem.position(column).map(|i| row[i].clone()))
                            .unwrap_or(SqlValue::Null)
                    }
                })
                .collect();
            batch.push(ChangeRecord {
                version: entry.version,
                operation: entry.operation,
                values,
            });
        }
        Ok(batch)
    }
}

pub struct MemoryTarget {
    _guard: ConnectionGuard,
    db: MemoryDb,
}

#[async_trait]
impl SyncTarget for MemoryTarget {
    async fn columns(&self, table: &TableName) -> TableSchema {
        self.db
            .lock()
            .destination
            .get(&key_string(table))
            .map(|t| t.schema.clone())
            .unwrap_or_default()
    }

    async fn last_version(&self, job: &str) -> Result<i64> {
        Ok(self.db.lock().checkpoints.get(job).copied().unwrap_or(0))
    }

    async fn set_version(&self, job: &str, version: i64) -> Result<()> {
        let mut state = self.db.lock();
        state.data_statements += 1;
        state.checkpoint_writes.push((job.to_string(), version));
        let stored = state.checkpoints.entry(job.to_string()).or_insert(0);
        *stored = (*stored).max(version);
        Ok(())
    }

    async fn merge_batch(&self, table: &TableName, batch: &ChangeBatch) -> Result<ChangeCounts> {
        let delay = {
            let mut state = self.db.lock();
            state.merge_calls += 1;
            state.data_statements += 1;
            state.merge_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.db.lock();
        if let Some(message) = state.fail_merge.clone() {
            bail!("{}", message);
        }

        let name = key_string(table);
        let dest = state
            .destination
            .get_mut(&name)
            .ok_or_else(|| anyhow!("relation {} does not exist", name))?;

        // Validate everything first so a failure leaves the table untouched.
        let positions: Vec<usize> = batch
            .columns
            .iter()
            .map(|c| dest.position(c).ok_or_else(|| anyhow!("column {} does not exist", c)))
            .collect::<Result<_>>()?;
        let key_positions = batch.key_positions()?;

        let mut rows = dest.rows.clone();
        let mut counts = ChangeCounts::default();
        for record in &batch.records {
            let key: Vec<SqlValue> = key_positions.iter().map(|&i| record.values[i].clone()).collect();
            let existing = rows.iter().position(|row| dest.key_of(row) == key);
            match (record.operation, existing) {
                (ChangeOperation::Update, Some(idx)) => {
                    for (value, &pos) in record.values.iter().zip(&positions) {
                        rows[idx][pos] = value.clone();
                    }
                    counts.updated += 1;
                }
                (ChangeOperation::Insert | ChangeOperation::Update, None) => {
                    let mut row = vec![SqlValue::Null; dest.schema.len()];
                    for (value, &pos) in record.values.iter().zip(&positions) {
                        row[pos] = value.clone();
                    }
                    rows.push(row);
                    counts.inserted += 1;
                }
                (ChangeOperation::Delete, Some(idx)) => {
                    rows.remove(idx);
                    counts.deleted += 1;
                }
                (ChangeOperation::Insert, Some(_)) | (ChangeOperation::Delete, None) => {}
            }
        }
        dest.rows = rows;
        Ok(counts)
    }

    async fn record_dead_letters(&self, entries: &[DeadLetterEntry]) -> Result<()> {
        let mut state = self.db.lock();
        if state.fail_dead_letters {
            bail!("permission denied for table sync_dead_letter");
        }
        state.data_statements += 1;
        state.dead_letters.extend_from_slice(entries);
        Ok(())
    }
}

pub const ITEM_COLUMNS: &[(&str, &str, bool)] = &[("id", "integer", false), ("val", "text", true)];

/// A tracked `public.items(id, val)` source table and a matching destination.
pub fn items_setup() -> MemoryDb {
    let db = MemoryDb::new();
    db.create_source_table("items", ITEM_COLUMNS, &["id"]);
    db.enable_tracking("items");
    db.create_dest_table("mirror.items", ITEM_COLUMNS, &["id"]);
    db
}

pub fn items_job() -> SyncJob {
    SyncJob::new("items", SOURCE_URL, TARGET_URL, "items", "mirror.items")
}

pub fn item(id: i32, val: &str) -> Vec<SqlValue> {
    vec![SqlValue::Int32(id), SqlValue::from(val)]
}
