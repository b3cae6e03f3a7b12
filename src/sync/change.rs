// ABOUTME: Change records read from the source change log and the batch that carries them
// ABOUTME: Handles operation tags, last-writer-wins collapsing, and tag-derived counts

use anyhow::{bail, Result};
use std::collections::HashMap;

use super::value::SqlValue;

/// Staging column holding each record's change-tracking version.
pub const CHANGE_VERSION_COLUMN: &str = "__sync_change_version";
/// Staging column holding each record's operation code (`I`, `U`, `D`).
pub const CHANGE_OPERATION_COLUMN: &str = "__sync_change_operation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    /// Single-letter code stored in the change log and the staging table.
    pub fn code(&self) -> &'static str {
        match self {
            ChangeOperation::Insert => "I",
            ChangeOperation::Update => "U",
            ChangeOperation::Delete => "D",
        }
    }

    pub fn from_code(code: &str) -> Result<Self> {
        match code.trim() {
            "I" => Ok(ChangeOperation::Insert),
            "U" => Ok(ChangeOperation::Update),
            "D" => Ok(ChangeOperation::Delete),
            other => bail!("unknown change operation code '{}'", other),
        }
    }
}

/// One changed row: its values (aligned with [`ChangeBatch::columns`]), the
/// change-tracking version, and the operation tag.
///
/// For deletes only the primary-key values are populated; the rest are null.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub version: i64,
    pub operation: ChangeOperation,
    pub values: Vec<SqlValue>,
}

/// Per-tag counts for a batch. `skipped` counts records superseded by a later
/// change to the same key inside the captured window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeCounts {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub skipped: u64,
}

impl ChangeCounts {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }
}

/// The set of changes captured for one cycle. Unit of staging, reconciliation,
/// and dead-lettering.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    pub columns: Vec<String>,
    pub primary_key: Vec<String>,
    pub records: Vec<ChangeRecord>,
    /// Version every change at or below is known to be in this batch or in an
    /// earlier one. Set by sources whose versions can become visible out of
    /// order; `None` means the highest record version is safe.
    pub checkpoint: Option<i64>,
}

impl ChangeBatch {
    pub fn new(columns: Vec<String>, primary_key: Vec<String>) -> Self {
        Self {
            columns,
            primary_key,
            records: Vec::new(),
            checkpoint: None,
        }
    }

    pub fn with_checkpoint(mut self, checkpoint: i64) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn push(&mut self, record: ChangeRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Highest change version in the batch, if any.
    pub fn max_version(&self) -> Option<i64> {
        self.records.iter().map(|r| r.version).max()
    }

    /// Version to store once the batch is applied.
    pub fn checkpoint_version(&self) -> Option<i64> {
        self.checkpoint.or_else(|| self.max_version())
    }

    pub fn has_deletes(&self) -> bool {
        self.records
            .iter()
            .any(|r| r.operation == ChangeOperation::Delete)
    }

    /// Columns that are not part of the primary key, in batch order.
    pub fn non_key_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| !self.primary_key.contains(c))
            .cloned()
            .collect()
    }

    /// Positions of the primary-key columns within `columns`.
    pub fn key_positions(&self) -> Result<Vec<usize>> {
        self.primary_key
            .iter()
            .map(|pk| match self.columns.iter().position(|c| c == pk) {
                Some(idx) => Ok(idx),
                None => bail!("primary key column '{}' is not part of the batch", pk),
            })
            .collect()
    }

    /// Value of `column` for `record`, if the column is part of the batch.
    pub fn value<'a>(&self, record: &'a ChangeRecord, column: &str) -> Option<&'a SqlValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|idx| record.values.get(idx))
    }

    /// Counts per operation tag. Reflects intended effect, not rows the engine
    /// reports as affected.
    pub fn counts(&self) -> ChangeCounts {
        let mut counts = ChangeCounts::default();
        for record in &self.records {
            match record.operation {
                ChangeOperation::Insert => counts.inserted += 1,
                ChangeOperation::Update => counts.updated += 1,
                ChangeOperation::Delete => counts.deleted += 1,
            }
        }
        counts
    }

    /// Reduce the batch to one record per primary key, keeping the change with
    /// the highest version.
    ///
    /// The surviving tag is adjusted so the net effect is right for a
    /// destination that reflects the state before the window:
    /// insert then update stays an insert, delete then re-insert becomes an
    /// update. Returns the collapsed batch and the number of superseded records.
    pub fn collapse(self) -> Result<(ChangeBatch, u64)> {
        let positions = self.key_positions()?;
        let ChangeBatch {
            columns,
            primary_key,
            mut records,
            checkpoint,
        } = self;

        records.sort_by_key(|r| r.version);

        let mut slots: HashMap<String, usize> = HashMap::new();
        let mut kept: Vec<ChangeRecord> = Vec::with_capacity(records.len());
        let mut superseded = 0u64;

        for mut record in records {
            let key = record_key(&record, &positions);
            match slots.get(&key) {
                Some(&slot) => {
                    let earlier = kept[slot].operation;
                    record.operation = match (earlier, record.operation) {
                        (ChangeOperation::Insert, ChangeOperation::Update) => {
                            ChangeOperation::Insert
                        }
                        (ChangeOperation::Delete, ChangeOperation::Insert) => {
                            ChangeOperation::Update
                        }
                        (_, later) => later,
                    };
                    kept[slot] = record;
                    superseded += 1;
                }
                None => {
                    slots.insert(key, kept.len());
                    kept.push(record);
                }
            }
        }

        kept.sort_by_key(|r| r.version);

        Ok((
            ChangeBatch {
                columns,
                primary_key,
                records: kept,
                checkpoint,
            },
            superseded,
        ))
    }
}

fn record_key(record: &ChangeRecord, positions: &[usize]) -> String {
    positions
        .iter()
        .map(|&idx| {
            record
                .values
                .get(idx)
                .map(|v| format!("{}:{}", v.kind(), v))
                .unwrap_or_default()
        })
        .collect::<Vec<_>>()
        .join("\u{1f}")
}
