// ABOUTME: Dead-letter entries built from a batch that failed to reconcile
// ABOUTME: Recording is best effort; failures are logged and never propagate

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::backend::SyncTarget;
use super::change::{ChangeBatch, ChangeRecord, CHANGE_OPERATION_COLUMN, CHANGE_VERSION_COLUMN};

/// One row of a failed batch as it is written to the dead-letter store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetterEntry {
    pub job_name: String,
    pub error_timestamp: DateTime<Utc>,
    pub error_message: String,
    pub record_data: String,
}

/// Render a record as `name=value` pairs joined by `|`, change-tracking
/// columns first.
///
/// `__sync_change_version=5|__sync_change_operation=I|id=1|val=a`
pub fn serialize_record(batch: &ChangeBatch, record: &ChangeRecord) -> String {
    let mut parts = Vec::with_capacity(batch.columns.len() + 2);
    parts.push(format!("{}={}", CHANGE_VERSION_COLUMN, record.version));
    parts.push(format!(
        "{}={}",
        CHANGE_OPERATION_COLUMN,
        record.operation.code()
    ));
    for (column, value) in batch.columns.iter().zip(record.values.iter()) {
        parts.push(format!("{}={}", column, value));
    }
    parts.join("|")
}

/// One entry per record in `batch`, all sharing the same error and timestamp.
pub fn build_entries(job_name: &str, error_message: &str, batch: &ChangeBatch) -> Vec<DeadLetterEntry> {
    let error_timestamp = Utc::now();
    batch
        .records
        .iter()
        .map(|record| DeadLetterEntry {
            job_name: job_name.to_string(),
            error_timestamp,
            error_message: error_message.to_string(),
            record_data: serialize_record(batch, record),
        })
        .collect()
}

/// Write every record of a failed batch to the dead-letter store.
///
/// Callers pass the batch as read from the source, so changes superseded
/// within the window are recorded too. Returns the number of entries written; 0 if the store could not be
/// written, in which case the error is logged and swallowed.
pub async fn record_failed_batch<T: SyncTarget + ?Sized>(
    target: &T,
    job_name: &str,
    error_message: &str,
    batch: &ChangeBatch,
) -> usize {
    if batch.is_empty() {
        return 0;
    }

    let entries = build_entries(job_name, error_message, batch);
    match target.record_dead_letters(&entries).await {
        Ok(()) => {
            tracing::warn!(
                "[{}] Logged {} record(s) to dead letter queue",
                job_name,
                entries.len()
            );
            entries.len()
        }
        Err(e) => {
            tracing::error!(
                "[{}] Failed to log {} record(s) to dead letter queue: {:#}",
                job_name,
                entries.len(),
                e
            );
            0
        }
    }
}
