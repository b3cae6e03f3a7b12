// ABOUTME: Change-tracking synchronization core, independent of any database driver
// ABOUTME: Batches, schema checks, the per-job state machine, and the periodic scheduler

pub mod backend;
pub mod change;
pub mod dead_letter;
pub mod job;
pub mod scheduler;
pub mod schema;
pub mod synchronizer;
pub mod table;
pub mod value;

pub use backend::{ChangeSource, Connector, SyncTarget};
pub use change::{ChangeBatch, ChangeCounts, ChangeOperation, ChangeRecord};
pub use dead_letter::{record_failed_batch, DeadLetterEntry};
pub use job::{FailureKind, SyncError, SyncJob, SyncPhase, SyncResult, SyncStatus};
pub use scheduler::{PassSummary, Scheduler, SchedulerControl, SchedulerHandle};
pub use schema::{check_compatibility, ColumnInfo, SchemaValidationResult, TableSchema};
pub use synchronizer::{ChangeTrackingSynchronizer, SyncOptions, Synchronizer};
pub use table::TableName;
pub use value::SqlValue;
