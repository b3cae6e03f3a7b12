// ABOUTME: Pre-flight report for a sync job without moving any data
// ABOUTME: Checks configuration, connectivity, change tracking, keys, schema, and checkpoint state

use std::time::Duration;

use crate::postgres::{
    connect_with_timeout, ChangeReader, DeadLetterQueue, SchemaInspector, VersionStore,
};
use crate::sync::job::SyncJob;
use crate::sync::schema::check_compatibility;
use crate::sync::table::TableName;
use crate::utils::{same_database, validate_connection_string, validate_identifiers};

/// Individual check result
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub details: Vec<String>,
}

impl CheckResult {
    pub fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details.push(details.into());
        self
    }
}

/// Issue with suggested fixes
#[derive(Debug, Clone)]
pub struct PreflightIssue {
    pub title: String,
    pub explanation: String,
    pub fixes: Vec<String>,
}

/// Complete pre-flight results for one job
#[derive(Debug, Default)]
pub struct PreflightResult {
    pub job_name: String,
    pub configuration: Vec<CheckResult>,
    pub network: Vec<CheckResult>,
    pub source: Vec<CheckResult>,
    pub destination: Vec<CheckResult>,
    pub issues: Vec<PreflightIssue>,
}

impl PreflightResult {
    pub fn new(job_name: &str) -> Self {
        Self {
            job_name: job_name.to_string(),
            ..Self::default()
        }
    }

    pub fn all_passed(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn failed_count(&self) -> usize {
        self.issues.len()
    }

    fn issue(&mut self, title: &str, explanation: String, fixes: &[&str]) {
        self.issues.push(PreflightIssue {
            title: title.to_string(),
            explanation,
            fixes: fixes.iter().map(|f| f.to_string()).collect(),
        });
    }

    /// Print formatted output
    pub fn print(&self) {
        println!();
        println!("Pre-flight Checks: {}", self.job_name);
        println!("{}", "═".repeat(61));
        println!();

        print_section("Configuration:", &self.configuration);
        print_section("Connectivity:", &self.network);
        print_section("Source:", &self.source);
        print_section("Destination:", &self.destination);

        println!("{}", "═".repeat(61));
        if self.all_passed() {
            println!("PASSED: All pre-flight checks successful");
        } else {
            println!("FAILED: {} issue(s) must be resolved", self.failed_count());
            println!();
            for (i, issue) in self.issues.iter().enumerate() {
                println!("Issue {}: {}", i + 1, issue.title);
                println!("  {}", issue.explanation);
                if !issue.fixes.is_empty() {
                    println!();
                    println!("  Fix options:");
                    for fix in &issue.fixes {
                        println!("    • {}", fix);
                    }
                }
                println!();
            }
        }
    }
}

fn print_section(title: &str, checks: &[CheckResult]) {
    if checks.is_empty() {
        return;
    }
    println!("{}", title);
    for check in checks {
        let icon = if check.passed { "✓" } else { "✗" };
        println!("  {} {}", icon, check.message);
        for detail in &check.details {
            println!("      {}", detail);
        }
    }
    println!();
}

/// Run every check for `job`. Later groups are skipped when an earlier one
/// makes them meaningless (no connection, unparseable table name).
pub async fn run_preflight_checks(job: &SyncJob, statement_timeout: Duration) -> PreflightResult {
    let mut result = PreflightResult::new(&job.name);

    let Some((source_table, destination_table)) = check_configuration(&mut result, job) else {
        return result;
    };

    let source = match connect_with_timeout(&job.source_connection, statement_timeout).await {
        Ok(client) => {
            result
                .network
                .push(CheckResult::pass("source", "Connected to source database"));
            Some(client)
        }
        Err(e) => {
            result.network.push(
                CheckResult::fail("source", "Cannot connect to source database")
                    .with_details(format!("{:#}", e)),
            );
            result.issue(
                "Source database unreachable",
                format!("{:#}", e),
                &["Check host, port, credentials, and network access for source_connection"],
            );
            None
        }
    };
    let destination =
        match connect_with_timeout(&job.destination_connection, statement_timeout).await {
            Ok(client) => {
                result.network.push(CheckResult::pass(
                    "destination",
                    "Connected to destination database",
                ));
                Some(client)
            }
            Err(e) => {
                result.network.push(
                    CheckResult::fail("destination", "Cannot connect to destination database")
                        .with_details(format!("{:#}", e)),
                );
                result.issue(
                    "Destination database unreachable",
                    format!("{:#}", e),
                    &["Check host, port, credentials, and network access for destination_connection"],
                );
                None
            }
        };

    let (Some(source), Some(destination)) = (source, destination) else {
        return result;
    };

    let source_inspector = SchemaInspector::new(&source);
    let destination_inspector = SchemaInspector::new(&destination);

    match source_inspector.table_exists(&source_table).await {
        Ok(true) => result
            .source
            .push(CheckResult::pass("table", format!("{} exists", source_table))),
        Ok(false) => {
            result.source.push(CheckResult::fail(
                "table",
                format!("{} not found", source_table),
            ));
            result.issue(
                "Source table missing",
                format!("Table {} does not exist in the source database", source_table),
                &["Check source_table in the job configuration"],
            );
            return result;
        }
        Err(e) => {
            result.source.push(
                CheckResult::fail("table", "Could not look up source table")
                    .with_details(format!("{:#}", e)),
            );
            result.issue("Source table lookup failed", format!("{:#}", e), &[]);
            return result;
        }
    }

    match source_inspector.change_tracking_enabled(&source_table).await {
        Ok(true) => result.source.push(CheckResult::pass(
            "tracking",
            format!("Change tracking enabled on {}", source_table),
        )),
        Ok(false) => {
            result.source.push(CheckResult::fail(
                "tracking",
                format!("Change tracking not enabled on {}", source_table),
            ));
            result.issue(
                "Change tracking disabled",
                format!("No change tracking trigger on source table {}", source_table),
                &["Run: table-replicator enable-tracking --job <name>"],
            );
        }
        Err(e) => {
            result.source.push(
                CheckResult::fail("tracking", "Could not check change tracking")
                    .with_details(format!("{:#}", e)),
            );
            result.issue("Change tracking check failed", format!("{:#}", e), &[]);
        }
    }

    match source_inspector.primary_key(&source_table).await {
        Ok(pk) if !pk.is_empty() => result.source.push(CheckResult::pass(
            "primary_key",
            format!("Primary key: {}", pk.join(", ")),
        )),
        Ok(_) => {
            result.source.push(CheckResult::fail(
                "primary_key",
                format!("{} has no primary key", source_table),
            ));
            result.issue(
                "Missing primary key",
                format!(
                    "Table {} has no primary key. Change tracking synchronization requires a primary key.",
                    source_table
                ),
                &["Add a PRIMARY KEY constraint to the source table"],
            );
        }
        Err(e) => {
            result.source.push(
                CheckResult::fail("primary_key", "Could not read primary key")
                    .with_details(format!("{:#}", e)),
            );
            result.issue("Primary key lookup failed", format!("{:#}", e), &[]);
        }
    }

    check_schema(
        &mut result,
        &source_inspector,
        &source_table,
        &destination_inspector,
        &destination_table,
    )
    .await;

    check_versions(&mut result, job, &source, &destination, &source_table).await;

    result
}

fn check_configuration(result: &mut PreflightResult, job: &SyncJob) -> Option<(TableName, TableName)> {
    let mut ok = true;

    for (label, url) in [
        ("source_connection", &job.source_connection),
        ("destination_connection", &job.destination_connection),
    ] {
        match validate_connection_string(url) {
            Ok(()) => result
                .configuration
                .push(CheckResult::pass(label, format!("{} is well formed", label))),
            Err(e) => {
                ok = false;
                result
                    .configuration
                    .push(CheckResult::fail(label, format!("{} is invalid", label)));
                result.issue("Invalid connection string", format!("{}: {:#}", label, e), &[]);
            }
        }
    }

    let mut tables = Vec::with_capacity(2);
    for (label, raw) in [
        ("source_table", &job.source_table),
        ("destination_table", &job.destination_table),
    ] {
        match TableName::parse(raw) {
            Ok(table) => {
                result
                    .configuration
                    .push(CheckResult::pass(label, format!("{} = {}", label, table)));
                tables.push(table);
            }
            Err(e) => {
                ok = false;
                result
                    .configuration
                    .push(CheckResult::fail(label, format!("{} is invalid", label)));
                result.issue(
                    "Invalid table name",
                    format!("{}: {:#}", label, e),
                    &["Use 'table' or 'schema.table' with letters, digits, and underscores"],
                );
            }
        }
    }

    if !ok || tables.len() != 2 {
        return None;
    }
    let destination_table = tables.pop()?;
    let source_table = tables.pop()?;

    if source_table == destination_table
        && same_database(&job.source_connection, &job.destination_connection)
    {
        result.configuration.push(CheckResult::fail(
            "distinct",
            "Source and destination are the same table",
        ));
        result.issue(
            "Source and destination are identical",
            format!("Both sides point at {}", source_table),
            &["Point destination_connection or destination_table somewhere else"],
        );
        return None;
    }

    Some((source_table, destination_table))
}

async fn check_schema(
    result: &mut PreflightResult,
    source_inspector: &SchemaInspector<'_>,
    source_table: &TableName,
    destination_inspector: &SchemaInspector<'_>,
    destination_table: &TableName,
) {
    let source_schema = match source_inspector.columns(source_table).await {
        Ok(schema) => schema,
        Err(e) => {
            result.issue("Source column lookup failed", format!("{:#}", e), &[]);
            return;
        }
    };
    let destination_schema = match destination_inspector.columns(destination_table).await {
        Ok(schema) if !schema.is_empty() => schema,
        Ok(_) => {
            result.destination.push(CheckResult::fail(
                "table",
                format!("{} not found", destination_table),
            ));
            result.issue(
                "Destination table missing",
                format!("Table {} does not exist in the destination", destination_table),
                &["Create the destination table with the source's columns and primary key"],
            );
            return;
        }
        Err(e) => {
            result.issue("Destination column lookup failed", format!("{:#}", e), &[]);
            return;
        }
    };

    if let Err(e) = validate_identifiers(&source_schema.names()) {
        result.source.push(CheckResult::fail("columns", "Unsupported column name"));
        result.issue("Unsupported column name", format!("{:#}", e), &[]);
    }

    let validation = check_compatibility(
        source_table,
        &source_schema,
        destination_table,
        &destination_schema,
    );
    if validation.is_valid {
        let mut check = CheckResult::pass(
            "schema",
            format!(
                "Schema compatible ({} column(s), {} warning(s))",
                source_schema.len(),
                validation.warnings.len()
            ),
        );
        for warning in validation.warnings {
            check = check.with_details(format!("warning: {}", warning));
        }
        result.destination.push(check);
    } else {
        let message = validation.error_message.unwrap_or_default();
        result
            .destination
            .push(CheckResult::fail("schema", "Schema incompatible").with_details(message.clone()));
        result.issue(
            "Schema validation failed",
            message,
            &["Add the missing column to the destination table"],
        );
    }
}

async fn check_versions(
    result: &mut PreflightResult,
    job: &SyncJob,
    source: &tokio_postgres::Client,
    destination: &tokio_postgres::Client,
    source_table: &TableName,
) {
    let checkpoint = match VersionStore::new(destination).get(&job.name).await {
        Ok(Some(checkpoint)) => {
            result.destination.push(CheckResult::pass(
                "checkpoint",
                format!("Checkpoint at version {}", checkpoint.last_sync_version),
            ));
            checkpoint.last_sync_version
        }
        Ok(None) => {
            result.destination.push(CheckResult::pass(
                "checkpoint",
                "No checkpoint yet; first run reads all logged changes",
            ));
            0
        }
        Err(e) => {
            result.destination.push(
                CheckResult::fail("checkpoint", "Cannot read or create sync_metadata")
                    .with_details(format!("{:#}", e)),
            );
            result.issue(
                "Checkpoint store unavailable",
                format!("{:#}", e),
                &["Grant CREATE and INSERT/UPDATE on the destination schema"],
            );
            return;
        }
    };

    let reader = ChangeReader::new(source);
    if let (Ok(current), Ok(pending)) = (
        reader.commit_horizon().await,
        reader.pending_changes(source_table, checkpoint).await,
    ) {
        result.source.push(CheckResult::pass(
            "versions",
            format!(
                "Commit horizon {}; {} change(s) pending since checkpoint {}",
                current, pending, checkpoint
            ),
        ));
    }

    if let Ok(pending) = DeadLetterQueue::new(destination)
        .list(Some(&job.name), false, 1000)
        .await
    {
        if !pending.is_empty() {
            result.destination.push(
                CheckResult::pass("dead_letters", "Dead letter queue has unprocessed entries")
                    .with_details(format!(
                        "{} unprocessed entr{} (see: table-replicator dead-letters list --job {})",
                        pending.len(),
                        if pending.len() == 1 { "y" } else { "ies" },
                        job.name
                    )),
            );
        }
    }
}
