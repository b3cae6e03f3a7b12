// ABOUTME: Enable-tracking command - installs change tracking on each job's source table
// ABOUTME: Idempotent; re-running refreshes the trigger with the current primary key

use anyhow::{bail, Context, Result};

use crate::config::SyncConfig;
use crate::postgres::{connect, ChangeReader, SchemaInspector};
use crate::sync::table::TableName;
use crate::utils::validate_connection_string;

pub async fn enable_tracking(config: &SyncConfig, job: Option<&str>) -> Result<()> {
    let jobs = config.select_jobs(job)?;
    if jobs.is_empty() {
        bail!("No jobs configured");
    }

    for job in &jobs {
        validate_connection_string(&job.source_connection)
            .with_context(|| format!("Job '{}' has an invalid source connection", job.name))?;
        let table = TableName::parse(&job.source_table)
            .with_context(|| format!("Job '{}' has an invalid source table", job.name))?;

        let client = connect(&job.source_connection)
            .await
            .with_context(|| format!("Failed to connect to source for job '{}'", job.name))?;

        let primary_key = SchemaInspector::new(&client).primary_key(&table).await?;
        let reader = ChangeReader::new(&client);
        reader
            .enable_change_tracking(&table, &primary_key)
            .await
            .with_context(|| format!("Job '{}'", job.name))?;

        let horizon = reader.commit_horizon().await?;
        println!(
            "✓ {}: change tracking enabled on {} (commit horizon {})",
            job.name, table, horizon
        );
    }

    Ok(())
}
