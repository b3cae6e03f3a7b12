// ABOUTME: Prune-changes command - deletes change-log entries every reader has applied
// ABOUTME: Horizon per source table is the lowest checkpoint among the jobs reading it

use anyhow::{bail, Context, Result};

use crate::config::SyncConfig;
use crate::postgres::{connect, ChangeReader, VersionStore};
use crate::sync::job::SyncJob;
use crate::sync::table::TableName;
use crate::utils::{same_database, sanitize_url, validate_connection_string};

/// Jobs that read the same source table in the same database.
#[derive(Debug)]
struct SourceGroup {
    source_connection: String,
    table: TableName,
    jobs: Vec<SyncJob>,
}

fn group_by_source(jobs: Vec<SyncJob>) -> Result<Vec<SourceGroup>> {
    let mut groups: Vec<SourceGroup> = Vec::new();
    for job in jobs {
        let table = TableName::parse(&job.source_table)
            .with_context(|| format!("Job '{}' has an invalid source table", job.name))?;
        match groups.iter_mut().find(|g| {
            g.table == table && same_database(&g.source_connection, &job.source_connection)
        }) {
            Some(group) => group.jobs.push(job),
            None => groups.push(SourceGroup {
                source_connection: job.source_connection.clone(),
                table,
                jobs: vec![job],
            }),
        }
    }
    Ok(groups)
}

/// Highest checkpoint every reader has reached. `None` while any reader has
/// no checkpoint yet.
fn prune_horizon(checkpoints: &[Option<i64>]) -> Option<i64> {
    let mut horizon: Option<i64> = None;
    for checkpoint in checkpoints {
        let value = (*checkpoint)?;
        horizon = Some(horizon.map_or(value, |h| h.min(value)));
    }
    horizon.filter(|h| *h > 0)
}

/// Prune the change log of every source table, or only the table read by
/// `job`. Disabled jobs still hold back the horizon of their table.
pub async fn prune_changes(config: &SyncConfig, job: Option<&str>, dry_run: bool) -> Result<()> {
    let all_jobs = config.jobs();
    if all_jobs.is_empty() {
        bail!("No jobs configured");
    }
    let selected = config.select_jobs(job)?;

    for group in group_by_source(all_jobs)? {
        if !selected.iter().any(|s| group.jobs.iter().any(|j| j.name == s.name)) {
            continue;
        }

        let mut checkpoints = Vec::with_capacity(group.jobs.len());
        for job in &group.jobs {
            validate_connection_string(&job.destination_connection).with_context(|| {
                format!("Job '{}' has an invalid destination connection", job.name)
            })?;
            let client = connect(&job.destination_connection).await.with_context(|| {
                format!("Failed to connect to destination for job '{}'", job.name)
            })?;
            let checkpoint = VersionStore::new(&client).get(&job.name).await?;
            checkpoints.push(checkpoint.map(|c| c.last_sync_version));
        }

        let Some(horizon) = prune_horizon(&checkpoints) else {
            println!(
                "- {}: skipped, not every job reading it has a checkpoint yet",
                group.table
            );
            continue;
        };

        validate_connection_string(&group.source_connection)?;
        let client = connect(&group.source_connection).await.with_context(|| {
            format!(
                "Failed to connect to source {}",
                sanitize_url(&group.source_connection)
            )
        })?;
        let reader = ChangeReader::new(&client);

        if dry_run {
            let total = reader.pending_changes(&group.table, 0).await?;
            let kept = reader.pending_changes(&group.table, horizon).await?;
            println!(
                "- {}: would prune {} change(s) through checkpoint {}",
                group.table,
                total - kept,
                horizon
            );
            continue;
        }

        let removed = reader.prune(&group.table, horizon).await?;
        println!(
            "✓ {}: pruned {} change(s) through checkpoint {}",
            group.table, removed, horizon
        );
    }

    Ok(())
}
