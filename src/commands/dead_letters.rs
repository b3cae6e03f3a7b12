// ABOUTME: Dead-letters command - list and acknowledge failed records per job
// ABOUTME: Entries live in each job's destination database

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};

use crate::config::SyncConfig;
use crate::postgres::{connect, AckSelection, DeadLetterQueue};

#[derive(Args)]
pub struct DeadLetterArgs {
    #[command(subcommand)]
    command: DeadLetterCommands,
}

#[derive(Subcommand)]
enum DeadLetterCommands {
    /// Show dead-lettered records, newest first
    List {
        /// Only this job (default: every configured job)
        #[arg(long)]
        job: Option<String>,
        /// Include entries already marked processed
        #[arg(long)]
        all: bool,
        /// Maximum entries per job
        #[arg(long, default_value_t = 100)]
        limit: i64,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Mark entries as processed
    Ack {
        #[arg(long)]
        job: String,
        /// Entry ids (comma-separated)
        #[arg(long, value_delimiter = ',', required_unless_present = "all")]
        ids: Vec<i64>,
        /// Acknowledge every unprocessed entry of the job
        #[arg(long, conflicts_with = "ids")]
        all: bool,
    },
}

pub async fn command(config: &SyncConfig, args: DeadLetterArgs) -> Result<()> {
    match args.command {
        DeadLetterCommands::List {
            job,
            all,
            limit,
            json,
        } => list(config, job.as_deref(), all, limit, json).await,
        DeadLetterCommands::Ack { job, ids, all } => {
            let selection = if all {
                AckSelection::All
            } else {
                AckSelection::Ids(ids)
            };
            ack(config, &job, &selection).await
        }
    }
}

async fn list(
    config: &SyncConfig,
    job: Option<&str>,
    include_processed: bool,
    limit: i64,
    json: bool,
) -> Result<()> {
    if limit <= 0 {
        bail!("--limit must be positive");
    }

    let mut all_entries = Vec::new();
    for job in config.select_jobs(job)? {
        let client = connect(&job.destination_connection)
            .await
            .with_context(|| format!("Failed to connect to destination for job '{}'", job.name))?;
        let entries = DeadLetterQueue::new(&client)
            .list(Some(&job.name), include_processed, limit)
            .await?;
        all_entries.extend(entries);
    }

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&all_entries).context("Failed to serialize entries")?
        );
        return Ok(());
    }

    if all_entries.is_empty() {
        println!("No dead letter entries");
        return Ok(());
    }

    for entry in &all_entries {
        let state = if entry.processed { "processed" } else { "pending" };
        println!(
            "#{} [{}] {} {}",
            entry.id,
            entry.job_name,
            entry.error_timestamp.to_rfc3339(),
            state
        );
        println!("    error:  {}", entry.error_message);
        println!("    record: {}", entry.record_data);
    }
    Ok(())
}

async fn ack(config: &SyncConfig, job: &str, selection: &AckSelection) -> Result<()> {
    let job = config
        .select_jobs(Some(job))?
        .into_iter()
        .next()
        .context("job not found")?;

    let client = connect(&job.destination_connection)
        .await
        .with_context(|| format!("Failed to connect to destination for job '{}'", job.name))?;
    let updated = DeadLetterQueue::new(&client)
        .mark_processed(&job.name, selection)
        .await?;

    println!("Marked {} entr{} as processed", updated, if updated == 1 { "y" } else { "ies" });
    Ok(())
}
