// ABOUTME: CLI entry point for table-replicator
// ABOUTME: Parses commands, loads the job configuration, and routes to handlers

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use table_replicator::commands;
use table_replicator::config::SyncConfig;

#[derive(Parser)]
#[command(name = "table-replicator")]
#[command(about = "Incremental PostgreSQL table mirroring driven by change tracking", long_about = None)]
#[command(version)]
struct Cli {
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Path to the job configuration file
    #[arg(
        long,
        short = 'c',
        env = "TABLE_REPLICATOR_CONFIG",
        global = true,
        default_value = "table-replicator.toml"
    )]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synchronize jobs every sync_interval_minutes until stopped
    Run {
        /// Run a single pass and exit (non-zero exit if any job fails)
        #[arg(long)]
        once: bool,
        /// Only this job
        #[arg(long)]
        job: Option<String>,
        /// With --once, print results as JSON
        #[arg(long, requires = "once")]
        json: bool,
    },
    /// Check configuration, connectivity, change tracking, keys, and schemas
    Validate {
        #[arg(long)]
        job: Option<String>,
    },
    /// Install change tracking on the source tables of the configured jobs
    EnableTracking {
        #[arg(long)]
        job: Option<String>,
    },
    /// Delete change-log entries that every job reading the table has applied
    PruneChanges {
        /// Only the source table of this job
        #[arg(long)]
        job: Option<String>,
        /// Report what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },
    /// Inspect or acknowledge dead-lettered records
    DeadLetters(commands::DeadLetterArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    table_replicator::postgres::connection::init_tls_policy(cli.allow_self_signed_certs);

    let config = SyncConfig::load(&cli.config)?;

    match cli.command {
        Commands::Run { once, job, json } => {
            commands::run(&config, job.as_deref(), once, json).await
        }
        Commands::Validate { job } => commands::validate(&config, job.as_deref()).await,
        Commands::EnableTracking { job } => {
            commands::enable_tracking(&config, job.as_deref()).await
        }
        Commands::PruneChanges { job, dry_run } => {
            commands::prune_changes(&config, job.as_deref(), dry_run).await
        }
        Commands::DeadLetters(args) => commands::dead_letters::command(&config, args).await,
    }
}
