// ABOUTME: Run command - one sync pass or the periodic scheduler over configured jobs
// ABOUTME: Maps Ctrl+C to shutdown and, on unix, SIGUSR1/SIGUSR2 to pause/resume

use anyhow::{bail, Context, Result};

use crate::config::SyncConfig;
use crate::postgres::PgConnector;
use crate::sync::{
    ChangeTrackingSynchronizer, PassSummary, Scheduler, SchedulerHandle, SyncOptions,
};

pub async fn run(config: &SyncConfig, job: Option<&str>, once: bool, json: bool) -> Result<()> {
    let jobs = config.select_jobs(job)?;
    if jobs.is_empty() {
        bail!("No jobs configured");
    }

    let synchronizer = ChangeTrackingSynchronizer::with_options(
        PgConnector::new(config.operation_timeout()),
        SyncOptions {
            operation_timeout: config.operation_timeout(),
        },
    );
    let scheduler = Scheduler::new(synchronizer, jobs, config.sync_interval());

    if once {
        let summary = scheduler
            .run_pass()
            .await
            .context("A sync pass is already running")?;
        report(&summary, json)?;
        if !summary.is_success() {
            bail!("{} job(s) failed", summary.failed);
        }
        return Ok(());
    }

    let handle = scheduler.handle();
    spawn_signal_handlers(handle);

    tracing::info!(
        "Running every {} minute(s); Ctrl+C stops after the current job",
        config.sync_interval_minutes
    );
    scheduler.run().await;
    Ok(())
}

fn report(summary: &PassSummary, json: bool) -> Result<()> {
    if json {
        let results: Vec<_> = summary
            .results
            .iter()
            .map(|(name, result)| serde_json::json!({ "job": name, "result": result }))
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&results).context("Failed to serialize results")?
        );
        return Ok(());
    }

    println!();
    for (name, result) in &summary.results {
        if result.success {
            println!(
                "✓ {}: {} inserted, {} updated, {} deleted, {} skipped ({}ms)",
                name,
                result.rows_inserted,
                result.rows_updated,
                result.rows_deleted,
                result.rows_skipped,
                result.duration.as_millis()
            );
        } else {
            println!(
                "✗ {}: failed while {}: {}",
                name,
                result.phase,
                result.error_message.as_deref().unwrap_or("unknown error")
            );
        }
    }
    if summary.skipped > 0 {
        println!("  ({} disabled job(s) skipped)", summary.skipped);
    }
    Ok(())
}

fn spawn_signal_handlers(handle: SchedulerHandle) {
    let shutdown = handle.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received shutdown signal");
                shutdown.shutdown();
            }
            Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::user_defined1()) {
            Ok(mut pause) => {
                let handle = handle.clone();
                tokio::spawn(async move {
                    while pause.recv().await.is_some() {
                        tracing::info!("Received SIGUSR1, pausing");
                        handle.pause();
                    }
                });
            }
            Err(e) => tracing::warn!("Failed to install SIGUSR1 handler: {}", e),
        }

        match signal(SignalKind::user_defined2()) {
            Ok(mut resume) => {
                tokio::spawn(async move {
                    while resume.recv().await.is_some() {
                        tracing::info!("Received SIGUSR2, resuming");
                        handle.resume();
                    }
                });
            }
            Err(e) => tracing::warn!("Failed to install SIGUSR2 handler: {}", e),
        }
    }
}
