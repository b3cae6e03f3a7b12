// ABOUTME: Validate command - pre-flight report for each configured job
// ABOUTME: Fails when any job has a blocking issue

use anyhow::{bail, Result};

use crate::config::SyncConfig;
use crate::preflight::run_preflight_checks;

pub async fn validate(config: &SyncConfig, job: Option<&str>) -> Result<()> {
    let jobs = config.select_jobs(job)?;
    if jobs.is_empty() {
        bail!("No jobs configured");
    }

    let mut failed = Vec::new();
    for job in &jobs {
        let result = run_preflight_checks(job, config.operation_timeout()).await;
        result.print();
        if !result.all_passed() {
            failed.push(job.name.clone());
        }
    }

    if !failed.is_empty() {
        bail!("Validation failed for: {}", failed.join(", "));
    }

    tracing::info!("All {} job(s) ready to sync", jobs.len());
    Ok(())
}
