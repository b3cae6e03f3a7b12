// ABOUTME: TOML job configuration: schedule, operation timeout, and job definitions
// ABOUTME: Validates structure at load; connection strings are checked when a job runs

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::sync::job::SyncJob;

fn default_sync_interval_minutes() -> u64 {
    15
}

fn default_operation_timeout_secs() -> u64 {
    300
}

fn default_enabled() -> bool {
    true
}

/// Top-level configuration file.
///
/// ```toml
/// sync_interval_minutes = 15
/// operation_timeout_secs = 300
///
/// [[jobs]]
/// name = "orders"
/// source_connection = "postgresql://app@primary/sales"
/// destination_connection = "postgresql://etl@warehouse/mirror"
/// source_table = "public.orders"
/// destination_table = "mirror.orders"
/// enabled = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    #[serde(default = "default_sync_interval_minutes")]
    pub sync_interval_minutes: u64,

    /// Bound on a single change read or merge, client and server side.
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,

    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    pub name: String,
    pub source_connection: String,
    pub destination_connection: String,
    pub source_table: String,
    pub destination_table: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl From<&JobConfig> for SyncJob {
    fn from(config: &JobConfig) -> Self {
        let mut job = SyncJob::new(
            &config.name,
            &config.source_connection,
            &config.destination_connection,
            &config.source_table,
            &config.destination_table,
        );
        job.enabled = config.enabled;
        job
    }
}

impl SyncConfig {
    /// Read, parse, and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: SyncConfig = toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks. Job names key checkpoints and dead letters, so they
    /// must be present and unique.
    pub fn validate(&self) -> Result<()> {
        if self.sync_interval_minutes == 0 {
            bail!("sync_interval_minutes must be greater than zero");
        }
        if self.operation_timeout_secs == 0 {
            bail!("operation_timeout_secs must be greater than zero");
        }

        let mut seen = HashSet::new();
        for job in &self.jobs {
            if job.name.trim().is_empty() {
                bail!("every job needs a non-empty name");
            }
            if !seen.insert(job.name.as_str()) {
                bail!("duplicate job name '{}'", job.name);
            }
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_minutes * 60)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn jobs(&self) -> Vec<SyncJob> {
        self.jobs.iter().map(SyncJob::from).collect()
    }

    /// Jobs to act on: all of them, or the one named `name`.
    pub fn select_jobs(&self, name: Option<&str>) -> Result<Vec<SyncJob>> {
        match name {
            None => Ok(self.jobs()),
            Some(name) => match self.jobs.iter().find(|j| j.name == name) {
                Some(job) => Ok(vec![SyncJob::from(job)]),
                None => bail!("no job named '{}' in configuration", name),
            },
        }
    }
}
