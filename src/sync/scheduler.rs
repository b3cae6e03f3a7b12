// ABOUTME: Periodic host loop that runs one synchronization pass per interval
// ABOUTME: Single-flight passes, sequential jobs, and pause/resume/shutdown control

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio::time::{interval, MissedTickBehavior};

use super::job::{SyncJob, SyncResult, SyncStatus};
use super::synchronizer::Synchronizer;

/// Requested scheduler state, broadcast to the loop and to running passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerControl {
    Running,
    Paused,
    Stopped,
}

/// Controls a running [`Scheduler`] from other tasks or signal handlers.
///
/// None of these abort a job that is already synchronizing.
#[derive(Clone)]
pub struct SchedulerHandle {
    control: Arc<watch::Sender<SchedulerControl>>,
}

impl SchedulerHandle {
    /// Stop starting new passes until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.transition(SchedulerControl::Paused);
    }

    pub fn resume(&self) {
        self.transition(SchedulerControl::Running);
    }

    /// Stop the loop once the in-flight job finishes. Jobs of the current
    /// pass that have not started yet are marked cancelled.
    pub fn shutdown(&self) {
        self.control.send_replace(SchedulerControl::Stopped);
    }

    pub fn state(&self) -> SchedulerControl {
        *self.control.borrow()
    }

    fn transition(&self, next: SchedulerControl) {
        self.control.send_if_modified(|current| {
            if *current == SchedulerControl::Stopped || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

/// Outcome of one pass over the job list.
#[derive(Debug, Clone, Default)]
pub struct PassSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Disabled jobs.
    pub skipped: usize,
    /// Jobs not started because shutdown was requested mid-pass.
    pub cancelled: usize,
    pub duration: Duration,
    pub results: Vec<(String, SyncResult)>,
}

impl PassSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Owns the job list and triggers a pass every `interval`.
///
/// A tick that arrives while the previous pass is still running is dropped,
/// not queued.
pub struct Scheduler<S> {
    synchronizer: Arc<S>,
    jobs: Arc<Mutex<Vec<SyncJob>>>,
    interval: Duration,
    in_flight: Arc<Mutex<()>>,
    control: Arc<watch::Sender<SchedulerControl>>,
}

impl<S> Clone for Scheduler<S> {
    fn clone(&self) -> Self {
        Self {
            synchronizer: Arc::clone(&self.synchronizer),
            jobs: Arc::clone(&self.jobs),
            interval: self.interval,
            in_flight: Arc::clone(&self.in_flight),
            control: Arc::clone(&self.control),
        }
    }
}

impl<S: Synchronizer + 'static> Scheduler<S> {
    pub fn new(synchronizer: S, jobs: Vec<SyncJob>, interval: Duration) -> Self {
        Self::from_shared(Arc::new(synchronizer), jobs, interval)
    }

    pub fn from_shared(synchronizer: Arc<S>, jobs: Vec<SyncJob>, interval: Duration) -> Self {
        let (control, _) = watch::channel(SchedulerControl::Running);
        Self {
            synchronizer,
            jobs: Arc::new(Mutex::new(jobs)),
            interval,
            in_flight: Arc::new(Mutex::new(())),
            control: Arc::new(control),
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            control: Arc::clone(&self.control),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Snapshot of the jobs with their current status and last run time.
    pub async fn jobs(&self) -> Vec<SyncJob> {
        self.jobs.lock().await.clone()
    }

    /// Run one pass now. Returns `None` without doing anything when another
    /// pass is still in flight.
    pub async fn run_pass(&self) -> Option<PassSummary> {
        match Arc::clone(&self.in_flight).try_lock_owned() {
            Ok(guard) => Some(self.execute_pass(guard).await),
            Err(_) => {
                tracing::warn!("Previous sync pass is still running; skipping this pass");
                None
            }
        }
    }

    /// Tick until shutdown. Returns after the in-flight pass, if any, ends.
    pub async fn run(&self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut control = self.control.subscribe();

        tracing::info!(
            "Scheduler started with {} job(s), interval {:?}",
            self.jobs.lock().await.len(),
            self.interval
        );

        loop {
            tokio::select! {
                biased;

                changed = control.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *control.borrow_and_update();
                    match state {
                        SchedulerControl::Stopped => {
                            tracing::info!("Shutdown requested, waiting for the in-flight pass to finish");
                            break;
                        }
                        SchedulerControl::Paused => tracing::info!("Scheduler paused"),
                        SchedulerControl::Running => tracing::info!("Scheduler resumed"),
                    }
                }
                _ = ticker.tick() => {
                    match self.control_state() {
                        SchedulerControl::Running => self.spawn_pass(),
                        SchedulerControl::Paused => tracing::debug!("Scheduler paused, skipping tick"),
                        SchedulerControl::Stopped => break,
                    }
                }
            }
        }

        let _idle = self.in_flight.lock().await;
        tracing::info!("Scheduler stopped");
    }

    fn spawn_pass(&self) {
        match Arc::clone(&self.in_flight).try_lock_owned() {
            Ok(guard) => {
                let scheduler = self.clone();
                tokio::spawn(async move {
                    scheduler.execute_pass(guard).await;
                });
            }
            Err(_) => {
                tracing::warn!("Previous sync pass is still running; dropping this tick");
            }
        }
    }

    fn control_state(&self) -> SchedulerControl {
        *self.control.borrow()
    }

    async fn execute_pass(&self, _guard: OwnedMutexGuard<()>) -> PassSummary {
        let start = Instant::now();
        let snapshot = self.jobs().await;
        let mut summary = PassSummary::default();

        for job in &snapshot {
            if !job.enabled {
                tracing::debug!("[{}] Job disabled, skipping", job.name);
                summary.skipped += 1;
                continue;
            }

            if self.control_state() == SchedulerControl::Stopped {
                self.update_job(&job.name, |j| j.status = SyncStatus::Cancelled)
                    .await;
                summary.cancelled += 1;
                continue;
            }

            self.update_job(&job.name, |j| j.status = SyncStatus::Running)
                .await;
            let result = self.synchronizer.synchronize(job).await;
            let status = if result.success {
                summary.succeeded += 1;
                SyncStatus::Success
            } else {
                summary.failed += 1;
                SyncStatus::Failed
            };
            let finished_at = result.timestamp;
            self.update_job(&job.name, |j| {
                j.status = status;
                j.last_run = Some(finished_at);
            })
            .await;
            summary.results.push((job.name.clone(), result));
        }

        summary.duration = start.elapsed();
        tracing::info!(
            "Sync pass completed: {} succeeded, {} failed, {} disabled in {}ms",
            summary.succeeded,
            summary.failed,
            summary.skipped,
            summary.duration.as_millis()
        );
        if summary.cancelled > 0 {
            tracing::warn!(
                "{} job(s) cancelled by shutdown before they started",
                summary.cancelled
            );
        }
        summary
    }

    async fn update_job<F>(&self, name: &str, apply: F)
    where
        F: FnOnce(&mut SyncJob),
    {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.iter_mut().find(|j| j.name == name) {
            apply(job);
        }
    }
}
