//! Periodic sweep over the job store.
//!
//! Fails running jobs that stopped making progress, hands orphaned pending
//! jobs back to the queue and purges expired records. Runs on its own thread
//! and can be woken early through [`StallMonitor::trigger`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;
use tokio::sync::broadcast;

use crate::broadcast::JobStore;
use crate::config::MonitorConfig;
use crate::error::StoreError;
use crate::job::{ErrorKind, Job, JobError, JobStatus, LogLevel};
use crate::router::JobQueue;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub stalled: Vec<String>,
    pub requeued: Vec<String>,
    pub purged: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.stalled.is_empty() && self.requeued.is_empty() && self.purged == 0
    }
}

pub struct StallMonitor {
    store: Arc<JobStore>,
    queue: Arc<dyn JobQueue>,
    interval: Duration,
    stall_threshold: Duration,
    orphan_threshold: Duration,
    shutdown: Arc<AtomicBool>,
    trigger: broadcast::Sender<()>,
}

impl StallMonitor {
    pub fn new(store: Arc<JobStore>, queue: Arc<dyn JobQueue>, config: &MonitorConfig) -> Self {
        let (trigger, _) = broadcast::channel(16);
        Self {
            store,
            queue,
            interval: Duration::from_secs(config.interval_secs.max(1)),
            stall_threshold: Duration::from_secs(config.stall_threshold_secs),
            orphan_threshold: Duration::from_secs(config.orphan_threshold_secs),
            shutdown: Arc::new(AtomicBool::new(false)),
            trigger,
        }
    }

    /// Overrides the tick interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Runs one sweep as of `now`.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        if let Some(cutoff) = cutoff(now, self.stall_threshold) {
            for job in self.store.stale(JobStatus::Running, cutoff) {
                if self.mark_stalled(&job) {
                    report.stalled.push(job.id);
                }
            }
        }

        if let Some(cutoff) = cutoff(now, self.orphan_threshold) {
            for job in self.store.stale(JobStatus::Pending, cutoff) {
                if let Err(e) = self.queue.enqueue(&job.id) {
                    log::warn!("Could not re-enqueue orphaned job {}: {}", job.id, e);
                    continue;
                }
                if let Err(e) = self.store.add_log(
                    &job.id,
                    LogLevel::Warn,
                    "Re-enqueued after waiting too long",
                    json!({ "waiting_since": job.updated_at.to_rfc3339() }),
                ) {
                    log::warn!("Could not log re-enqueue of job {}: {}", job.id, e);
                }
                report.requeued.push(job.id);
            }
        }

        match self.store.purge_expired(now) {
            Ok(purged) => report.purged = purged,
            Err(e) => log::error!("Failed to purge expired jobs: {}", e),
        }

        if !report.is_empty() {
            log::info!(
                "Monitor sweep: {} stalled, {} re-enqueued, {} purged",
                report.stalled.len(),
                report.requeued.len(),
                report.purged
            );
        }
        report
    }

    /// Fails `job` as stalled unless it changed since this snapshot was taken.
    fn mark_stalled(&self, job: &Job) -> bool {
        let error = JobError::new(
            ErrorKind::JobStalled,
            format!(
                "No progress in stage {} since {}",
                job.stage,
                job.updated_at.to_rfc3339()
            ),
        );
        match self.store.fail_if_unchanged(&job.id, job.version, error) {
            Ok(_) => {
                log::warn!("Job {} stalled in stage {}", job.id, job.stage);
                true
            }
            Err(StoreError::AlreadyTerminal { .. }) => {
                log::debug!("Job {} finished before it could be marked stalled", job.id);
                false
            }
            Err(StoreError::Conflict(_)) => {
                log::debug!("Job {} made progress during the sweep", job.id);
                false
            }
            Err(e) => {
                log::error!("Failed to mark job {} stalled: {}", job.id, e);
                false
            }
        }
    }

    /// Starts the sweep loop in a background thread.
    pub fn start(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let monitor = Arc::clone(self);
        let mut trigger_rx = self.trigger.subscribe();

        std::thread::Builder::new()
            .name("distill-monitor".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        log::error!("Monitor could not build its runtime: {}", e);
                        return;
                    }
                };

                rt.block_on(async {
                    let mut timer = tokio::time::interval(monitor.interval);
                    timer.tick().await; // skip immediate first tick

                    loop {
                        if monitor.is_stopped() {
                            break;
                        }

                        tokio::select! {
                            _ = timer.tick() => {},
                            Ok(()) = trigger_rx.recv() => {
                                log::debug!("Monitor sweep triggered");
                            },
                        }

                        if monitor.is_stopped() {
                            break;
                        }
                        monitor.sweep(Utc::now());
                    }
                });
                log::debug!("Monitor stopped");
            })
    }

    /// Requests an immediate sweep from the running loop.
    pub fn trigger(&self) {
        let _ = self.trigger.send(());
    }

    /// Signals the loop to stop and wakes it.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.trigger();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

fn cutoff(now: DateTime<Utc>, threshold: Duration) -> Option<DateTime<Utc>> {
    let delta = TimeDelta::from_std(threshold).ok()?;
    now.checked_sub_signed(delta)
}
