use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::context::{StageContext, StageServices};
use super::error::StageError;
use super::registry::{resolve, StageSpec};
use crate::broadcast::{JobStore, JobUpdate, StartOutcome};
use crate::error::StoreError;
use crate::job::{Job, JobError, JobStatus, LogLevel, Source};
use crate::storage::{ResultSink, SavedResult};

/// Drives one job through its pipeline.
pub struct StageExecutor {
    store: Arc<JobStore>,
    services: StageServices,
    sink: Arc<dyn ResultSink>,
    stage_timeout: Duration,
}

impl StageExecutor {
    pub fn new(
        store: Arc<JobStore>,
        services: StageServices,
        sink: Arc<dyn ResultSink>,
        stage_timeout: Duration,
    ) -> Self {
        Self {
            store,
            services,
            sink,
            stage_timeout,
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Runs the job if it is still pending and returns its final snapshot.
    ///
    /// Every failure is recorded on the job; nothing is returned as an error.
    /// `None` means the job could not be read at all.
    pub async fn process_job(&self, job_id: &str) -> Option<Job> {
        let job = match self.store.get(job_id) {
            Ok(job) => job,
            Err(e) => {
                warn!("Cannot process job {}: {}", job_id, e);
                return None;
            }
        };
        if job.status != JobStatus::Pending {
            debug!("Job {} is {}, skipping", job_id, job.status);
            return Some(job);
        }

        let job = match self.store.try_start(job_id) {
            Ok(StartOutcome::Started(job)) => job,
            Ok(StartOutcome::NotPending(job)) => {
                debug!("Job {} was claimed by another worker", job_id);
                return Some(job);
            }
            Err(e) => {
                warn!("Failed to start job {}: {}", job_id, e);
                return self.store.get(job_id).ok();
            }
        };

        let span = info_span!("pipeline",
            job_id = %job.id,
            tool_type = %job.tool_type,
            content_type = %job.content_type,
        );
        self.run(job).instrument(span).await
    }

    async fn run(&self, job: Job) -> Option<Job> {
        let id = job.id.clone();
        let pipeline = match resolve(job.tool_type, job.content_type) {
            Ok(pipeline) => pipeline,
            Err(e) => return self.fail(&id, e),
        };

        info!("Running {} stages", pipeline.stages.len());
        let started = Instant::now();
        let mut ctx = StageContext::new(job);

        for spec in pipeline.stages {
            if let Err(e) = self.run_stage(&id, spec, &mut ctx).await {
                if let Err(merge_err) = self.merge_metadata(&id, &mut ctx) {
                    warn!("Could not keep metadata of job {}: {}", id, merge_err);
                }
                return self.fail(&id, e);
            }
        }

        if let Err(e) = self.merge_metadata(&id, &mut ctx) {
            return self.fail(&id, e.into());
        }

        let Some(result) = ctx.result.take() else {
            return self.fail(&id, StageError::Internal("No result was produced".to_string()));
        };
        let job = match self.store.complete(&id, result) {
            Ok(job) => job,
            Err(e) => {
                error!("Failed to complete job {}: {}", id, e);
                return self.store.get(&id).ok();
            }
        };
        info!(
            "Job {} completed in {} ms",
            id,
            started.elapsed().as_millis()
        );

        self.save_result(&job).await;
        self.store.get(&id).ok().or(Some(job))
    }

    async fn run_stage(
        &self,
        id: &str,
        spec: &StageSpec,
        ctx: &mut StageContext,
    ) -> Result<(), StageError> {
        self.store
            .update(id, JobUpdate::stage(spec.name, spec.progress))?;
        self.store.add_log(
            id,
            LogLevel::Info,
            format!("Stage {} started", spec.name),
            json!({ "stage": spec.name, "progress": spec.progress }),
        )?;

        let started = Instant::now();
        ctx.deadline = tokio::time::Instant::now().checked_add(self.stage_timeout);
        let outcome = match tokio::time::timeout(
            self.stage_timeout,
            spec.handler.run(ctx, &self.services),
        )
        .instrument(info_span!("stage", name = spec.name))
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(StageError::Timeout {
                stage: spec.name.to_string(),
                timeout: self.stage_timeout,
            }),
        };

        self.flush_provider_failures(id, ctx);
        outcome?;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        debug!("Stage {} finished in {} ms", spec.name, elapsed_ms);
        self.store.add_log(
            id,
            LogLevel::Info,
            format!("Stage {} finished", spec.name),
            json!({ "stage": spec.name, "elapsed_ms": elapsed_ms }),
        )?;
        Ok(())
    }

    fn merge_metadata(&self, id: &str, ctx: &mut StageContext) -> Result<(), StoreError> {
        if ctx.metadata.is_empty() {
            return Ok(());
        }
        let metadata = std::mem::take(&mut ctx.metadata);
        self.store.update(id, JobUpdate::metadata(metadata)).map(|_| ())
    }

    fn flush_provider_failures(&self, id: &str, ctx: &mut StageContext) {
        for (capability, failure) in ctx.failures.drain(..) {
            let logged = self.store.add_log(
                id,
                LogLevel::Warn,
                format!("Provider {} failed: {}", failure.provider, failure.reason),
                json!({
                    "provider": failure.provider,
                    "capability": capability,
                    "reason": failure.reason,
                }),
            );
            if let Err(e) = logged {
                warn!("Could not log provider failure on job {}: {}", id, e);
            }
        }
    }

    fn fail(&self, id: &str, e: StageError) -> Option<Job> {
        let kind = e.kind();
        warn!("Job {} failed ({}): {}", id, kind, e);
        match self.store.fail(id, JobError::new(kind, e.to_string())) {
            Ok(job) => Some(job),
            Err(StoreError::AlreadyTerminal { .. }) => self.store.get(id).ok(),
            Err(store_err) => {
                error!("Failed to record failure of job {}: {}", id, store_err);
                self.store.get(id).ok()
            }
        }
    }

    async fn save_result(&self, job: &Job) {
        let Some(result) = job.result.clone() else {
            return;
        };
        let title = job
            .metadata
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("Untitled")
            .to_string();
        let description = result
            .get("summary")
            .or_else(|| result.get("answer"))
            .and_then(Value::as_str)
            .map(|s| s.chars().take(200).collect());
        let reference = match job.source {
            Source::Url(ref url) => Some(url.clone()),
            Source::Stored(ref key) => Some(key.clone()),
            Source::Text(_) | Source::Inline(_) => None,
        };
        let saved = SavedResult {
            job_id: job.id.clone(),
            owner_id: job.owner_id.clone(),
            tool_type: job.tool_type,
            title,
            description,
            source_info: json!({
                "type": job.source.kind(),
                "content_type": job.content_type,
                "reference": reference,
            }),
            result,
            metadata: job.metadata.clone(),
        };

        if let Err(e) = self.sink.save(&saved).await {
            warn!("Failed to save result of job {}: {}", job.id, e);
            if let Err(log_err) = self.store.add_log(
                &job.id,
                LogLevel::Warn,
                format!("Result could not be saved: {}", e),
                Value::Null,
            ) {
                warn!("Could not log save failure on job {}: {}", job.id, log_err);
            }
        }
    }
}
