//! Job submission and administrative operations.

use std::sync::Arc;

use base64::Engine as _;
use chrono::Utc;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::broadcast::{JobStore, NewJob};
use crate::error::{RouterError, WorkerError};
use crate::job::{
    ContentType, ErrorKind, Job, JobError, JobStatus, LogLevel, Source, ToolType,
};
use crate::pipeline::{resolve, StageError};

/// Where accepted job ids are sent for execution.
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, job_id: &str) -> Result<(), WorkerError>;
}

/// A job submission as received from a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub tool_type: ToolType,
    pub content_type: ContentType,
    pub source: Source,
    #[serde(default)]
    pub options: Value,
}

/// Returned immediately on submission; the job runs in the background.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitReceipt {
    pub job_id: String,
    pub status: JobStatus,
    pub poll_url: String,
    pub result_url: String,
}

/// Checks a request without touching the store.
pub fn validate_request(request: &SubmitRequest, owner_id: &str) -> Result<(), RouterError> {
    let invalid = |message: String| Err(RouterError::Validation(message));

    if owner_id.trim().is_empty() {
        return invalid("owner_id is required".to_string());
    }
    if !(request.options.is_object() || request.options.is_null()) {
        return invalid("options must be an object".to_string());
    }
    if request.source.data().trim().is_empty() {
        return invalid("source data is empty".to_string());
    }

    match (request.content_type, &request.source) {
        (ContentType::Text, Source::Text(_)) => {}
        (ContentType::Text, other) => {
            return invalid(format!(
                "text content needs a text source, got {}",
                other.kind()
            ))
        }
        (ContentType::Link | ContentType::Youtube, Source::Url(_)) => {}
        (ContentType::Link | ContentType::Youtube, other) => {
            return invalid(format!(
                "{} content needs a url source, got {}",
                request.content_type,
                other.kind()
            ))
        }
        (_, Source::Text(_)) => {
            return invalid(format!(
                "{} content cannot be supplied as text",
                request.content_type
            ))
        }
        (_, Source::Url(_) | Source::Stored(_) | Source::Inline(_)) => {}
    }

    match request.source {
        Source::Url(ref raw) => {
            let url = Url::parse(raw.trim())
                .map_err(|e| RouterError::Validation(format!("invalid url '{}': {}", raw, e)))?;
            if !matches!(url.scheme(), "http" | "https") {
                return invalid(format!("unsupported url scheme '{}'", url.scheme()));
            }
        }
        Source::Inline(ref data) => {
            base64::engine::general_purpose::STANDARD
                .decode(data.trim())
                .map_err(|e| {
                    RouterError::Validation(format!("inline data is not valid base64: {}", e))
                })?;
        }
        Source::Text(_) | Source::Stored(_) => {}
    }

    Ok(())
}

/// Front door for new jobs and the administrative repair operations.
pub struct JobRouter {
    store: Arc<JobStore>,
    queue: Arc<dyn JobQueue>,
    api_base: String,
}

impl JobRouter {
    pub fn new(
        store: Arc<JobStore>,
        queue: Arc<dyn JobQueue>,
        api_base: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    fn receipt(&self, job: &Job) -> SubmitReceipt {
        SubmitReceipt {
            job_id: job.id.clone(),
            status: job.status,
            poll_url: format!("{}/jobs/{}/status", self.api_base, job.id),
            result_url: format!("{}/jobs/{}/result", self.api_base, job.id),
        }
    }

    /// Hands the job to the queue. The row is already persisted, so a queue
    /// failure leaves it for the monitor's orphan scan.
    fn dispatch(&self, job: &Job) {
        if let Err(e) = self.queue.enqueue(&job.id) {
            log::warn!("Could not enqueue job {}: {}", job.id, e);
            if let Err(log_err) = self.store.add_log(
                &job.id,
                LogLevel::Warn,
                format!("Queue unavailable, job will be retried: {}", e),
                Value::Null,
            ) {
                log::warn!("Could not log enqueue failure on {}: {}", job.id, log_err);
            }
        }
    }

    /// Validates, persists and enqueues a job.
    ///
    /// Nothing is written when validation or pipeline resolution fails.
    pub fn submit(
        &self,
        request: SubmitRequest,
        owner_id: &str,
    ) -> Result<SubmitReceipt, RouterError> {
        validate_request(&request, owner_id)?;
        resolve(request.tool_type, request.content_type).map_err(|e| match e {
            StageError::Unsupported {
                tool_type,
                content_type,
            } => RouterError::UnsupportedToolType {
                tool_type,
                content_type,
            },
            other => RouterError::Validation(other.to_string()),
        })?;

        let job = self.store.create(NewJob {
            tool_type: request.tool_type,
            content_type: request.content_type,
            source: request.source,
            options: request.options,
            owner_id: owner_id.to_string(),
            metadata: Map::new(),
        })?;
        log::info!(
            "Accepted job {} ({}/{}) for {}",
            job.id,
            job.tool_type,
            job.content_type,
            owner_id
        );

        self.dispatch(&job);
        Ok(self.receipt(&job))
    }

    /// Sends a job back for execution.
    ///
    /// A pending job is re-sent under its own id. A failed job is left as it
    /// is and a fresh pending copy is created, linked by `requeued_from`.
    pub fn requeue(&self, job_id: &str) -> Result<SubmitReceipt, RouterError> {
        let job = self.store.get(job_id)?;
        match job.status {
            JobStatus::Pending => {
                self.store.add_log(
                    &job.id,
                    LogLevel::Info,
                    "Requeued by administrator",
                    Value::Null,
                )?;
                self.dispatch(&job);
                Ok(self.receipt(&job))
            }
            JobStatus::Failed => {
                let mut metadata = Map::new();
                metadata.insert("requeued_from".to_string(), json!(job.id));
                let copy = self.store.create(NewJob {
                    tool_type: job.tool_type,
                    content_type: job.content_type,
                    source: job.source.clone(),
                    options: job.options.clone(),
                    owner_id: job.owner_id.clone(),
                    metadata,
                })?;
                self.store.add_log(
                    &job.id,
                    LogLevel::Info,
                    format!("Requeued as {}", copy.id),
                    json!({ "requeued_as": copy.id }),
                )?;
                log::info!("Requeued failed job {} as {}", job.id, copy.id);
                self.dispatch(&copy);
                Ok(self.receipt(&copy))
            }
            status @ (JobStatus::Running | JobStatus::Completed) => {
                Err(RouterError::NotRequeueable {
                    id: job.id,
                    status,
                })
            }
        }
    }

    /// Fails a non-terminal job by hand.
    pub fn mark_failed(&self, job_id: &str, reason: &str) -> Result<Job, RouterError> {
        let message = if reason.trim().is_empty() {
            "Marked failed by administrator".to_string()
        } else {
            reason.to_string()
        };
        let job = self
            .store
            .fail(job_id, JobError::new(ErrorKind::ManuallyFailed, message))?;
        log::info!("Job {} marked failed", job_id);
        Ok(job)
    }

    /// Deletes terminal jobs past their expiry.
    pub fn purge_expired(&self) -> Result<usize, RouterError> {
        Ok(self.store.purge_expired(Utc::now())?)
    }
}
