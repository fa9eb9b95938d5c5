//! Read-only polling surface over the job store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::broadcast::{JobProgressEvent, JobStore};
use crate::error::{GatewayError, StoreError};
use crate::job::{Job, JobError, JobStatus, LogEntry};

#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub status: JobStatus,
    pub stage: String,
    pub progress: u8,
    /// Most recent entries, oldest first.
    pub logs: Vec<LogEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobResultView {
    pub job_id: String,
    pub result: Value,
    pub metadata: Map<String, Value>,
}

pub struct PollingGateway {
    store: Arc<JobStore>,
    recent_log_limit: usize,
}

impl PollingGateway {
    pub fn new(store: Arc<JobStore>, recent_log_limit: usize) -> Self {
        Self {
            store,
            recent_log_limit,
        }
    }

    fn owned_job(&self, job_id: &str, requester: &str) -> Result<Job, GatewayError> {
        let job = self.store.get(job_id).map_err(|e| match e {
            StoreError::NotFound(id) => GatewayError::NotFound(id),
            other => GatewayError::Store(other),
        })?;
        if job.owner_id != requester {
            return Err(GatewayError::Forbidden(job_id.to_string()));
        }
        Ok(job)
    }

    pub fn status(&self, job_id: &str, requester: &str) -> Result<JobStatusView, GatewayError> {
        let job = self.owned_job(job_id, requester)?;
        let skip = job.logs.len().saturating_sub(self.recent_log_limit);
        Ok(JobStatusView {
            logs: job.logs[skip..].to_vec(),
            job_id: job.id,
            status: job.status,
            stage: job.stage,
            progress: job.progress,
            error: job.error,
            updated_at: job.updated_at,
        })
    }

    /// The result of a completed job; anything else is `NotReady`.
    pub fn result(&self, job_id: &str, requester: &str) -> Result<JobResultView, GatewayError> {
        let job = self.owned_job(job_id, requester)?;
        match (job.status, job.result) {
            (JobStatus::Completed, Some(result)) => Ok(JobResultView {
                job_id: job.id,
                result,
                metadata: job.metadata,
            }),
            (status, _) => Err(GatewayError::NotReady {
                id: job.id,
                status,
            }),
        }
    }

    /// Every progress event of every job, when the store broadcasts.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<JobProgressEvent>> {
        self.store.broadcaster().map(|b| b.subscribe())
    }

    /// Progress events for one job, ending after its terminal event.
    pub fn watch(
        &self,
        job_id: &str,
        requester: &str,
    ) -> Result<impl Stream<Item = JobProgressEvent>, GatewayError> {
        // Subscribe before reading so a terminal event written in between
        // is either in the snapshot or still queued on the receiver.
        let receiver = self.subscribe();
        let job = self.owned_job(job_id, requester)?;
        Ok(follow(receiver, &job))
    }
}

/// Streams `job`'s events from `receiver`, which must have been subscribed
/// before `job` was read.
fn follow(
    receiver: Option<broadcast::Receiver<JobProgressEvent>>,
    job: &Job,
) -> impl Stream<Item = JobProgressEvent> {
    let finished = job.is_terminal() || receiver.is_none();

    stream::unfold(
        (receiver, job.id.clone(), finished),
        |(receiver, job_id, finished)| async move {
            if finished {
                return None;
            }
            let mut receiver = receiver?;
            loop {
                match receiver.recv().await {
                    Ok(event) if event.job_id == job_id => {
                        let done = event.is_terminal();
                        return Some((event, (Some(receiver), job_id, done)));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::debug!("Watcher of {} lagged by {} events", job_id, skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{JobProgressBroadcaster, JobUpdate, NewJob};
    use crate::job::{ContentType, ErrorKind, Source, ToolType};
    use futures_util::StreamExt;
    use serde_json::json;
    use std::time::Duration;

    fn setup() -> (Arc<JobStore>, PollingGateway, String) {
        let store = Arc::new(
            JobStore::new(Duration::from_secs(3600))
                .with_broadcaster(JobProgressBroadcaster::new(64)),
        );
        let job = store
            .create(NewJob {
                tool_type: ToolType::Summarize,
                content_type: ContentType::Text,
                source: Source::Text("hello".to_string()),
                options: Value::Null,
                owner_id: "alice".to_string(),
                metadata: Map::new(),
            })
            .unwrap();
        let gateway = PollingGateway::new(Arc::clone(&store), 2);
        (store, gateway, job.id)
    }

    #[test]
    fn test_status_limits_logs() {
        let (store, gateway, id) = setup();
        store.try_start(&id).unwrap();
        store
            .update(&id, JobUpdate::stage("initializing", 5))
            .unwrap();

        let view = gateway.status(&id, "alice").unwrap();
        assert_eq!(view.status, JobStatus::Running);
        assert_eq!(view.stage, "initializing");
        assert_eq!(view.progress, 5);
        assert_eq!(view.logs.len(), 2);
        assert_eq!(view.logs[1].message, "Job started");
        assert!(view.error.is_none());
    }

    #[test]
    fn test_foreign_and_missing_jobs() {
        let (_, gateway, id) = setup();
        assert!(matches!(
            gateway.status(&id, "mallory"),
            Err(GatewayError::Forbidden(_))
        ));
        assert!(matches!(
            gateway.result("missing", "alice"),
            Err(GatewayError::NotFound(_))
        ));
    }

    #[test]
    fn test_result_only_when_completed() {
        let (store, gateway, id) = setup();
        assert!(matches!(
            gateway.result(&id, "alice"),
            Err(GatewayError::NotReady {
                status: JobStatus::Pending,
                ..
            })
        ));

        store.try_start(&id).unwrap();
        store.complete(&id, json!({"summary": "s"})).unwrap();
        let view = gateway.result(&id, "alice").unwrap();
        assert_eq!(view.result["summary"], "s");
    }

    #[test]
    fn test_failed_job_error_is_stable() {
        let (store, gateway, id) = setup();
        store
            .fail(&id, JobError::new(ErrorKind::ChainExhausted, "all failed"))
            .unwrap();
        for _ in 0..2 {
            let view = gateway.status(&id, "alice").unwrap();
            let error = view.error.unwrap();
            assert_eq!(error.kind, ErrorKind::ChainExhausted);
            assert_eq!(error.message, "all failed");
        }
        assert!(gateway.result(&id, "alice").is_err());
    }

    #[tokio::test]
    async fn test_watch_ends_on_terminal_event() {
        let (store, gateway, id) = setup();
        let events = gateway.watch(&id, "alice").unwrap();

        store.try_start(&id).unwrap();
        store
            .update(&id, JobUpdate::stage("initializing", 5))
            .unwrap();
        store.complete(&id, json!({"summary": "s"})).unwrap();

        let events: Vec<JobProgressEvent> = events.collect().await;
        assert_eq!(events.last().map(|e| e.status), Some(JobStatus::Completed));
        let progress: Vec<u8> = events.iter().map(|e| e.progress).collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_watch_sees_completion_that_races_the_snapshot() {
        let (store, gateway, id) = setup();
        store.try_start(&id).unwrap();

        let receiver = gateway.subscribe();
        let snapshot = store.get(&id).unwrap();
        store.complete(&id, json!({"summary": "s"})).unwrap();

        let events: Vec<JobProgressEvent> =
            tokio::time::timeout(Duration::from_secs(1), follow(receiver, &snapshot).collect())
                .await
                .expect("watch did not end after completion");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_watch_of_finished_job_ends_immediately() {
        let (store, gateway, id) = setup();
        store.try_start(&id).unwrap();
        store.complete(&id, json!({"summary": "s"})).unwrap();

        let events: Vec<JobProgressEvent> = gateway.watch(&id, "alice").unwrap().collect().await;
        assert!(events.is_empty());
    }
}
