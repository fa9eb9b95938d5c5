//! Properties every job must satisfy regardless of its pipeline.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use serde_json::json;
use tokio::sync::broadcast::error::TryRecvError;

use common::{summarize_text, youtube_summary, Script, ScriptedProvider, TestHarness, OWNER};
use distill::broadcast::JobProgressEvent;
use distill::config::MonitorConfig;
use distill::error::{GatewayError, StoreError};
use distill::job::{ContentType, ErrorKind, JobStatus, LogLevel, Source, ToolType};
use distill::monitor::StallMonitor;
use distill::provider::Capability;
use distill::router::SubmitRequest;

fn status_rank(status: JobStatus) -> u8 {
    match status {
        JobStatus::Pending => 0,
        JobStatus::Running => 1,
        JobStatus::Completed | JobStatus::Failed => 2,
    }
}

fn events_for(
    receiver: &mut tokio::sync::broadcast::Receiver<JobProgressEvent>,
    job_id: &str,
) -> Vec<JobProgressEvent> {
    let mut events = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(event) if event.job_id == job_id => events.push(event),
            Ok(_) => {}
            Err(TryRecvError::Lagged(_)) => panic!("progress receiver lagged"),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
    events
}

#[tokio::test]
async fn progress_and_status_only_move_forward() {
    let harness = TestHarness::new();
    let mut receiver = harness.gateway.subscribe().unwrap();

    let job = harness
        .run(summarize_text(
            "Progress never goes backwards. Status never goes backwards either.",
        ))
        .await;
    assert_eq!(job.status, JobStatus::Completed);

    let events = events_for(&mut receiver, &job.id);
    assert!(events.len() > 5);
    assert!(events.windows(2).all(|w| w[0].progress <= w[1].progress));
    assert!(events
        .windows(2)
        .all(|w| status_rank(w[0].status) <= status_rank(w[1].status)));
    assert_eq!(events.last().unwrap().status, JobStatus::Completed);
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
}

#[tokio::test]
async fn failed_job_keeps_progress_and_stable_error() {
    let broken = ScriptedProvider::new(Script::Fail("model overloaded"));
    let harness = TestHarness::builder()
        .without_default_summarizer()
        .provider("llm", Capability::Summarize, 1, broken)
        .build();
    let mut receiver = harness.gateway.subscribe().unwrap();

    let job = harness
        .run(summarize_text("This summary will never be written."))
        .await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.progress, 50);

    let events = events_for(&mut receiver, &job.id);
    assert!(events.windows(2).all(|w| w[0].progress <= w[1].progress));

    let first = harness.gateway.status(&job.id, OWNER).unwrap();
    let second = harness.gateway.status(&job.id, OWNER).unwrap();
    assert_eq!(first.error, second.error);
    assert_eq!(first.error.unwrap().kind, ErrorKind::ChainExhausted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_job_runs_at_most_once() {
    let summarizer = ScriptedProvider::new(Script::Ready(json!({
        "summary": "Once.",
        "key_points": ["only once"],
    })));
    let harness = TestHarness::builder()
        .without_default_summarizer()
        .provider("llm", Capability::Summarize, 1, summarizer.clone())
        .build();

    let receipt = harness
        .submit(summarize_text("Run me exactly one time."))
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let executor = Arc::clone(&harness.executor);
        let id = receipt.job_id.clone();
        handles.push(tokio::spawn(async move { executor.process_job(&id).await }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(summarizer.invokes(), 1);
    let job = harness.store.get(&receipt.job_id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(
        job.logs.iter().filter(|l| l.message == "Job started").count(),
        1
    );

    // Processing a finished job again changes nothing.
    let again = harness.executor.process_job(&receipt.job_id).await.unwrap();
    assert_eq!(again.version, job.version);
    assert_eq!(summarizer.invokes(), 1);
}

#[tokio::test]
async fn fallback_records_the_winning_provider() {
    let first = ScriptedProvider::new(Script::Fail("gpu quota exceeded"));
    let second = ScriptedProvider::new(Script::Ready(json!({
        "summary": "Second provider answered.",
        "model_used": "small-model",
        "confidence_score": 0.8,
    })));
    let harness = TestHarness::builder()
        .without_default_summarizer()
        .provider("p1", Capability::Summarize, 1, first.clone())
        .provider("p2", Capability::Summarize, 2, second.clone())
        .build();

    let job = harness
        .run(summarize_text("Fallback should pick the second provider."))
        .await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.metadata["processing_method"], "p2");
    assert_eq!(job.metadata["model_used"], "small-model");
    assert_eq!(first.invokes(), 1);
    assert_eq!(second.invokes(), 1);

    let p1_failure = job
        .logs
        .iter()
        .position(|l| l.level == LogLevel::Warn && l.message.starts_with("Provider p1 failed"))
        .expect("p1 failure missing from job log");
    let completion = job
        .logs
        .iter()
        .position(|l| l.message == "Job completed")
        .unwrap();
    assert!(p1_failure < completion);
    assert!(job.logs[p1_failure].message.contains("gpu quota exceeded"));
}

#[tokio::test]
async fn timed_out_provider_falls_back() {
    let slow = ScriptedProvider::new(Script::Hang);
    let fast = ScriptedProvider::new(Script::Ready(json!({"summary": "Fast answer."})));
    let harness = TestHarness::builder()
        .without_default_summarizer()
        .call_timeout(Duration::from_millis(50))
        .provider("p1", Capability::Summarize, 1, slow)
        .provider("p2", Capability::Summarize, 2, fast)
        .build();

    let job = harness
        .run(summarize_text("The first provider is too slow."))
        .await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.metadata["processing_method"], "p2");
    assert_eq!(job.result.unwrap()["summary"], "Fast answer.");
    let timeout_log = job
        .logs
        .iter()
        .find(|l| l.message.starts_with("Provider p1 failed"))
        .expect("p1 timeout missing from job log");
    assert!(timeout_log.message.contains("timed out"));
    assert_eq!(timeout_log.context["capability"], "summarize");
}

#[tokio::test]
async fn slow_primary_cannot_use_up_the_stage_budget() {
    let slow = ScriptedProvider::new(Script::Hang);
    let fallback = ScriptedProvider::new(Script::Ready(json!({"summary": "ok"})));
    let harness = TestHarness::builder()
        .without_default_summarizer()
        .call_timeout(Duration::from_millis(300))
        .provider("p1", Capability::Summarize, 1, slow.clone())
        .provider("p2", Capability::Summarize, 2, fallback.clone())
        .stage_timeout(Duration::from_millis(200))
        .build();

    let job = harness
        .run(summarize_text("The primary is slower than the whole stage."))
        .await;

    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error);
    assert_eq!(job.metadata["processing_method"], "p2");
    assert_eq!(job.result.unwrap()["summary"], "ok");
    assert_eq!(slow.invokes(), 1);
    assert_eq!(fallback.invokes(), 1);
    assert!(job
        .logs
        .iter()
        .any(|l| l.level == LogLevel::Warn && l.message.starts_with("Provider p1 failed")));
}

#[tokio::test]
async fn exhausted_chain_lists_every_provider() {
    let harness = TestHarness::builder()
        .provider(
            "whisper",
            Capability::Transcribe,
            1,
            ScriptedProvider::new(Script::Fail("asr down")),
        )
        .provider(
            "captions",
            Capability::Transcribe,
            2,
            ScriptedProvider::new(Script::PendingForever),
        )
        .build();

    let job = harness
        .run(youtube_summary("https://youtu.be/dQw4w9WgXcQ"))
        .await;

    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.clone().unwrap();
    assert_eq!(error.kind, ErrorKind::ChainExhausted);
    assert!(error.message.contains("whisper"));
    assert!(error.message.contains("captions"));
    assert!(error.message.find("whisper") < error.message.find("captions"));
    assert_eq!(job.progress, 50);
    assert!(job.result.is_none());
    assert!(matches!(
        harness.gateway.result(&job.id, OWNER),
        Err(GatewayError::NotReady {
            status: JobStatus::Failed,
            ..
        })
    ));
}

#[tokio::test]
async fn missing_capability_fails_with_provider_error() {
    let harness = TestHarness::new();
    let job = harness
        .run(SubmitRequest {
            tool_type: ToolType::Quiz,
            content_type: ContentType::Text,
            source: Source::Text("Nobody can write this quiz.".to_string()),
            options: json!({}),
        })
        .await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.unwrap().kind, ErrorKind::ProviderError);
}

#[tokio::test]
async fn slow_stage_times_out() {
    let harness = TestHarness::builder()
        .without_default_summarizer()
        .provider(
            "sleepy",
            Capability::Summarize,
            1,
            ScriptedProvider::new(Script::Hang),
        )
        .stage_timeout(Duration::from_millis(100))
        .build();

    let job = harness
        .run(summarize_text("This provider never answers."))
        .await;
    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.unwrap();
    assert_eq!(error.kind, ErrorKind::StageTimeout);
    assert!(error.message.contains("ai_processing"));
}

#[tokio::test]
async fn missing_stored_source_is_reported() {
    let harness = TestHarness::new();
    let job = harness
        .run(SubmitRequest {
            tool_type: ToolType::Summarize,
            content_type: ContentType::Pdf,
            source: Source::Stored("uploads/missing.pdf".to_string()),
            options: json!({}),
        })
        .await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.unwrap().kind, ErrorKind::SourceNotFound);
    assert_eq!(job.progress, 10);
}

#[tokio::test]
async fn stalled_job_is_failed_and_late_completion_rejected() {
    let harness = TestHarness::new();
    let receipt = harness
        .submit(summarize_text("A worker picked this up and vanished."))
        .unwrap();
    harness.queue.drain();
    harness.store.try_start(&receipt.job_id).unwrap();

    let monitor = StallMonitor::new(
        Arc::clone(&harness.store),
        harness.queue.clone(),
        &MonitorConfig {
            interval_secs: 300,
            stall_threshold_secs: 900,
            orphan_threshold_secs: 600,
        },
    );

    assert!(monitor.sweep(Utc::now()).stalled.is_empty());
    let report = monitor.sweep(Utc::now() + TimeDelta::minutes(20));
    assert_eq!(report.stalled, vec![receipt.job_id.clone()]);

    let view = harness.gateway.status(&receipt.job_id, OWNER).unwrap();
    assert_eq!(view.status, JobStatus::Failed);
    assert_eq!(view.error.unwrap().kind, ErrorKind::JobStalled);

    let late = harness.store.complete(&receipt.job_id, json!({"summary": "too late"}));
    assert!(matches!(late, Err(StoreError::AlreadyTerminal { .. })));
    assert_eq!(
        harness.store.get(&receipt.job_id).unwrap().status,
        JobStatus::Failed
    );
}

#[tokio::test]
async fn other_owners_cannot_read_a_job() {
    let harness = TestHarness::new();
    let job = harness.run(summarize_text("Private notes. Keep out.")).await;

    assert!(matches!(
        harness.gateway.status(&job.id, "someone-else"),
        Err(GatewayError::Forbidden(_))
    ));
    assert!(matches!(
        harness.gateway.result(&job.id, "someone-else"),
        Err(GatewayError::Forbidden(_))
    ));
    assert!(harness.gateway.result(&job.id, OWNER).is_ok());
}
