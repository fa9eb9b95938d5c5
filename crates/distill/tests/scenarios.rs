//! End-to-end scenarios: a job submitted through the router, executed by the
//! stage executor and read back through the polling gateway.

mod common;

use serde_json::json;

use common::{
    started_stages, summarize_text, youtube_summary, Script, ScriptedProvider, TestHarness, OWNER,
};
use distill::db::result_repo;
use distill::error::RouterError;
use distill::job::{ContentType, JobStatus, LogLevel, Source, ToolType};
use distill::pipeline::resolve;
use distill::provider::Capability;
use distill::router::SubmitRequest;

#[tokio::test]
async fn scenario_a_text_summary_completes() {
    let harness = TestHarness::new();

    let receipt = harness
        .submit(summarize_text("Hello world, this is a test."))
        .unwrap();
    assert_eq!(receipt.status, JobStatus::Pending);
    assert_eq!(
        receipt.result_url,
        format!("/api/v1/jobs/{}/result", receipt.job_id)
    );
    assert_eq!(harness.queue.len(), 1);

    harness.run_queued().await;

    let status = harness.gateway.status(&receipt.job_id, OWNER).unwrap();
    assert_eq!(status.status, JobStatus::Completed);
    assert_eq!(status.progress, 100);
    assert_eq!(status.stage, "done");

    let result = harness.gateway.result(&receipt.job_id, OWNER).unwrap();
    let summary = result.result["summary"].as_str().unwrap();
    assert!(!summary.trim().is_empty());
    assert_eq!(result.metadata["processing_method"], "extractive");

    let job = harness.store.get(&receipt.job_id).unwrap();
    let expected: Vec<&str> = resolve(ToolType::Summarize, ContentType::Text)
        .unwrap()
        .stages
        .iter()
        .map(|s| s.name)
        .collect();
    assert_eq!(started_stages(&job), expected);
}

#[tokio::test]
async fn scenario_a_result_is_saved_for_owner() {
    let harness = TestHarness::new();
    let job = harness
        .run(summarize_text(
            "Saved results keep a title. They also keep a short description.",
        ))
        .await;
    assert_eq!(job.status, JobStatus::Completed);

    let saved = result_repo::find_by_owner(&harness.database, OWNER).unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].job_id, job.id);
    assert_eq!(saved[0].tool_type, "summarize");
    assert!(saved[0].description.is_some());
}

#[tokio::test]
async fn scenario_b_youtube_falls_back_to_second_transcriber() {
    let primary = ScriptedProvider::new(Script::PendingForever);
    let fallback = ScriptedProvider::new(Script::Ready(json!({
        "transcript": "Welcome to the channel. Today we cover ownership in Rust. \
                       Borrowing lets you use data without taking it.",
        "title": "Ownership explained",
        "language": "en",
    })));
    let harness = TestHarness::builder()
        .provider("whisper_async", Capability::Transcribe, 10, primary.clone())
        .provider("caption_fallback", Capability::Transcribe, 20, fallback.clone())
        .build();

    let job = harness
        .run(youtube_summary("https://www.youtube.com/watch?v=dQw4w9WgXcQ"))
        .await;

    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error);
    assert_eq!(job.progress, 100);
    assert_eq!(job.metadata["processing_method"], "caption_fallback");
    assert_eq!(job.metadata["video_id"], "dQw4w9WgXcQ");
    assert_eq!(job.metadata["title"], "Ownership explained");
    assert_eq!(job.metadata["providers"]["transcribe"], "caption_fallback");
    assert_eq!(job.metadata["providers"]["summarize"], "extractive");

    assert_eq!(primary.invokes(), 1);
    assert_eq!(primary.polls(), 3);
    assert_eq!(fallback.invokes(), 1);

    let failure_at = job
        .logs
        .iter()
        .position(|l| l.level == LogLevel::Warn && l.message.contains("whisper_async"))
        .expect("primary failure was not logged");
    let completed_at = job
        .logs
        .iter()
        .position(|l| l.message == "Job completed")
        .unwrap();
    assert!(failure_at < completed_at);
    assert!(job.logs[failure_at].message.contains("3 polls"));
}

#[tokio::test]
async fn scenario_c_unsupported_pair_is_rejected_before_creation() {
    let harness = TestHarness::new();

    let err = harness
        .submit(SubmitRequest {
            tool_type: ToolType::Math,
            content_type: ContentType::Youtube,
            source: Source::Url("https://youtu.be/dQw4w9WgXcQ".to_string()),
            options: json!({}),
        })
        .unwrap_err();

    assert!(matches!(
        err,
        RouterError::UnsupportedToolType {
            tool_type: ToolType::Math,
            content_type: ContentType::Youtube,
        }
    ));
    assert_eq!(err.kind().as_str(), "UnsupportedToolType");
    assert_eq!(harness.store.counts().pending, 0);
    assert!(harness.store.list_by_status(JobStatus::Pending).is_empty());
    assert_eq!(harness.queue.len(), 0);
}

#[tokio::test]
async fn link_summary_uses_page_fetch_result() {
    let page = ScriptedProvider::new(Script::Ready(json!({
        "text": "Tokio is an asynchronous runtime. It provides timers and IO. \
                 Tasks are cheap to spawn.",
        "title": "About Tokio",
    })));
    let harness = TestHarness::builder()
        .provider("page_scraper", Capability::FetchPage, 1, page)
        .build();

    let job = harness
        .run(SubmitRequest {
            tool_type: ToolType::Summarize,
            content_type: ContentType::Link,
            source: Source::Url("https://tokio.rs/about".to_string()),
            options: json!({}),
        })
        .await;

    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error);
    assert_eq!(job.metadata["processing_method"], "page_scraper");
    assert_eq!(job.metadata["source_host"], "tokio.rs");
    assert_eq!(job.metadata["title"], "About Tokio");
}

#[tokio::test]
async fn stored_pdf_flashcards_pipeline() {
    let extractor = ScriptedProvider::new(Script::Ready(json!({
        "text": "Mitochondria produce ATP. Ribosomes build proteins.",
    })));
    let generator = ScriptedProvider::new(Script::Ready(json!({
        "flashcards": [
            {"question": "What produces ATP?", "answer": "Mitochondria"},
            {"question": "What builds proteins?", "answer": "Ribosomes"},
        ],
        "model_used": "cards-v1",
        "tokens_used": 42,
    })));
    let harness = TestHarness::builder()
        .provider("pdf_text", Capability::ExtractText, 1, extractor)
        .provider("card_ai", Capability::GenerateFlashcards, 1, generator)
        .build();
    harness.write_content("uploads/bio.pdf", b"%PDF-1.4 fake");

    let job = harness
        .run(SubmitRequest {
            tool_type: ToolType::Flashcards,
            content_type: ContentType::Pdf,
            source: Source::Stored("uploads/bio.pdf".to_string()),
            options: json!({}),
        })
        .await;

    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error);
    let result = job.result.unwrap();
    assert_eq!(result["cards"].as_array().unwrap().len(), 2);
    assert_eq!(job.metadata["card_count"], 2);
    assert_eq!(job.metadata["processing_method"], "pdf_text");
    assert_eq!(job.metadata["model_used"], "cards-v1");
    assert_eq!(job.metadata["mime_type"], "application/pdf");
}
