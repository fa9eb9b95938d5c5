//! Test harness for isolated engine execution.
//!
//! Jobs accepted by the router land in a [`ManualQueue`]; the test decides
//! when they run by calling [`TestHarness::run_queued`], so every scenario
//! executes deterministically on the test's own runtime.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;

use distill::broadcast::{JobProgressBroadcaster, JobStore};
use distill::db::Database;
use distill::error::{RouterError, WorkerError};
use distill::gateway::PollingGateway;
use distill::job::{ContentType, Job, Source, ToolType};
use distill::pipeline::{StageExecutor, StageServices};
use distill::provider::extractive::ExtractiveSummarizer;
use distill::provider::{
    Capability, PollPolicy, Provider, ProviderDescriptor, ProviderRegistry,
    ProviderRegistryBuilder,
};
use distill::router::{JobQueue, JobRouter, SubmitReceipt, SubmitRequest};
use distill::storage::{FsContentStore, SqliteResultSink};

pub const OWNER: &str = "test-user";

/// Records enqueued ids until the test drains them.
#[derive(Default)]
pub struct ManualQueue {
    ids: Mutex<VecDeque<String>>,
}

impl ManualQueue {
    pub fn drain(&self) -> Vec<String> {
        self.ids.lock().unwrap().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.ids.lock().unwrap().len()
    }
}

impl JobQueue for ManualQueue {
    fn enqueue(&self, job_id: &str) -> Result<(), WorkerError> {
        self.ids.lock().unwrap().push_back(job_id.to_string());
        Ok(())
    }
}

pub struct HarnessBuilder {
    registry: ProviderRegistryBuilder,
    default_summarizer: bool,
    call_timeout: Duration,
    stage_timeout: Duration,
    ttl: Duration,
}

impl HarnessBuilder {
    /// Registers `provider` with fast polling.
    pub fn provider(
        mut self,
        name: &str,
        capability: Capability,
        priority: u32,
        provider: Arc<dyn Provider>,
    ) -> Self {
        let descriptor = ProviderDescriptor::new(name, capability, priority)
            .with_timeout(self.call_timeout)
            .with_poll(PollPolicy {
                interval: Duration::from_millis(10),
                max_attempts: 3,
            });
        self.registry = self.registry.register(descriptor, provider);
        self
    }

    /// Leaves summarization to the providers the test registers.
    pub fn without_default_summarizer(mut self) -> Self {
        self.default_summarizer = false;
        self
    }

    /// Per-call timeout for providers registered after this call.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn build(self) -> TestHarness {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let content_dir = temp_dir.path().join("content");
        std::fs::create_dir_all(&content_dir).expect("Failed to create content dir");

        let mut registry = self.registry;
        if self.default_summarizer {
            registry = registry.register(
                ProviderDescriptor::new("extractive", Capability::Summarize, 1000),
                Arc::new(ExtractiveSummarizer::default()),
            );
        }
        let providers: ProviderRegistry = registry.build();

        let database = Database::open_in_memory().expect("Failed to open database");
        let store = Arc::new(
            JobStore::new(self.ttl).with_broadcaster(JobProgressBroadcaster::new(1024)),
        );
        store.set_database(database.clone());

        let queue = Arc::new(ManualQueue::default());
        let executor = Arc::new(StageExecutor::new(
            Arc::clone(&store),
            StageServices {
                content: Arc::new(FsContentStore::new(&content_dir)),
                providers: Arc::new(providers),
            },
            Arc::new(SqliteResultSink::new(database.clone())),
            self.stage_timeout,
        ));
        let router = JobRouter::new(Arc::clone(&store), queue.clone(), "/api/v1");
        let gateway = PollingGateway::new(Arc::clone(&store), 20);

        TestHarness {
            temp_dir,
            content_dir,
            database,
            store,
            queue,
            executor,
            router,
            gateway,
        }
    }
}

/// Isolated store, router, gateway and executor for one test.
pub struct TestHarness {
    temp_dir: TempDir,
    pub content_dir: PathBuf,
    pub database: Database,
    pub store: Arc<JobStore>,
    pub queue: Arc<ManualQueue>,
    pub executor: Arc<StageExecutor>,
    pub router: JobRouter,
    pub gateway: PollingGateway,
}

impl TestHarness {
    /// A harness with only the local extractive summarizer.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            registry: ProviderRegistry::builder(),
            default_summarizer: true,
            call_timeout: Duration::from_secs(2),
            stage_timeout: Duration::from_secs(10),
            ttl: Duration::from_secs(3600),
        }
    }

    /// Writes a file into the content store under `key`.
    pub fn write_content(&self, key: &str, bytes: &[u8]) {
        let path = self.content_dir.join(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create content subdir");
        }
        std::fs::write(path, bytes).expect("Failed to write content");
    }

    pub fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, RouterError> {
        self.router.submit(request, OWNER)
    }

    /// Runs every queued job to completion, in queue order.
    pub async fn run_queued(&self) -> Vec<Job> {
        let mut finished = Vec::new();
        for id in self.queue.drain() {
            if let Some(job) = self.executor.process_job(&id).await {
                finished.push(job);
            }
        }
        finished
    }

    /// Submits and runs one job, returning its final snapshot.
    pub async fn run(&self, request: SubmitRequest) -> Job {
        let receipt = self.submit(request).expect("submission rejected");
        self.run_queued().await;
        self.store.get(&receipt.job_id).expect("job disappeared")
    }
}

/// Stage names of `job` in the order they started.
pub fn started_stages(job: &Job) -> Vec<String> {
    job.logs
        .iter()
        .filter(|l| l.message.ends_with(" started") && l.message.starts_with("Stage "))
        .filter_map(|l| l.context.get("stage").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

pub fn summarize_text(text: &str) -> SubmitRequest {
    SubmitRequest {
        tool_type: ToolType::Summarize,
        content_type: ContentType::Text,
        source: Source::Text(text.to_string()),
        options: Value::Null,
    }
}

pub fn youtube_summary(url: &str) -> SubmitRequest {
    SubmitRequest {
        tool_type: ToolType::Summarize,
        content_type: ContentType::Youtube,
        source: Source::Url(url.to_string()),
        options: Value::Null,
    }
}
