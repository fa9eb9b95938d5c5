//! Wires the store, executor, worker pool, router, gateway and monitor
//! together from one [`Config`].

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::broadcast::{JobProgressBroadcaster, JobStore};
use crate::config::Config;
use crate::db::Database;
use crate::error::{DistillError, WorkerError};
use crate::gateway::PollingGateway;
use crate::job::Job;
use crate::monitor::StallMonitor;
use crate::pipeline::{StageExecutor, StageServices};
use crate::provider::ProviderRegistry;
use crate::router::JobRouter;
use crate::storage::{FsContentStore, NoopResultSink, ResultSink, SqliteResultSink};
use crate::worker::WorkerPool;

const PROGRESS_CHANNEL_CAPACITY: usize = 1024;

pub struct Engine {
    config: Config,
    store: Arc<JobStore>,
    pool: Arc<WorkerPool>,
    router: JobRouter,
    gateway: PollingGateway,
    monitor: Arc<StallMonitor>,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Opens the configured database and builds providers from the config.
    pub fn from_config(config: Config) -> Result<Self, DistillError> {
        let database = match config.database_path() {
            Some(path) => Database::open(&path)?,
            None => {
                log::warn!("No home directory found, keeping jobs in memory only");
                Database::open_in_memory()?
            }
        };
        let providers = ProviderRegistry::from_config(&config)?;
        Self::new(config, Some(database), providers)
    }

    /// Builds an engine around an explicit database and provider registry.
    ///
    /// Workers are running once this returns; call [`Engine::start`] to
    /// recover pending jobs and start the monitor.
    pub fn new(
        config: Config,
        database: Option<Database>,
        providers: ProviderRegistry,
    ) -> Result<Self, DistillError> {
        let store = Arc::new(
            JobStore::new(config.job_ttl())
                .with_broadcaster(JobProgressBroadcaster::new(PROGRESS_CHANNEL_CAPACITY)),
        );
        let sink: Arc<dyn ResultSink> = match database {
            Some(db) => {
                store.set_database(db.clone());
                let loaded = store.load_from_database()?;
                if loaded > 0 {
                    log::info!("Loaded {} jobs from the database", loaded);
                }
                Arc::new(SqliteResultSink::new(db))
            }
            None => Arc::new(NoopResultSink),
        };

        log::info!(
            "Providers ready for: {}",
            providers
                .capabilities()
                .iter()
                .map(|c| c.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        let services = StageServices {
            content: Arc::new(FsContentStore::new(config.content_root())),
            providers: Arc::new(providers),
        };
        let executor = Arc::new(StageExecutor::new(
            Arc::clone(&store),
            services,
            sink,
            config.stage_timeout(),
        ));

        let pool = Arc::new(WorkerPool::new(executor, config.worker_count)?);
        let router = JobRouter::new(Arc::clone(&store), pool.clone(), config.api_base.clone());
        let gateway = PollingGateway::new(Arc::clone(&store), config.recent_log_limit);
        let monitor = Arc::new(StallMonitor::new(
            Arc::clone(&store),
            pool.clone(),
            &config.monitor,
        ));

        Ok(Self {
            config,
            store,
            pool,
            router,
            gateway,
            monitor,
            monitor_handle: Mutex::new(None),
        })
    }

    /// Re-queues pending jobs and starts the monitor thread.
    pub fn start(&self) -> Result<usize, DistillError> {
        let recovered = self.pool.recover_pending(&self.store)?;

        let mut handle = match self.monitor_handle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Monitor handle lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        if handle.is_none() {
            let spawned = self
                .monitor
                .start()
                .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;
            *handle = Some(spawned);
            log::info!(
                "Monitor started (every {}s)",
                self.config.monitor.interval_secs
            );
        }
        Ok(recovered)
    }

    /// Stops the monitor, then drains and joins the workers.
    pub fn shutdown(&self) {
        log::info!("Shutting down engine...");
        self.monitor.stop();
        let handle = match self.monitor_handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("Monitor thread panicked");
            }
        }

        self.pool.shutdown();
        self.pool.wait();
        log::info!("Engine shutdown complete");
    }

    /// Blocks until `job_id` reaches a terminal state or `timeout` passes,
    /// then returns its latest snapshot.
    ///
    /// Consumes worker result snapshots of other jobs while waiting.
    pub fn wait_for(&self, job_id: &str, timeout: Duration) -> Option<Job> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.store.get(job_id) {
                Ok(job) if job.is_terminal() => return Some(job),
                Ok(_) => {}
                Err(_) => return None,
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.store.get(job_id).ok();
            }
            if let Some(job) = self
                .pool
                .recv_result_timeout(remaining.min(Duration::from_millis(250)))
            {
                if job.id == job_id && job.is_terminal() {
                    return Some(job);
                }
            }
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn router(&self) -> &JobRouter {
        &self.router
    }

    pub fn gateway(&self) -> &PollingGateway {
        &self.gateway
    }

    pub fn monitor(&self) -> &Arc<StallMonitor> {
        &self.monitor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_from_str;
    use crate::job::{ContentType, JobStatus, Source, ToolType};
    use crate::router::SubmitRequest;
    use serde_json::Value;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        let raw = serde_json::json!({
            "version": "1.0",
            "worker_count": 2,
            "content_root": dir.path().join("content").to_string_lossy(),
            "database_path": dir.path().join("distill.db").to_string_lossy(),
        });
        load_config_from_str(&raw.to_string()).unwrap()
    }

    fn summarize(text: &str) -> SubmitRequest {
        SubmitRequest {
            tool_type: ToolType::Summarize,
            content_type: ContentType::Text,
            source: Source::Text(text.to_string()),
            options: Value::Null,
        }
    }

    #[test]
    fn test_engine_runs_text_summary() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::from_config(config(&dir)).unwrap();
        engine.start().unwrap();

        let receipt = engine
            .router()
            .submit(
                summarize("Rust is a systems language. It is fast. It is memory safe."),
                "alice",
            )
            .unwrap();
        assert_eq!(receipt.status, JobStatus::Pending);
        assert_eq!(
            receipt.poll_url,
            format!("/api/v1/jobs/{}/status", receipt.job_id)
        );

        let job = engine
            .wait_for(&receipt.job_id, Duration::from_secs(10))
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);

        let view = engine.gateway().result(&receipt.job_id, "alice").unwrap();
        assert!(view.result["summary"].is_string());
        engine.shutdown();
    }

    #[test]
    fn test_jobs_survive_restart() {
        let dir = TempDir::new().unwrap();
        let id = {
            let engine = Engine::from_config(config(&dir)).unwrap();
            let receipt = engine
                .router()
                .submit(summarize("Persisted text. Another sentence."), "bob")
                .unwrap();
            engine.wait_for(&receipt.job_id, Duration::from_secs(10));
            engine.shutdown();
            receipt.job_id
        };

        let engine = Engine::from_config(config(&dir)).unwrap();
        let job = engine.store().get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.owner_id, "bob");
        engine.shutdown();
    }
}
