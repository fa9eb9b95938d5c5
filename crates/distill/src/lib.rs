pub mod broadcast;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod job;
pub mod monitor;
pub mod pipeline;
pub mod provider;
pub mod router;
pub mod secrets;
pub mod storage;
pub mod telemetry;
pub mod worker;

pub use broadcast::{JobProgressBroadcaster, JobProgressEvent, JobStore};
pub use config::{load_config, Config};
pub use engine::Engine;
pub use error::{
    ConfigError, DistillError, GatewayError, Result, RouterError, StoreError, WorkerError,
};
pub use gateway::{JobResultView, JobStatusView, PollingGateway};
pub use job::{ContentType, ErrorKind, Job, JobError, JobStatus, Source, ToolType};
pub use monitor::{StallMonitor, SweepReport};
pub use pipeline::{StageExecutor, StageServices};
pub use provider::{Capability, Provider, ProviderRegistry};
pub use router::{JobQueue, JobRouter, SubmitReceipt, SubmitRequest};
pub use secrets::{resolve_secret, resolve_secret_optional, SecretError};
pub use worker::WorkerPool;
