use std::path::PathBuf;
use thiserror::Error;

use crate::job::{ContentType, ErrorKind, JobStatus, ToolType};

#[derive(Error, Debug)]
pub enum DistillError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Router error: {0}")]
    Router(#[from] RouterError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Logging setup failed: {0}")]
    Telemetry(String),

    #[error("Cannot install signal handler: {0}")]
    Signal(String),

    #[error("Invalid request file '{path}': {reason}")]
    Request { path: PathBuf, reason: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Invalid provider '{name}': {reason}")]
    InvalidProvider { name: String, reason: String },

    #[error("Failed to resolve secret for provider '{name}': {source}")]
    Secret {
        name: String,
        #[source]
        source: crate::secrets::SecretError,
    },
}

/// Errors from the job store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job id already exists: {0}")]
    DuplicateId(String),

    #[error("Invalid transition for job {id}: {reason}")]
    InvalidTransition { id: String, reason: String },

    #[error("Job {id} is already {status}")]
    AlreadyTerminal { id: String, status: JobStatus },

    #[error("Concurrent modification of job {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            StoreError::AlreadyTerminal { .. } => ErrorKind::AlreadyTerminal,
            StoreError::NotFound(_)
            | StoreError::DuplicateId(_)
            | StoreError::Conflict(_)
            | StoreError::Database(_)
            | StoreError::Serialization(_) => ErrorKind::Internal,
        }
    }
}

/// Errors returned synchronously to callers of the job router.
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Unsupported combination: {tool_type} does not accept {content_type}")]
    UnsupportedToolType {
        tool_type: ToolType,
        content_type: ContentType,
    },

    #[error("Cannot requeue job {id} while it is {status}")]
    NotRequeueable { id: String, status: JobStatus },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RouterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RouterError::Validation(_) => ErrorKind::ValidationError,
            RouterError::UnsupportedToolType { .. } => ErrorKind::UnsupportedToolType,
            RouterError::NotRequeueable { .. } => ErrorKind::InvalidTransition,
            RouterError::Store(e) => e.kind(),
        }
    }
}

/// Errors from the read-only polling surface.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {0} belongs to another principal")]
    Forbidden(String),

    #[error("Result for job {id} is not ready (status: {status})")]
    NotReady { id: String, status: JobStatus },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker pool needs at least one worker")]
    NoWorkers,

    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, DistillError>;
