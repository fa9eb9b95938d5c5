//! Job domain model: tool and content types, sources, status lifecycle and
//! the error taxonomy surfaced to pollers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What the caller wants produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolType {
    Summarize,
    Math,
    Flashcards,
    Quiz,
}

impl ToolType {
    pub const ALL: [ToolType; 4] = [
        ToolType::Summarize,
        ToolType::Math,
        ToolType::Flashcards,
        ToolType::Quiz,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolType::Summarize => "summarize",
            ToolType::Math => "math",
            ToolType::Flashcards => "flashcards",
            ToolType::Quiz => "quiz",
        }
    }
}

impl fmt::Display for ToolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ToolType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown tool type '{}'", s))
    }
}

/// What kind of content the job consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Link,
    Youtube,
    Pdf,
    Audio,
    Video,
    Image,
}

impl ContentType {
    pub const ALL: [ContentType; 7] = [
        ContentType::Text,
        ContentType::Link,
        ContentType::Youtube,
        ContentType::Pdf,
        ContentType::Audio,
        ContentType::Video,
        ContentType::Image,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Link => "link",
            ContentType::Youtube => "youtube",
            ContentType::Pdf => "pdf",
            ContentType::Audio => "audio",
            ContentType::Video => "video",
            ContentType::Image => "image",
        }
    }

    /// Whether the content is a binary file (uploaded, inline or remote).
    pub fn is_binary(&self) -> bool {
        matches!(
            self,
            ContentType::Pdf | ContentType::Audio | ContentType::Video | ContentType::Image
        )
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContentType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown content type '{}'", s))
    }
}

/// Where the job input comes from.
///
/// Serialized as `{"type": "...", "data": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Source {
    /// Raw text supplied in the request.
    Text(String),
    /// A web or video link.
    Url(String),
    /// Key into the content storage collaborator.
    Stored(String),
    /// Base64-encoded bytes supplied in the request.
    Inline(String),
}

impl Source {
    pub fn kind(&self) -> &'static str {
        match self {
            Source::Text(_) => "text",
            Source::Url(_) => "url",
            Source::Stored(_) => "stored",
            Source::Inline(_) => "inline",
        }
    }

    pub fn data(&self) -> &str {
        match self {
            Source::Text(s) | Source::Url(s) | Source::Stored(s) | Source::Inline(s) => s,
        }
    }
}

/// Job lifecycle status. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Allowed moves: pending→running, running→completed, and either
    /// non-terminal state→failed.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// One entry of a job's append-only audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub context: Value,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>, context: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            context,
        }
    }
}

/// Stable failure classification exposed on failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ValidationError,
    UnsupportedToolType,
    SourceNotFound,
    ProviderError,
    ChainExhausted,
    StageTimeout,
    JobStalled,
    InvalidTransition,
    AlreadyTerminal,
    ManuallyFailed,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::UnsupportedToolType => "UnsupportedToolType",
            ErrorKind::SourceNotFound => "SourceNotFound",
            ErrorKind::ProviderError => "ProviderError",
            ErrorKind::ChainExhausted => "ChainExhausted",
            ErrorKind::StageTimeout => "StageTimeout",
            ErrorKind::JobStalled => "JobStalled",
            ErrorKind::InvalidTransition => "InvalidTransition",
            ErrorKind::AlreadyTerminal => "AlreadyTerminal",
            ErrorKind::ManuallyFailed => "ManuallyFailed",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error recorded on a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Stage name of a job that has not started executing.
pub const STAGE_QUEUED: &str = "queued";
/// Stage name of a failed job.
pub const STAGE_FAILED: &str = "failed";
/// Stage name of a completed job.
pub const STAGE_DONE: &str = "done";

/// A unit of work tracked from submission to its terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub tool_type: ToolType,
    pub content_type: ContentType,
    pub source: Source,
    #[serde(default)]
    pub options: Value,
    pub status: JobStatus,
    pub stage: String,
    pub progress: u8,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub owner_id: String,
    /// Revision counter, bumped on every mutation.
    pub version: u64,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_terminal() && self.expires_at < now
    }
}
