//! External providers and the ordered fallback chains built from them.
//!
//! A provider answers one [`Capability`]. Calls are either synchronous
//! (`invoke` returns the result) or asynchronous (`invoke` returns a remote
//! job key that is then polled and fetched).

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod chain;
pub mod error;
pub mod extractive;
pub mod http;
pub mod normalize;
pub mod registry;
pub mod scraper;

pub use chain::{ChainEntry, ChainOutcome, ProviderChain};
pub use error::{ChainError, ProviderError, ProviderFailure};
pub use normalize::NormalizedResponse;
pub use registry::{ProviderRegistry, ProviderRegistryBuilder};

/// A unit of external work a stage can delegate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Summarize,
    Transcribe,
    ExtractText,
    FetchPage,
    SolveMath,
    GenerateFlashcards,
    GenerateQuiz,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Summarize => "summarize",
            Capability::Transcribe => "transcribe",
            Capability::ExtractText => "extract_text",
            Capability::FetchPage => "fetch_page",
            Capability::SolveMath => "solve_math",
            Capability::GenerateFlashcards => "generate_flashcards",
            Capability::GenerateQuiz => "generate_quiz",
        }
    }

    /// Content-acquisition capabilities determine `processing_method`.
    pub fn is_extraction(&self) -> bool {
        matches!(
            self,
            Capability::Transcribe | Capability::ExtractText | Capability::FetchPage
        )
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input handed to a provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderRequest {
    pub job_id: String,
    pub capability: Capability,
    pub input: Value,
    pub options: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderReply {
    Ready(Value),
    /// The provider accepted the work; poll `job_key` for completion.
    Pending { job_key: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus {
    Pending,
    Ready,
    Failed(String),
}

#[async_trait]
pub trait Provider: Send + Sync {
    async fn invoke(&self, request: &ProviderRequest) -> Result<ProviderReply, ProviderError>;

    async fn poll(&self, job_key: &str) -> Result<PollStatus, ProviderError> {
        Err(ProviderError::Protocol(format!(
            "provider returned job key '{}' but does not support polling",
            job_key
        )))
    }

    async fn fetch(&self, job_key: &str) -> Result<Value, ProviderError> {
        Err(ProviderError::Protocol(format!(
            "provider cannot fetch results for job key '{}'",
            job_key
        )))
    }
}

/// Bounded fixed-interval polling for asynchronous providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_attempts: 30,
        }
    }
}

/// Static facts about a registered provider.
#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    pub name: String,
    pub capability: Capability,
    /// Lower runs first.
    pub priority: u32,
    /// Bound on each individual call (invoke, poll or fetch).
    pub timeout: Duration,
    pub poll: PollPolicy,
}

impl ProviderDescriptor {
    pub fn new(name: impl Into<String>, capability: Capability, priority: u32) -> Self {
        Self {
            name: name.into(),
            capability,
            priority,
            timeout: Duration::from_secs(30),
            poll: PollPolicy::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }
}
