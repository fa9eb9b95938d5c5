use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use super::Capability;

/// Why a single provider attempt failed.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("remote job failed: {0}")]
    AsyncFailed(String),

    #[error("gave up after {0:?} to leave time for the next provider")]
    OutOfTime(Duration),

    #[error("result not ready after {attempts} polls")]
    PollExhausted { attempts: u32 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// One provider's failure, as recorded on the job log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderFailure {
    pub provider: String,
    pub reason: String,
}

fn format_failures(failures: &[ProviderFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.provider, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug, Clone)]
pub enum ChainError {
    #[error("no providers configured for {0}")]
    NoProviders(Capability),

    #[error("all providers failed for {capability}: {}", format_failures(.failures))]
    Exhausted {
        capability: Capability,
        failures: Vec<ProviderFailure>,
    },
}

impl ChainError {
    pub fn failures(&self) -> &[ProviderFailure] {
        match self {
            ChainError::NoProviders(_) => &[],
            ChainError::Exhausted { failures, .. } => failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_message_lists_providers_in_order() {
        let err = ChainError::Exhausted {
            capability: Capability::Transcribe,
            failures: vec![
                ProviderFailure {
                    provider: "whisper".into(),
                    reason: "timed out after 1s".into(),
                },
                ProviderFailure {
                    provider: "captions".into(),
                    reason: "HTTP 503: unavailable".into(),
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "all providers failed for transcribe: whisper: timed out after 1s; captions: HTTP 503: unavailable"
        );
        assert_eq!(err.failures().len(), 2);
    }
}
