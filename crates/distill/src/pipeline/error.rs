use std::time::Duration;

use thiserror::Error;

use crate::error::StoreError;
use crate::job::{ContentType, ErrorKind, ToolType};
use crate::provider::{ChainError, ProviderError};
use crate::storage::ContentError;

/// Why a stage stopped the pipeline.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Content(#[from] ContentError),

    #[error("{0}")]
    Chain(#[from] ChainError),

    #[error("Provider returned an unexpected response: {0}")]
    Provider(#[from] ProviderError),

    #[error("Stage '{stage}' exceeded {timeout:?}")]
    Timeout { stage: String, timeout: Duration },

    #[error("No pipeline for {tool_type} on {content_type} content")]
    Unsupported {
        tool_type: ToolType,
        content_type: ContentType,
    },

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Internal(String),
}

impl StageError {
    /// The taxonomy entry recorded on the failed job.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Validation(_) => ErrorKind::ValidationError,
            StageError::Content(ContentError::NotFound(_)) => ErrorKind::SourceNotFound,
            StageError::Content(ContentError::InvalidKey { .. }) => ErrorKind::ValidationError,
            StageError::Content(ContentError::Io { .. }) => ErrorKind::Internal,
            StageError::Chain(ChainError::Exhausted { .. }) => ErrorKind::ChainExhausted,
            StageError::Chain(ChainError::NoProviders(_)) => ErrorKind::ProviderError,
            StageError::Provider(_) => ErrorKind::ProviderError,
            StageError::Timeout { .. } => ErrorKind::StageTimeout,
            StageError::Unsupported { .. } => ErrorKind::UnsupportedToolType,
            StageError::Store(e) => e.kind(),
            StageError::Internal(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Capability, ProviderFailure};

    #[test]
    fn test_kinds() {
        let exhausted = StageError::from(ChainError::Exhausted {
            capability: Capability::Summarize,
            failures: vec![ProviderFailure {
                provider: "p1".to_string(),
                reason: "timed out".to_string(),
            }],
        });
        assert_eq!(exhausted.kind(), ErrorKind::ChainExhausted);
        assert!(exhausted.to_string().contains("p1: timed out"));

        assert_eq!(
            StageError::from(ContentError::NotFound("k".to_string())).kind(),
            ErrorKind::SourceNotFound
        );
        assert_eq!(
            StageError::Timeout {
                stage: "transcribing".to_string(),
                timeout: Duration::from_secs(1)
            }
            .kind(),
            ErrorKind::StageTimeout
        );
        assert_eq!(
            StageError::Chain(ChainError::NoProviders(Capability::Transcribe)).kind(),
            ErrorKind::ProviderError
        );
    }
}
