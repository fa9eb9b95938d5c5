//! Providers whose behaviour is fixed by the test.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use distill::provider::{PollStatus, Provider, ProviderError, ProviderReply, ProviderRequest};

/// What a [`ScriptedProvider`] does on every call.
#[derive(Debug, Clone)]
pub enum Script {
    /// Answers synchronously with the payload.
    Ready(Value),
    /// Fails the invoke with an HTTP-style error.
    Fail(&'static str),
    /// Accepts the work and never finishes it.
    PendingForever,
    /// Accepts the work and is ready after `polls` pending polls.
    PendingThenReady { polls: usize, value: Value },
    /// Never answers the invoke.
    Hang,
}

pub struct ScriptedProvider {
    script: Script,
    invokes: AtomicUsize,
    polls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            invokes: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
        })
    }

    pub fn invokes(&self) -> usize {
        self.invokes.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn invoke(&self, request: &ProviderRequest) -> Result<ProviderReply, ProviderError> {
        self.invokes.fetch_add(1, Ordering::SeqCst);
        match self.script {
            Script::Ready(ref value) => Ok(ProviderReply::Ready(value.clone())),
            Script::Fail(body) => Err(ProviderError::Status {
                status: 503,
                body: body.to_string(),
            }),
            Script::PendingForever | Script::PendingThenReady { .. } => {
                Ok(ProviderReply::Pending {
                    job_key: format!("remote-{}", request.job_id),
                })
            }
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ProviderError::Protocol("woke up".to_string()))
            }
        }
    }

    async fn poll(&self, _job_key: &str) -> Result<PollStatus, ProviderError> {
        let seen = self.polls.fetch_add(1, Ordering::SeqCst);
        match self.script {
            Script::PendingThenReady { polls, .. } if seen >= polls => Ok(PollStatus::Ready),
            _ => Ok(PollStatus::Pending),
        }
    }

    async fn fetch(&self, _job_key: &str) -> Result<Value, ProviderError> {
        match self.script {
            Script::PendingThenReady { ref value, .. } => Ok(value.clone()),
            _ => Err(ProviderError::Protocol("nothing to fetch".to_string())),
        }
    }
}
