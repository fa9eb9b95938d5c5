use std::sync::Arc;

use reqwest::Url;
use serde_json::{json, Map, Value};
use tokio::time::Instant;

use super::error::StageError;
use crate::job::Job;
use crate::provider::normalize::Usage;
use crate::provider::{
    Capability, ChainError, NormalizedResponse, ProviderFailure, ProviderRegistry,
    ProviderRequest,
};
use crate::storage::{ContentStore, StoredContent};

/// Collaborators available to stage handlers.
#[derive(Clone)]
pub struct StageServices {
    pub content: Arc<dyn ContentStore>,
    pub providers: Arc<ProviderRegistry>,
}

/// State threaded through the stages of one job.
pub struct StageContext {
    pub job: Job,

    // Source material, filled by the loading stages
    pub stored: Option<StoredContent>,
    pub url: Option<Url>,
    pub video_id: Option<String>,
    pub text: Option<String>,
    pub title: Option<String>,

    /// Output of the tool stage.
    pub result: Option<Value>,
    /// Merged into the job's metadata before completion.
    pub metadata: Map<String, Value>,

    /// Provider failures not yet written to the job log.
    pub failures: Vec<(Capability, ProviderFailure)>,

    /// When the running stage times out.
    pub deadline: Option<Instant>,
}

impl StageContext {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            stored: None,
            url: None,
            video_id: None,
            text: None,
            title: None,
            result: None,
            metadata: Map::new(),
            failures: Vec::new(),
            deadline: None,
        }
    }

    pub fn require_text(&self) -> Result<&str, StageError> {
        match self.text.as_deref() {
            Some(text) if !text.trim().is_empty() => Ok(text),
            _ => Err(StageError::Validation(
                "No text content available to process".to_string(),
            )),
        }
    }

    /// Calls the chain for `capability`, recording which provider answered
    /// and any providers that failed along the way.
    pub async fn run_chain(
        &mut self,
        services: &StageServices,
        capability: Capability,
        input: Value,
    ) -> Result<NormalizedResponse, StageError> {
        let chain = services
            .providers
            .chain(capability)
            .ok_or(ChainError::NoProviders(capability))?;
        let request = ProviderRequest {
            job_id: self.job.id.clone(),
            capability,
            input,
            options: self.job.options.clone(),
        };

        match chain.invoke_before(&request, self.deadline).await {
            Ok(outcome) => {
                self.failures
                    .extend(outcome.failures.into_iter().map(|f| (capability, f)));
                self.record_provider(capability, &outcome.provider, outcome.response.usage());
                Ok(outcome.response)
            }
            Err(e) => {
                self.failures
                    .extend(e.failures().iter().cloned().map(|f| (capability, f)));
                Err(e.into())
            }
        }
    }

    /// Extraction providers define `processing_method`; AI providers only
    /// fill it when no extraction happened.
    fn record_provider(&mut self, capability: Capability, provider: &str, usage: Option<&Usage>) {
        if capability.is_extraction() || !self.metadata.contains_key("processing_method") {
            self.metadata
                .insert("processing_method".to_string(), json!(provider));
        }

        let providers = self
            .metadata
            .entry("providers")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = providers {
            map.insert(capability.as_str().to_string(), json!(provider));
        }

        if let Some(usage) = usage {
            if let Some(ref model) = usage.model_used {
                self.metadata.insert("model_used".to_string(), json!(model));
            }
            if let Some(tokens) = usage.tokens_used {
                self.metadata.insert("tokens_used".to_string(), json!(tokens));
            }
            if let Some(score) = usage.confidence_score {
                self.metadata
                    .insert("confidence_score".to_string(), json!(score));
            }
        }
    }

    /// Provider input describing the source material.
    pub fn source_input(&self) -> Value {
        let mut input = Map::new();
        if let Some(ref url) = self.url {
            input.insert("url".to_string(), json!(url.as_str()));
        }
        if let Some(ref id) = self.video_id {
            input.insert("video_id".to_string(), json!(id));
        }
        if let Some(ref stored) = self.stored {
            use base64::Engine as _;
            input.insert(
                "data".to_string(),
                json!(base64::engine::general_purpose::STANDARD.encode(&stored.bytes)),
            );
            input.insert("mime".to_string(), json!(stored.mime));
            input.insert("name".to_string(), json!(stored.name));
        }
        input.insert(
            "content_type".to_string(),
            json!(self.job.content_type.as_str()),
        );
        Value::Object(input)
    }
}
