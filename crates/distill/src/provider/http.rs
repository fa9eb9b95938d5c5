//! Generic JSON-over-HTTP provider.
//!
//! `POST {endpoint}` with the request body. A reply of
//! `{"status": "pending", "job_key": "..."}` starts the asynchronous
//! protocol: `GET {endpoint}/jobs/{key}` reports status and
//! `GET {endpoint}/jobs/{key}/result` returns the payload.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, Url};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};

use super::{PollStatus, Provider, ProviderError, ProviderReply, ProviderRequest};

/// Longest response body excerpt kept in error messages.
const ERROR_BODY_LIMIT: usize = 200;

pub struct HttpProvider {
    client: Client,
    endpoint: Url,
    api_key: Option<SecretString>,
}

impl HttpProvider {
    pub fn new(
        endpoint: &str,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| ProviderError::InvalidInput(format!("endpoint '{}': {}", endpoint, e)))?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.api_key {
            Some(ref key) => builder.bearer_auth(key.expose_secret()),
            None => builder,
        }
    }

    fn job_url(&self, job_key: &str, suffix: &str) -> String {
        format!(
            "{}/jobs/{}{}",
            self.endpoint.as_str().trim_end_matches('/'),
            job_key,
            suffix
        )
    }

    async fn read_json(response: Response) -> Result<Value, ProviderError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body: body.chars().take(ERROR_BODY_LIMIT).collect(),
            });
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))
    }
}

fn is_pending_reply(body: &Value) -> Option<String> {
    if body.get("status").and_then(Value::as_str) != Some("pending") {
        return None;
    }
    body.get("job_key")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn parse_poll_status(body: &Value) -> Result<PollStatus, ProviderError> {
    match body.get("status").and_then(Value::as_str) {
        Some("pending" | "queued" | "processing") => Ok(PollStatus::Pending),
        Some("ready" | "completed" | "done") => Ok(PollStatus::Ready),
        Some("failed" | "error") => Ok(PollStatus::Failed(
            body.get("error")
                .and_then(Value::as_str)
                .unwrap_or("remote job failed")
                .to_string(),
        )),
        Some(other) => Err(ProviderError::Malformed(format!(
            "unknown remote status '{}'",
            other
        ))),
        None => Err(ProviderError::Malformed("missing remote status".to_string())),
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn invoke(&self, request: &ProviderRequest) -> Result<ProviderReply, ProviderError> {
        let body = json!({
            "job_id": request.job_id,
            "capability": request.capability,
            "input": request.input,
            "options": request.options,
        });
        let response = self
            .authorized(self.client.post(self.endpoint.clone()))
            .json(&body)
            .send()
            .await?;
        let body = Self::read_json(response).await?;
        Ok(match is_pending_reply(&body) {
            Some(job_key) => ProviderReply::Pending { job_key },
            None => ProviderReply::Ready(body),
        })
    }

    async fn poll(&self, job_key: &str) -> Result<PollStatus, ProviderError> {
        let response = self
            .authorized(self.client.get(self.job_url(job_key, "")))
            .send()
            .await?;
        parse_poll_status(&Self::read_json(response).await?)
    }

    async fn fetch(&self, job_key: &str) -> Result<Value, ProviderError> {
        let response = self
            .authorized(self.client.get(self.job_url(job_key, "/result")))
            .send()
            .await?;
        Self::read_json(response).await
    }
}
