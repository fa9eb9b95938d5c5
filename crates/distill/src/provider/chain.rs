//! Ordered provider fallback for one capability.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

use super::normalize::{normalize, NormalizedResponse};
use super::{
    Capability, ChainError, PollStatus, Provider, ProviderDescriptor, ProviderError,
    ProviderFailure, ProviderReply, ProviderRequest,
};

/// A registered provider and its descriptor.
#[derive(Clone)]
pub struct ChainEntry {
    pub descriptor: ProviderDescriptor,
    pub provider: Arc<dyn Provider>,
}

impl ChainEntry {
    pub fn new(descriptor: ProviderDescriptor, provider: Arc<dyn Provider>) -> Self {
        Self {
            descriptor,
            provider,
        }
    }

    fn name(&self) -> &str {
        &self.descriptor.name
    }
}

/// Result of a successful chain call.
#[derive(Debug, Clone)]
pub struct ChainOutcome {
    /// Name of the provider that produced `response`.
    pub provider: String,
    pub response: NormalizedResponse,
    /// Providers tried and failed before `provider`, in order.
    pub failures: Vec<ProviderFailure>,
}

/// Remembers recently failed providers so healthy ones are tried first.
struct HealthTracker {
    recent_failures: Cache<String, ()>,
}

impl HealthTracker {
    fn new(cooldown: Duration) -> Self {
        Self {
            recent_failures: Cache::builder()
                .max_capacity(1_024)
                .time_to_live(cooldown)
                .build(),
        }
    }

    fn is_cooling_down(&self, provider: &str) -> bool {
        self.recent_failures.contains_key(provider)
    }

    fn record_failure(&self, provider: &str) {
        self.recent_failures.insert(provider.to_string(), ());
    }

    fn record_success(&self, provider: &str) {
        self.recent_failures.invalidate(provider);
    }
}

/// Providers for one capability, tried in ascending priority.
pub struct ProviderChain {
    capability: Capability,
    entries: Vec<ChainEntry>,
    health: Option<HealthTracker>,
}

impl ProviderChain {
    /// Builds a chain. Entries are ordered by priority; ties keep
    /// registration order. With a `cooldown`, providers that failed within
    /// that window are moved behind the rest (never skipped).
    pub fn new(
        capability: Capability,
        mut entries: Vec<ChainEntry>,
        cooldown: Option<Duration>,
    ) -> Self {
        entries.sort_by_key(|e| e.descriptor.priority);
        Self {
            capability,
            entries,
            health: cooldown.map(HealthTracker::new),
        }
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Provider names in the order the next call would try them.
    pub fn provider_names(&self) -> Vec<String> {
        self.ordered().iter().map(|e| e.name().to_string()).collect()
    }

    fn ordered(&self) -> Vec<&ChainEntry> {
        let mut ordered: Vec<&ChainEntry> = self.entries.iter().collect();
        if let Some(ref health) = self.health {
            ordered.sort_by_key(|e| health.is_cooling_down(e.name()));
        }
        ordered
    }

    /// Tries each provider until one returns a well-formed response.
    pub async fn invoke(&self, request: &ProviderRequest) -> Result<ChainOutcome, ChainError> {
        self.invoke_before(request, None).await
    }

    /// Like [`ProviderChain::invoke`], but keeps room for fallback before
    /// `deadline`: every provider except the last gets at most an equal share
    /// of the time left, so a slow primary cannot starve the ones behind it.
    pub async fn invoke_before(
        &self,
        request: &ProviderRequest,
        deadline: Option<Instant>,
    ) -> Result<ChainOutcome, ChainError> {
        if self.entries.is_empty() {
            return Err(ChainError::NoProviders(self.capability));
        }

        let ordered = self.ordered();
        let count = ordered.len();
        let mut failures = Vec::new();
        for (index, entry) in ordered.into_iter().enumerate() {
            let left = count - index;
            let share = deadline
                .filter(|_| left > 1)
                .map(|d| d.saturating_duration_since(Instant::now()) / left as u32);

            let span = info_span!("provider", name = %entry.name(), capability = %self.capability);
            let result = async {
                let raw = match share {
                    Some(share) => tokio::time::timeout(share, attempt(entry, request))
                        .await
                        .map_err(|_| ProviderError::OutOfTime(share))??,
                    None => attempt(entry, request).await?,
                };
                normalize(self.capability, raw)
            }
            .instrument(span)
            .await;

            match result {
                Ok(response) => {
                    if let Some(ref health) = self.health {
                        health.record_success(entry.name());
                    }
                    debug!(
                        "Provider {} satisfied {} for job {}",
                        entry.name(),
                        self.capability,
                        request.job_id
                    );
                    return Ok(ChainOutcome {
                        provider: entry.name().to_string(),
                        response,
                        failures,
                    });
                }
                Err(e) => {
                    warn!(
                        "Provider {} failed {} for job {}: {}",
                        entry.name(),
                        self.capability,
                        request.job_id,
                        e
                    );
                    if let Some(ref health) = self.health {
                        health.record_failure(entry.name());
                    }
                    failures.push(ProviderFailure {
                        provider: entry.name().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(ChainError::Exhausted {
            capability: self.capability,
            failures,
        })
    }
}

async fn bounded<T, F>(timeout: Duration, call: F) -> Result<T, ProviderError>
where
    F: std::future::Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(timeout)),
    }
}

/// One provider call: invoke, then for asynchronous replies poll on a fixed
/// interval until ready, failed or out of attempts.
async fn attempt(entry: &ChainEntry, request: &ProviderRequest) -> Result<Value, ProviderError> {
    let descriptor = &entry.descriptor;
    let job_key = match bounded(descriptor.timeout, entry.provider.invoke(request)).await? {
        ProviderReply::Ready(value) => return Ok(value),
        ProviderReply::Pending { job_key } => job_key,
    };

    debug!("Provider {} accepted remote job {}", descriptor.name, job_key);
    for _ in 0..descriptor.poll.max_attempts {
        tokio::time::sleep(descriptor.poll.interval).await;
        match bounded(descriptor.timeout, entry.provider.poll(&job_key)).await? {
            PollStatus::Pending => continue,
            PollStatus::Ready => {
                return bounded(descriptor.timeout, entry.provider.fetch(&job_key)).await;
            }
            PollStatus::Failed(reason) => return Err(ProviderError::AsyncFailed(reason)),
        }
    }

    Err(ProviderError::PollExhausted {
        attempts: descriptor.poll.max_attempts,
    })
}
