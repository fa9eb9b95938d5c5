//! Frozen capability → chain table, built once at startup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::extractive::ExtractiveSummarizer;
use super::http::HttpProvider;
use super::scraper::PageScraper;
use super::{Capability, ChainEntry, Provider, ProviderChain, ProviderDescriptor};
use crate::config::{Config, ProviderConfig, ProviderKind};
use crate::error::ConfigError;
use crate::secrets::resolve_secret_optional;

const DEFAULT_PAGE_CHARS: u64 = 100_000;

pub struct ProviderRegistry {
    chains: HashMap<Capability, ProviderChain>,
}

impl ProviderRegistry {
    pub fn builder() -> ProviderRegistryBuilder {
        ProviderRegistryBuilder::default()
    }

    pub fn chain(&self, capability: Capability) -> Option<&ProviderChain> {
        self.chains.get(&capability)
    }

    /// Capabilities with at least one provider, sorted.
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps: Vec<Capability> = self.chains.keys().copied().collect();
        caps.sort();
        caps
    }

    /// Instantiates every configured provider.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let mut builder = Self::builder().health_cooldown(config.provider_health.cooldown());
        for provider_config in &config.providers {
            let provider = build_provider(provider_config)?;
            let descriptor = ProviderDescriptor::new(
                provider_config.name.clone(),
                provider_config.capability,
                provider_config.priority,
            )
            .with_timeout(provider_config.timeout())
            .with_poll(provider_config.poll_policy());
            builder = builder.register(descriptor, provider);
        }
        let registry = builder.build();
        for capability in registry.capabilities() {
            if let Some(chain) = registry.chain(capability) {
                log::info!(
                    "Provider chain for {}: {}",
                    capability,
                    chain.provider_names().join(" -> ")
                );
            }
        }
        Ok(registry)
    }
}

fn option_u64(options: &Value, key: &str) -> Option<u64> {
    options.get(key).and_then(Value::as_u64)
}

fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn Provider>, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidProvider {
        name: config.name.clone(),
        reason,
    };

    match config.kind {
        ProviderKind::Http => {
            let endpoint = config
                .endpoint
                .as_deref()
                .ok_or_else(|| invalid("missing endpoint".to_string()))?;
            let api_key = resolve_secret_optional(
                config.api_key.as_deref(),
                config.api_key_file.as_deref(),
                config.api_key_env.as_deref(),
            )
            .map_err(|source| ConfigError::Secret {
                name: config.name.clone(),
                source,
            })?;
            let provider = HttpProvider::new(endpoint, api_key, config.timeout())
                .map_err(|e| invalid(e.to_string()))?;
            Ok(Arc::new(provider))
        }
        ProviderKind::PageScraper => {
            let max_chars = option_u64(&config.options, "max_chars").unwrap_or(DEFAULT_PAGE_CHARS);
            let provider = PageScraper::new(config.timeout(), max_chars as usize)
                .map_err(|e| invalid(e.to_string()))?;
            Ok(Arc::new(provider))
        }
        ProviderKind::Extractive => {
            let max_sentences = option_u64(&config.options, "max_sentences").unwrap_or(3);
            Ok(Arc::new(ExtractiveSummarizer::new(max_sentences as usize)))
        }
    }
}

#[derive(Default)]
pub struct ProviderRegistryBuilder {
    entries: Vec<ChainEntry>,
    cooldown: Option<Duration>,
}

impl ProviderRegistryBuilder {
    pub fn register(mut self, descriptor: ProviderDescriptor, provider: Arc<dyn Provider>) -> Self {
        self.entries.push(ChainEntry::new(descriptor, provider));
        self
    }

    pub fn health_cooldown(mut self, cooldown: Option<Duration>) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn build(self) -> ProviderRegistry {
        let mut grouped: HashMap<Capability, Vec<ChainEntry>> = HashMap::new();
        for entry in self.entries {
            grouped
                .entry(entry.descriptor.capability)
                .or_default()
                .push(entry);
        }
        let chains = grouped
            .into_iter()
            .map(|(capability, entries)| {
                (
                    capability,
                    ProviderChain::new(capability, entries, self.cooldown),
                )
            })
            .collect();
        ProviderRegistry { chains }
    }
}
