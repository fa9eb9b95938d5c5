use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::config::schema::{Config, ProviderKind};
use crate::error::ConfigError;
use crate::pipeline::registry::required_capabilities;
use crate::provider::Capability;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.worker_count == 0 {
        return Err(ConfigError::Validation {
            message: "worker_count must be at least 1".to_string(),
        });
    }

    if config.monitor.stall_threshold_secs < config.monitor.interval_secs {
        log::warn!(
            "Stall threshold ({}s) is shorter than the monitor interval ({}s)",
            config.monitor.stall_threshold_secs,
            config.monitor.interval_secs
        );
    }

    let mut names = HashSet::new();
    for provider in &config.providers {
        if !names.insert(provider.name.as_str()) {
            return Err(ConfigError::InvalidProvider {
                name: provider.name.clone(),
                reason: "Duplicate provider name".to_string(),
            });
        }
        validate_provider_kind(
            &provider.name,
            provider.kind,
            provider.capability,
            provider.endpoint.as_deref(),
        )?;
    }

    for (capability, budget) in over_budget_chains(config) {
        log::warn!(
            "Providers for {} may need up to {}s, longer than the {}s stage timeout; \
             later providers get an equal share of the remaining time",
            capability,
            budget.as_secs(),
            config.stage_timeout_secs
        );
    }

    check_capability_coverage(config)
}

/// Capabilities whose providers, all failing slowly, would outlast one stage.
pub fn over_budget_chains(config: &Config) -> Vec<(Capability, Duration)> {
    let mut budgets: HashMap<Capability, Duration> = HashMap::new();
    for provider in &config.providers {
        let budget = budgets.entry(provider.capability).or_default();
        *budget = budget.saturating_add(provider.worst_case());
    }
    let stage_timeout = config.stage_timeout();
    let mut over: Vec<(Capability, Duration)> = budgets
        .into_iter()
        .filter(|(_, budget)| *budget > stage_timeout)
        .collect();
    over.sort_by_key(|(capability, _)| *capability);
    over
}

fn validate_provider_kind(
    name: &str,
    kind: ProviderKind,
    capability: Capability,
    endpoint: Option<&str>,
) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidProvider {
        name: name.to_string(),
        reason,
    };

    match kind {
        ProviderKind::Http => {
            let endpoint =
                endpoint.ok_or_else(|| invalid("http providers need an endpoint".to_string()))?;
            let url = reqwest::Url::parse(endpoint)
                .map_err(|e| invalid(format!("Invalid endpoint '{}': {}", endpoint, e)))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(invalid(format!("Unsupported endpoint scheme '{}'", url.scheme())));
            }
        }
        ProviderKind::PageScraper if capability != Capability::FetchPage => {
            return Err(invalid(format!(
                "page_scraper only provides fetch_page, not {}",
                capability
            )));
        }
        ProviderKind::Extractive if capability != Capability::Summarize => {
            return Err(invalid(format!(
                "extractive only provides summarize, not {}",
                capability
            )));
        }
        ProviderKind::PageScraper | ProviderKind::Extractive => {}
    }
    Ok(())
}

/// Capabilities some pipeline needs but no provider offers. Jobs that reach
/// such a stage fail with a provider error.
pub fn missing_capabilities(config: &Config) -> Vec<Capability> {
    let offered: HashSet<Capability> = config.providers.iter().map(|p| p.capability).collect();
    required_capabilities()
        .into_iter()
        .filter(|c| !offered.contains(c))
        .collect()
}

fn check_capability_coverage(config: &Config) -> Result<(), ConfigError> {
    let missing = missing_capabilities(config);
    if missing.is_empty() {
        return Ok(());
    }

    let list = missing
        .iter()
        .map(Capability::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    if config.strict_capabilities {
        return Err(ConfigError::Validation {
            message: format!("No provider configured for: {}", list),
        });
    }
    log::warn!("No provider configured for: {}", list);
    Ok(())
}
