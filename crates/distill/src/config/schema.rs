use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::provider::{Capability, PollPolicy};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// SQLite file. Defaults to `~/.distill/data/distill.db`.
    #[serde(default)]
    pub database_path: Option<String>,
    /// Root directory of the content store.
    #[serde(default = "default_content_root")]
    pub content_root: String,
    /// Prefix for the poll and result URLs handed back on submission.
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_job_ttl_hours")]
    pub job_ttl_hours: u64,
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    /// Number of log entries returned by a status poll.
    #[serde(default = "default_recent_log_limit")]
    pub recent_log_limit: usize,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub provider_health: ProviderHealthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Refuse to start when a pipeline needs a capability with no provider.
    #[serde(default)]
    pub strict_capabilities: bool,
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_content_root() -> String {
    dirs::home_dir()
        .map(|home| {
            home.join(".distill")
                .join("content")
                .to_string_lossy()
                .into_owned()
        })
        .unwrap_or_else(|| "content".to_string())
}

fn default_api_base() -> String {
    "/api/v1".to_string()
}

fn default_job_ttl_hours() -> u64 {
    24
}

fn default_stage_timeout_secs() -> u64 {
    600
}

fn default_recent_log_limit() -> usize {
    20
}

/// A local summarizer and page extractor, enough to run text and link jobs
/// with no remote provider configured.
fn default_providers() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig {
            name: "extractive".to_string(),
            kind: ProviderKind::Extractive,
            capability: Capability::Summarize,
            priority: 100,
            timeout_ms: default_timeout_ms(),
            endpoint: None,
            api_key: None,
            api_key_file: None,
            api_key_env: None,
            poll: None,
            options: Value::Null,
        },
        ProviderConfig {
            name: "page_scraper".to_string(),
            kind: ProviderKind::PageScraper,
            capability: Capability::FetchPage,
            priority: 100,
            timeout_ms: default_timeout_ms(),
            endpoint: None,
            api_key: None,
            api_key_file: None,
            api_key_env: None,
            poll: None,
            options: Value::Null,
        },
    ]
}

impl Config {
    pub fn database_path(&self) -> Option<PathBuf> {
        match self.database_path {
            Some(ref path) => Some(PathBuf::from(crate::secrets::expand_home(path))),
            None => crate::db::default_database_path(),
        }
    }

    pub fn content_root(&self) -> PathBuf {
        PathBuf::from(crate::secrets::expand_home(&self.content_root))
    }

    pub fn job_ttl(&self) -> Duration {
        Duration::from_secs(self.job_ttl_hours.saturating_mul(3600))
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,
    /// Running jobs untouched for this long are failed as stalled.
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold_secs: u64,
    /// Pending jobs untouched for this long are handed to the queue again.
    #[serde(default = "default_orphan_threshold")]
    pub orphan_threshold_secs: u64,
}

fn default_monitor_interval() -> u64 {
    300
}

fn default_stall_threshold() -> u64 {
    900
}

fn default_orphan_threshold() -> u64 {
    600
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval(),
            stall_threshold_secs: default_stall_threshold(),
            orphan_threshold_secs: default_orphan_threshold(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// JSON over HTTP; the remote side may answer synchronously or with a
    /// job key to poll.
    Http,
    PageScraper,
    Extractive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    pub capability: Capability,
    /// Lower runs first.
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_file: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub poll: Option<PollConfig>,
    /// Adapter-specific settings.
    #[serde(default)]
    pub options: Value,
}

fn default_priority() -> u32 {
    100
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Longest one attempt can take: the initial call plus, for remote
    /// providers that answer asynchronously, every poll and the final fetch.
    pub fn worst_case(&self) -> Duration {
        let call = self.timeout();
        match self.kind {
            ProviderKind::Http => {
                let poll = self.poll_policy();
                let per_poll = poll.interval.saturating_add(call);
                call.saturating_add(per_poll.saturating_mul(poll.max_attempts))
                    .saturating_add(call)
            }
            ProviderKind::PageScraper | ProviderKind::Extractive => call,
        }
    }

    pub fn poll_policy(&self) -> PollPolicy {
        self.poll
            .as_ref()
            .map(|p| PollPolicy {
                interval: Duration::from_millis(p.interval_ms),
                max_attempts: p.max_attempts,
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_poll_attempts")]
    pub max_attempts: u32,
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_poll_attempts() -> u32 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealthConfig {
    /// How long a failed provider is tried after healthy ones. `0` disables.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_cooldown_secs() -> u64 {
    60
}

impl Default for ProviderHealthConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl ProviderHealthConfig {
    pub fn cooldown(&self) -> Option<Duration> {
        (self.cooldown_secs > 0).then(|| Duration::from_secs(self.cooldown_secs))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}
