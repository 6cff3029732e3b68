//! Typed configuration models.
//!
//! # Design
//! - Pure data carriers; every field has a default so an empty document is valid
//!   apart from the provider credentials.
//! - Durations are stored in their natural unit and exposed through accessors.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use torrelay_core::{DownloadAction, FinishedAction, JobPolicy};

use crate::defaults;

/// Root configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Scheduler and concurrency knobs.
    pub orchestrator: OrchestratorSettings,
    /// Debrid provider selection and transport.
    pub provider: ProviderSettings,
    /// Download transport selection.
    pub downloader: DownloaderSettings,
    /// Policy applied to submissions that carry no overrides.
    pub jobs: JobDefaults,
    /// Log level and format.
    pub logging: LoggingSettings,
}

/// Scheduler and concurrency knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Interval between driver ticks, in milliseconds.
    pub tick_interval_ms: u64,
    /// Global cap on active (non-queued, non-terminal) jobs.
    pub max_parallel_jobs: usize,
    /// Optional per-category caps on active jobs.
    pub category_limits: BTreeMap<String, usize>,
    /// Concurrent provider calls.
    pub max_provider_calls: usize,
    /// Concurrent transfers across all jobs.
    pub max_parallel_downloads: usize,
    /// Concurrent transfers within a single job.
    pub max_downloads_per_job: usize,
    /// Queued jobs are held back while free space is below this value.
    pub min_free_space_bytes: u64,
    /// Root directory for finished downloads.
    pub download_root: PathBuf,
    /// Directory holding one JSON document per job; in-memory when unset.
    pub state_dir: Option<PathBuf>,
    /// Delay before a retryable error is re-queued, in seconds.
    pub job_retry_delay_secs: u64,
    /// Per-tick task fan-out.
    pub max_workers: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: defaults::TICK_INTERVAL_MS,
            max_parallel_jobs: defaults::MAX_PARALLEL_JOBS,
            category_limits: BTreeMap::new(),
            max_provider_calls: defaults::MAX_PROVIDER_CALLS,
            max_parallel_downloads: defaults::MAX_PARALLEL_DOWNLOADS,
            max_downloads_per_job: defaults::MAX_DOWNLOADS_PER_JOB,
            min_free_space_bytes: 0,
            download_root: PathBuf::from(defaults::DOWNLOAD_ROOT),
            state_dir: None,
            job_retry_delay_secs: defaults::JOB_RETRY_DELAY_SECS,
            max_workers: defaults::MAX_WORKERS,
        }
    }
}

impl OrchestratorSettings {
    /// Tick interval as a [`Duration`].
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Job retry delay as a [`Duration`].
    #[must_use]
    pub const fn job_retry_delay(&self) -> Duration {
        Duration::from_secs(self.job_retry_delay_secs)
    }
}

/// Supported debrid vendors.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Real-Debrid REST API.
    #[default]
    RealDebrid,
    /// AllDebrid v4 API.
    AllDebrid,
    /// Premiumize API.
    Premiumize,
    /// TorBox API (torrents and Usenet).
    #[serde(rename = "torbox")]
    TorBox,
}

impl ProviderKind {
    /// Stable label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RealDebrid => "real_debrid",
            Self::AllDebrid => "all_debrid",
            Self::Premiumize => "premiumize",
            Self::TorBox => "torbox",
        }
    }

    /// Published request quotas for the vendor.
    #[must_use]
    pub fn default_rate_tiers(self) -> Vec<RateTier> {
        match self {
            Self::RealDebrid => vec![RateTier::new("per_minute", 250, 60)],
            Self::AllDebrid => vec![
                RateTier::new("per_second", 12, 1),
                RateTier::new("per_minute", 600, 60),
            ],
            Self::Premiumize => vec![RateTier::new("per_minute", 100, 60)],
            Self::TorBox => vec![
                RateTier::new("per_second", 5, 1),
                RateTier::new("per_minute", 300, 60),
            ],
        }
    }
}

/// One sliding-window quota.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateTier {
    /// Label used in logs.
    pub name: String,
    /// Requests allowed per window.
    pub max_requests: usize,
    /// Window length in seconds.
    pub per_secs: u64,
    /// Callers allowed to wait for a slot before being rejected.
    #[serde(default = "default_queue_limit")]
    pub queue_limit: usize,
}

const fn default_queue_limit() -> usize {
    defaults::RATE_QUEUE_LIMIT
}

impl RateTier {
    /// Build a tier with the default queue bound.
    #[must_use]
    pub fn new(name: &str, max_requests: usize, per_secs: u64) -> Self {
        Self {
            name: name.to_string(),
            max_requests,
            per_secs,
            queue_limit: defaults::RATE_QUEUE_LIMIT,
        }
    }

    /// Window as a [`Duration`].
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.per_secs)
    }
}

/// Retry knobs for outbound provider calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetrySettings {
    /// Attempts including the first one.
    pub max_attempts: u32,
    /// Backoff base, in milliseconds.
    pub base_delay_ms: u64,
    /// Backoff ceiling, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: defaults::RETRY_MAX_ATTEMPTS,
            base_delay_ms: defaults::RETRY_BASE_DELAY_MS,
            max_delay_ms: defaults::RETRY_MAX_DELAY_MS,
        }
    }
}

/// Debrid provider selection and transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderSettings {
    /// Vendor.
    pub kind: ProviderKind,
    /// API token (overridable via `TORRELAY_PROVIDER_API_KEY`).
    pub api_key: String,
    /// Override for the vendor's API base URL.
    pub base_url: Option<String>,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Sliding-window quotas; vendor defaults when empty.
    pub rate_limits: Vec<RateTier>,
    /// Retry behaviour.
    pub retry: RetrySettings,
    /// `User-Agent` header sent with every call.
    pub user_agent: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            api_key: String::new(),
            base_url: None,
            timeout_secs: defaults::PROVIDER_TIMEOUT_SECS,
            rate_limits: Vec::new(),
            retry: RetrySettings::default(),
            user_agent: defaults::USER_AGENT.to_string(),
        }
    }
}

impl ProviderSettings {
    /// Configured tiers, or the vendor's published quotas.
    #[must_use]
    pub fn effective_rate_tiers(&self) -> Vec<RateTier> {
        if self.rate_limits.is_empty() {
            self.kind.default_rate_tiers()
        } else {
            self.rate_limits.clone()
        }
    }

    /// Request timeout as a [`Duration`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Supported download transports.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DownloaderKind {
    /// Single-stream HTTP GET.
    #[default]
    Simple,
    /// Parallel byte-range HTTP GETs.
    Multipart,
    /// Delegate to an aria2 daemon over JSON-RPC.
    Aria2,
    /// Link files from a provider mount.
    Symlink,
    /// Write `.strm` placeholders.
    Strm,
}

impl DownloaderKind {
    /// Stable label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Multipart => "multipart",
            Self::Aria2 => "aria2",
            Self::Symlink => "symlink",
            Self::Strm => "strm",
        }
    }
}

/// aria2 JSON-RPC connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Aria2Settings {
    /// JSON-RPC endpoint.
    pub url: String,
    /// `--rpc-secret` token.
    pub secret: Option<String>,
    /// Submission attempts before giving up.
    pub submit_attempts: u32,
    /// Delay between submission attempts, in milliseconds.
    pub submit_delay_ms: u64,
    /// Status polling interval, in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for Aria2Settings {
    fn default() -> Self {
        Self {
            url: defaults::ARIA2_URL.to_string(),
            secret: None,
            submit_attempts: defaults::ARIA2_SUBMIT_ATTEMPTS,
            submit_delay_ms: defaults::ARIA2_SUBMIT_DELAY_MS,
            poll_interval_ms: defaults::ARIA2_POLL_INTERVAL_MS,
        }
    }
}

/// Download transport selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DownloaderSettings {
    /// Transport.
    pub kind: DownloaderKind,
    /// Byte-range parts per file for the multi-part transport.
    pub part_count: usize,
    /// Parts fetched concurrently.
    pub parallel_parts: usize,
    /// Retries per part.
    pub part_retries: u32,
    /// Files smaller than this use a single stream.
    pub min_part_size_bytes: u64,
    /// aria2 connection.
    pub aria2: Aria2Settings,
    /// Root of the provider mount (symlink transport).
    pub mount_root: Option<PathBuf>,
}

impl Default for DownloaderSettings {
    fn default() -> Self {
        Self {
            kind: DownloaderKind::default(),
            part_count: defaults::PART_COUNT,
            parallel_parts: defaults::PARALLEL_PARTS,
            part_retries: defaults::PART_RETRIES,
            min_part_size_bytes: defaults::MIN_PART_SIZE_BYTES,
            aria2: Aria2Settings::default(),
            mount_root: None,
        }
    }
}

/// Policy applied to submissions without explicit overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JobDefaults {
    /// File selection strategy.
    pub download_action: DownloadAction,
    /// Cleanup after completion.
    pub finished_action: FinishedAction,
    /// Minimum size of auto-selected files.
    pub download_min_size_bytes: u64,
    /// Regular expression auto-selected paths must match.
    pub include_pattern: Option<String>,
    /// Regular expression excluding paths from auto-selection.
    pub exclude_pattern: Option<String>,
    /// Automatic job re-queues.
    pub job_retry_budget: u32,
    /// Automatic retries per download.
    pub download_retry_budget: u32,
    /// Maximum job age in minutes.
    pub lifetime_minutes: Option<u64>,
    /// Remove errored jobs automatically.
    pub delete_on_error: bool,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self::from(&JobPolicy::default())
    }
}

impl From<&JobPolicy> for JobDefaults {
    fn from(policy: &JobPolicy) -> Self {
        Self {
            download_action: policy.download_action,
            finished_action: policy.finished_action,
            download_min_size_bytes: policy.download_min_size_bytes,
            include_pattern: policy.include_pattern.clone(),
            exclude_pattern: policy.exclude_pattern.clone(),
            job_retry_budget: policy.job_retry_budget,
            download_retry_budget: policy.download_retry_budget,
            lifetime_minutes: policy.lifetime_minutes,
            delete_on_error: policy.delete_on_error,
        }
    }
}

impl JobDefaults {
    /// Policy for a new job.
    #[must_use]
    pub fn policy(&self) -> JobPolicy {
        JobPolicy {
            download_action: self.download_action,
            finished_action: self.finished_action,
            download_min_size_bytes: self.download_min_size_bytes,
            include_pattern: self.include_pattern.clone(),
            exclude_pattern: self.exclude_pattern.clone(),
            job_retry_budget: self.job_retry_budget,
            download_retry_budget: self.download_retry_budget,
            lifetime_minutes: self.lifetime_minutes,
            priority: None,
            category: None,
            delete_on_error: self.delete_on_error,
        }
    }
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormatSetting {
    /// One JSON object per line.
    Json,
    /// Human-oriented output.
    Pretty,
}

/// Log level and format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive (overridable via `TORRELAY_LOG_LEVEL`).
    pub level: String,
    /// Format; inferred from the build profile when unset.
    pub format: Option<LogFormatSetting>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            format: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_defaults_mirror_policy_defaults() {
        let policy = JobDefaults::default().policy();
        assert_eq!(policy, JobPolicy::default());
    }

    #[test]
    fn vendor_tiers_apply_when_unset() {
        let mut provider = ProviderSettings {
            kind: ProviderKind::AllDebrid,
            ..ProviderSettings::default()
        };
        assert_eq!(provider.effective_rate_tiers().len(), 2);
        provider.rate_limits = vec![RateTier::new("custom", 1, 1)];
        assert_eq!(provider.effective_rate_tiers()[0].name, "custom");
    }
}
