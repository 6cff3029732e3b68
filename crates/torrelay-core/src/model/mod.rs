//! Core job domain types shared across the workspace.

mod magnet;

pub use magnet::MagnetLink;

use std::path::PathBuf;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use torrelay_events::JobState;
use uuid::Uuid;

/// Whether a job originates from a torrent or from Usenet.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Magnet URI or `.torrent` metainfo.
    Torrent,
    /// NZB link or file.
    Nzb,
}

/// Payload that should be handed to the provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobSource {
    /// Magnet URI.
    Magnet {
        /// Magnet URI to submit.
        uri: String,
    },
    /// Raw `.torrent` metainfo bytes.
    TorrentFile {
        /// Bencoded metainfo payload.
        bytes: Vec<u8>,
    },
    /// Remote NZB URL.
    NzbLink {
        /// URL the provider fetches the NZB from.
        url: String,
    },
    /// Raw NZB document.
    NzbFile {
        /// NZB payload.
        bytes: Vec<u8>,
        /// Original file name, forwarded to providers that require one.
        file_name: String,
    },
}

impl JobSource {
    /// Convenience constructor for magnet-based sources.
    #[must_use]
    pub fn magnet(uri: impl Into<String>) -> Self {
        Self::Magnet { uri: uri.into() }
    }

    /// Torrent versus NZB.
    #[must_use]
    pub const fn kind(&self) -> JobKind {
        match self {
            Self::Magnet { .. } | Self::TorrentFile { .. } => JobKind::Torrent,
            Self::NzbLink { .. } | Self::NzbFile { .. } => JobKind::Nzb,
        }
    }
}

/// Which files are selected when the provider asks for a selection.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DownloadAction {
    /// Select every file (subject to the size and pattern filters).
    #[default]
    All,
    /// Select only the files the provider reports as instantly available.
    AvailableOnly,
    /// Park the job until the user selects files.
    Manual,
}

/// Cleanup applied once every download finished.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishedAction {
    /// Keep both the provider entry and the job.
    #[default]
    None,
    /// Remove the provider entry and the job.
    RemoveAll,
    /// Remove only the provider entry.
    RemoveRemote,
    /// Remove only the job from the engine (local files stay).
    RemoveLocal,
}

impl FinishedAction {
    /// Whether the provider entry is deleted.
    #[must_use]
    pub const fn removes_remote(self) -> bool {
        matches!(self, Self::RemoveAll | Self::RemoveRemote)
    }

    /// Whether the job record is dropped from the engine.
    #[must_use]
    pub const fn removes_local(self) -> bool {
        matches!(self, Self::RemoveAll | Self::RemoveLocal)
    }
}

/// Per-job knobs controlling selection, retries, and cleanup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JobPolicy {
    /// File selection strategy.
    pub download_action: DownloadAction,
    /// Cleanup once finished.
    pub finished_action: FinishedAction,
    /// Files smaller than this are never auto-selected.
    pub download_min_size_bytes: u64,
    /// Regular expression a file path must match to be auto-selected.
    pub include_pattern: Option<String>,
    /// Regular expression excluding matching file paths from auto-selection.
    pub exclude_pattern: Option<String>,
    /// Automatic job-level re-queues allowed.
    pub job_retry_budget: u32,
    /// Automatic retries per download.
    pub download_retry_budget: u32,
    /// Maximum age of a non-terminal job, in minutes.
    pub lifetime_minutes: Option<u64>,
    /// Lower values are scheduled first; unset sorts last.
    pub priority: Option<i32>,
    /// Category label (also a download sub-directory).
    pub category: Option<String>,
    /// Delete the job (and its provider entry) when it errors terminally.
    pub delete_on_error: bool,
}

impl Default for JobPolicy {
    fn default() -> Self {
        Self {
            download_action: DownloadAction::All,
            finished_action: FinishedAction::None,
            download_min_size_bytes: 0,
            include_pattern: None,
            exclude_pattern: None,
            job_retry_budget: 2,
            download_retry_budget: 3,
            lifetime_minutes: None,
            priority: None,
            category: None,
            delete_on_error: false,
        }
    }
}

/// Canonical provider-side status, normalized from vendor vocabularies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    /// Provider is resolving metadata or queueing the content.
    Processing,
    /// Provider waits for a file selection before continuing.
    WaitingForFileSelection,
    /// Provider is fetching the content.
    Downloading,
    /// Provider is moving the content to its hosters.
    Uploading,
    /// Content is available for direct download.
    Finished,
    /// Provider gave up on the content.
    Error,
}

/// File reported by a provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderFile {
    /// Provider-specific file identifier.
    pub id: String,
    /// Path relative to the content root.
    pub path: String,
    /// File size in bytes.
    pub size_bytes: u64,
    /// Whether the provider currently has the file selected.
    pub selected: bool,
}

/// Snapshot of a provider entry (`DebridClientTorrent`). Only ever folded into a [`Job`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderTorrent {
    /// Provider identifier.
    pub id: String,
    /// Content hash.
    pub hash: String,
    /// Provider-reported name.
    pub name: String,
    /// Raw status string in the vendor vocabulary.
    pub raw_status: String,
    /// Optional vendor message accompanying the status.
    pub message: Option<String>,
    /// Total size in bytes.
    pub size_bytes: u64,
    /// Provider-side progress (0-100).
    pub progress: f64,
    /// Provider-side speed in bytes per second.
    pub speed_bps: u64,
    /// Connected seeders, when reported.
    pub seeders: Option<u32>,
    /// File listing, when available.
    pub files: Vec<ProviderFile>,
    /// Restricted links, when the provider exposes them on the listing.
    pub links: Vec<String>,
}

/// Restricted link returned by `get_download_infos`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadInfo {
    /// Provider link that still needs unrestricting.
    pub restricted_link: String,
    /// Remote file name, when known.
    pub file_name: Option<String>,
    /// Remote path relative to the content root (used by symlink downloads).
    pub remote_path: Option<String>,
    /// Expected size in bytes.
    pub size_bytes: Option<u64>,
}

/// Lifecycle of a single download.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    /// Waiting for a transfer slot.
    Pending,
    /// Transfer in flight.
    Downloading,
    /// Transfer completed.
    Finished,
    /// Transfer failed past its retry budget.
    Error,
}

/// One resolved file belonging to a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Download {
    /// Identifier of the download.
    pub id: Uuid,
    /// Owning job.
    pub job_id: Uuid,
    /// Provider link before unrestricting.
    pub restricted_link: String,
    /// Direct link, once unrestricted.
    pub link: Option<String>,
    /// Remote file name.
    pub file_name: Option<String>,
    /// Remote path relative to the content root.
    pub remote_path: Option<String>,
    /// Expected size in bytes.
    pub size_hint: Option<u64>,
    /// Local destination once a transfer completed.
    pub path: Option<PathBuf>,
    /// Current status.
    pub status: DownloadStatus,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Last failure message.
    pub last_error: Option<String>,
    /// Creation timestamp.
    pub added_at: DateTime<Utc>,
    /// Completion timestamp.
    pub finished_at: Option<DateTime<Utc>>,
    /// Transient byte total.
    #[serde(skip)]
    pub bytes_total: u64,
    /// Transient bytes written.
    #[serde(skip)]
    pub bytes_done: u64,
    /// Transient speed in bytes per second.
    #[serde(skip)]
    pub speed_bps: u64,
}

impl Download {
    /// Create a pending download from provider link metadata.
    #[must_use]
    pub fn new(job_id: Uuid, info: DownloadInfo, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            restricted_link: info.restricted_link,
            link: None,
            file_name: info.file_name,
            remote_path: info.remote_path,
            size_hint: info.size_bytes,
            path: None,
            status: DownloadStatus::Pending,
            retry_count: 0,
            last_error: None,
            added_at: now,
            finished_at: None,
            bytes_total: info.size_bytes.unwrap_or(0),
            bytes_done: 0,
            speed_bps: 0,
        }
    }

    /// Move `Pending → Downloading`. Returns `false` for any other state.
    pub fn begin(&mut self) -> bool {
        if self.status != DownloadStatus::Pending {
            return false;
        }
        self.status = DownloadStatus::Downloading;
        true
    }

    /// Move `Downloading → Finished`.
    pub fn finish(&mut self, path: PathBuf, bytes: u64, now: DateTime<Utc>) -> bool {
        if self.status != DownloadStatus::Downloading {
            return false;
        }
        self.status = DownloadStatus::Finished;
        self.path = Some(path);
        self.bytes_done = bytes;
        self.bytes_total = self.bytes_total.max(bytes);
        self.speed_bps = 0;
        self.last_error = None;
        self.finished_at = Some(now);
        true
    }

    /// Record a failed attempt. Returns the resulting status: `Pending` while
    /// attempts remain under `budget`, `Error` once exhausted.
    pub fn record_failure(&mut self, message: impl Into<String>, budget: u32) -> DownloadStatus {
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_error = Some(message.into());
        self.speed_bps = 0;
        self.status = if self.retry_count > budget {
            DownloadStatus::Error
        } else {
            DownloadStatus::Pending
        };
        self.status
    }

    /// Explicit retry: back to `Pending` with a fresh budget.
    pub fn reset(&mut self) {
        self.status = DownloadStatus::Pending;
        self.retry_count = 0;
        self.last_error = None;
        self.link = None;
        self.path = None;
        self.finished_at = None;
        self.bytes_done = 0;
        self.speed_bps = 0;
    }

    /// Put an interrupted transfer back in the queue without charging a retry.
    pub fn requeue_interrupted(&mut self) {
        if self.status == DownloadStatus::Downloading {
            self.status = DownloadStatus::Pending;
            self.speed_bps = 0;
        }
    }
}

/// Request accepted by the orchestrator's submission entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitJob {
    /// Payload to hand to the provider.
    pub source: JobSource,
    /// Policy overrides; defaults come from configuration.
    pub policy: JobPolicy,
    /// Display name used until the provider reports one.
    pub name_hint: Option<String>,
}

/// Unit of work tracked from submission to completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// Stable identifier.
    pub id: Uuid,
    /// Content hash, once known.
    pub hash: Option<String>,
    /// Display name.
    pub name: String,
    /// Original payload.
    pub source: JobSource,
    /// Per-job policy.
    pub policy: JobPolicy,
    /// Orchestrator state.
    pub state: JobState,
    /// Provider identifier once submitted.
    pub provider_id: Option<String>,
    /// Raw vendor status (diagnostic).
    pub raw_status: Option<String>,
    /// Canonical provider status.
    pub provider_status: Option<ProviderStatus>,
    /// Vendor message accompanying the status.
    pub provider_message: Option<String>,
    /// Provider-reported size in bytes.
    pub size_bytes: u64,
    /// Provider-side progress (0-100).
    pub progress: f64,
    /// Provider-side speed in bytes per second.
    pub speed_bps: u64,
    /// Seeders, when reported.
    pub seeders: Option<u32>,
    /// Provider file listing.
    pub files: Vec<ProviderFile>,
    /// File identifiers selected on the provider.
    pub selected_files: Vec<String>,
    /// Selection received from the user while waiting.
    pub pending_selection: Option<Vec<String>>,
    /// Provider no longer knows the entry.
    pub deleted_remotely: bool,
    /// Automatic re-queues consumed.
    pub retry_count: u32,
    /// Last terminal or transient failure.
    pub last_error: Option<String>,
    /// Whether `last_error` may be retried automatically.
    pub error_retryable: bool,
    /// Rate-limit deferral deadline.
    pub deferred_until: Option<DateTime<Utc>>,
    /// Earliest automatic re-queue.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Submission timestamp.
    pub added_at: DateTime<Utc>,
    /// Completion timestamp.
    pub completed_at: Option<DateTime<Utc>>,
    /// Resolved files.
    pub downloads: Vec<Download>,
}

impl Job {
    /// Build a queued job from a submission.
    #[must_use]
    pub fn new(id: Uuid, request: SubmitJob, hash: Option<String>, now: DateTime<Utc>) -> Self {
        let name = request
            .name_hint
            .filter(|name| !name.trim().is_empty())
            .or_else(|| hash.clone())
            .unwrap_or_else(|| id.to_string());
        Self {
            id,
            hash,
            name,
            source: request.source,
            policy: request.policy,
            state: JobState::Queued,
            provider_id: None,
            raw_status: None,
            provider_status: None,
            provider_message: None,
            size_bytes: 0,
            progress: 0.0,
            speed_bps: 0,
            seeders: None,
            files: Vec::new(),
            selected_files: Vec::new(),
            pending_selection: None,
            deleted_remotely: false,
            retry_count: 0,
            last_error: None,
            error_retryable: false,
            deferred_until: None,
            next_retry_at: None,
            added_at: now,
            completed_at: None,
            downloads: Vec::new(),
        }
    }

    /// Torrent versus NZB.
    #[must_use]
    pub const fn kind(&self) -> JobKind {
        self.source.kind()
    }

    /// Whether the job outlived its configured lifetime.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let Some(minutes) = self.policy.lifetime_minutes.filter(|m| *m > 0) else {
            return false;
        };
        let lifetime = i64::try_from(minutes)
            .ok()
            .and_then(ChronoDuration::try_minutes)
            .unwrap_or(ChronoDuration::MAX);
        now.signed_duration_since(self.added_at) > lifetime
    }

    /// Whether a rate-limit deferral is still in effect.
    #[must_use]
    pub fn is_deferred(&self, now: DateTime<Utc>) -> bool {
        self.deferred_until.is_some_and(|until| until > now)
    }

    /// Fold a provider snapshot into the job. Deterministic in its inputs.
    pub fn absorb(&mut self, snapshot: &ProviderTorrent, status: ProviderStatus) {
        if !snapshot.id.is_empty() {
            self.provider_id = Some(snapshot.id.clone());
        }
        if !snapshot.hash.is_empty() {
            self.hash = Some(snapshot.hash.to_ascii_lowercase());
        }
        if !snapshot.name.trim().is_empty() {
            self.name.clone_from(&snapshot.name);
        }
        self.raw_status = Some(snapshot.raw_status.clone());
        self.provider_status = Some(status);
        self.provider_message.clone_from(&snapshot.message);
        self.size_bytes = snapshot.size_bytes;
        self.progress = snapshot.progress.clamp(0.0, 100.0);
        self.speed_bps = snapshot.speed_bps;
        self.seeders = snapshot.seeders;
        if !snapshot.files.is_empty() {
            self.files.clone_from(&snapshot.files);
            let selected: Vec<String> = snapshot
                .files
                .iter()
                .filter(|file| file.selected)
                .map(|file| file.id.clone())
                .collect();
            if !selected.is_empty() {
                self.selected_files = selected;
            }
        }
    }

    /// Record that the provider no longer knows the entry.
    pub fn mark_deleted_remotely(&mut self) {
        self.deleted_remotely = true;
    }

    /// Whether every download finished successfully.
    #[must_use]
    pub fn downloads_complete(&self) -> bool {
        !self.downloads.is_empty()
            && self
                .downloads
                .iter()
                .all(|download| download.status == DownloadStatus::Finished)
    }

    /// Mutable lookup of a download.
    pub fn download_mut(&mut self, download_id: Uuid) -> Option<&mut Download> {
        self.downloads
            .iter_mut()
            .find(|download| download.id == download_id)
    }

    /// Forget everything learned from the provider so the job can be re-submitted.
    pub fn reset_provider_state(&mut self) {
        self.provider_id = None;
        self.raw_status = None;
        self.provider_status = None;
        self.provider_message = None;
        self.progress = 0.0;
        self.speed_bps = 0;
        self.seeders = None;
        self.selected_files.clear();
        self.pending_selection = None;
        self.deleted_remotely = false;
        self.downloads.clear();
        self.completed_at = None;
    }
}
