//! Event payload types carried across the engine.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Identifier assigned to each event emitted by the engine.
pub type EventId = u64;

/// Default buffer size for the in-memory replay ring.
pub const DEFAULT_REPLAY_CAPACITY: usize = 1_024;

/// Orchestrator lifecycle states for a job.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted, waiting for a concurrency slot and disk space.
    Queued,
    /// Submitted to the provider, which is resolving the content.
    Processing,
    /// Provider needs an explicit file selection from the user.
    WaitingForFileSelection,
    /// Direct links are being fetched to local storage.
    Downloading,
    /// Every file landed locally and the finished action ran.
    Finished,
    /// Terminal failure (may be re-armed by a retry).
    Error,
}

impl JobState {
    /// Every state, in lifecycle order.
    pub const ALL: [Self; 6] = [
        Self::Queued,
        Self::Processing,
        Self::WaitingForFileSelection,
        Self::Downloading,
        Self::Finished,
        Self::Error,
    ];

    /// Whether the state ends the lifecycle.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }

    /// Whether the state occupies a concurrency slot.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Processing | Self::WaitingForFileSelection | Self::Downloading
        )
    }

    /// Stable lowercase label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::WaitingForFileSelection => "waiting_for_file_selection",
            Self::Downloading => "downloading",
            Self::Finished => "finished",
            Self::Error => "error",
        }
    }
}

/// Typed domain events surfaced across the engine.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A job was submitted.
    JobAdded {
        /// Identifier of the new job.
        job_id: Uuid,
        /// Display name known at submission time.
        name: String,
    },
    /// A job moved to a new orchestrator state.
    JobStateChanged {
        /// Job whose state changed.
        job_id: Uuid,
        /// Updated state.
        state: JobState,
    },
    /// A job was parked until a provider-specified instant.
    JobDeferred {
        /// Deferred job.
        job_id: Uuid,
        /// Earliest instant the job is evaluated again.
        until: DateTime<Utc>,
    },
    /// Periodic progress for an in-flight transfer.
    DownloadProgress {
        /// Owning job.
        job_id: Uuid,
        /// Transfer being tracked.
        download_id: Uuid,
        /// Bytes written so far.
        bytes_done: u64,
        /// Expected total bytes (0 when unknown).
        bytes_total: u64,
        /// Instantaneous speed in bytes per second.
        speed_bps: u64,
    },
    /// A transfer landed on disk.
    DownloadCompleted {
        /// Owning job.
        job_id: Uuid,
        /// Completed transfer.
        download_id: Uuid,
        /// Final local path.
        path: String,
    },
    /// A transfer attempt failed.
    DownloadFailed {
        /// Owning job.
        job_id: Uuid,
        /// Failed transfer.
        download_id: Uuid,
        /// Human-readable failure detail.
        message: String,
    },
    /// A job was removed from the engine.
    JobRemoved {
        /// Removed job.
        job_id: Uuid,
    },
    /// Queued jobs are held back because the download volume is low on space.
    DiskSpacePaused {
        /// Bytes currently available.
        available_bytes: u64,
        /// Configured minimum.
        required_bytes: u64,
    },
    /// Disk space recovered and queued jobs resume.
    DiskSpaceResumed {
        /// Bytes currently available.
        available_bytes: u64,
    },
    /// Batched notification listing the jobs changed during a tick.
    JobsChanged {
        /// Identifiers of the changed jobs.
        job_ids: Vec<Uuid>,
    },
}

impl Event {
    /// Machine-friendly discriminator for push consumers.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::JobAdded { .. } => "job_added",
            Self::JobStateChanged { .. } => "job_state_changed",
            Self::JobDeferred { .. } => "job_deferred",
            Self::DownloadProgress { .. } => "download_progress",
            Self::DownloadCompleted { .. } => "download_completed",
            Self::DownloadFailed { .. } => "download_failed",
            Self::JobRemoved { .. } => "job_removed",
            Self::DiskSpacePaused { .. } => "disk_space_paused",
            Self::DiskSpaceResumed { .. } => "disk_space_resumed",
            Self::JobsChanged { .. } => "jobs_changed",
        }
    }

    /// Job the event refers to, when it targets a single job.
    #[must_use]
    pub const fn job_id(&self) -> Option<Uuid> {
        match self {
            Self::JobAdded { job_id, .. }
            | Self::JobStateChanged { job_id, .. }
            | Self::JobDeferred { job_id, .. }
            | Self::DownloadProgress { job_id, .. }
            | Self::DownloadCompleted { job_id, .. }
            | Self::DownloadFailed { job_id, .. }
            | Self::JobRemoved { job_id } => Some(*job_id),
            Self::DiskSpacePaused { .. }
            | Self::DiskSpaceResumed { .. }
            | Self::JobsChanged { .. } => None,
        }
    }
}

/// Metadata wrapper around events. Each envelope tracks the event id and
/// emission timestamp.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct EventEnvelope {
    /// Sequential identifier.
    pub id: EventId,
    /// Emission timestamp.
    pub timestamp: DateTime<Utc>,
    /// Wrapped event.
    pub event: Event,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_and_terminal_states_are_disjoint() {
        for state in JobState::ALL {
            assert!(!(state.is_active() && state.is_terminal()), "{state:?}");
        }
        assert!(!JobState::Queued.is_active());
        assert!(JobState::WaitingForFileSelection.is_active());
    }

    #[test]
    fn job_id_is_absent_for_global_events() {
        let id = Uuid::new_v4();
        assert_eq!(Event::JobRemoved { job_id: id }.job_id(), Some(id));
        assert_eq!(
            Event::DiskSpaceResumed {
                available_bytes: 1
            }
            .job_id(),
            None
        );
        assert_eq!(Event::JobsChanged { job_ids: vec![id] }.kind(), "jobs_changed");
    }
}
