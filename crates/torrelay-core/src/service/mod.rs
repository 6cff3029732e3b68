//! Collaborator contracts: provider clients, persistence, disk probing, and time.
//!
//! # Design
//!
//! - `DebridClient` normalizes every vendor into one contract; vendors only
//!   override what they actually support and inherit the unsupported defaults.
//! - `update_data` is provided once on top of `get_torrent` and the vendor's
//!   status table so every vendor folds snapshots identically.
//! - Persistence and disk probes are synchronous and cheap; the orchestrator
//!   calls them from task context without holding more than one job lock.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::model::{DownloadInfo, Job, JobSource, ProviderFile, ProviderTorrent};
use crate::status::StatusTable;

/// Contract implemented by every debrid vendor.
#[async_trait]
pub trait DebridClient: Send + Sync {
    /// Stable vendor label used in logs and metrics.
    fn provider_name(&self) -> &'static str;

    /// Vendor status table used to normalize raw statuses.
    fn status_table(&self) -> StatusTable;

    /// Submit any source, dispatching to the matching `add_*` operation.
    async fn add(&self, source: &JobSource) -> EngineResult<String> {
        match source {
            JobSource::Magnet { uri } => self.add_magnet(uri).await,
            JobSource::TorrentFile { bytes } => self.add_torrent_file(bytes).await,
            JobSource::NzbLink { url } => self.add_nzb_link(url).await,
            JobSource::NzbFile { bytes, file_name } => self.add_nzb_file(bytes, file_name).await,
        }
    }

    /// Submit a magnet URI, returning the provider identifier.
    async fn add_magnet(&self, magnet: &str) -> EngineResult<String>;

    /// Submit `.torrent` metainfo, returning the provider identifier.
    async fn add_torrent_file(&self, bytes: &[u8]) -> EngineResult<String>;

    /// Submit an NZB URL; default implementation reports lack of support.
    async fn add_nzb_link(&self, url: &str) -> EngineResult<String> {
        let _ = url;
        Err(EngineError::Unsupported {
            operation: "add_nzb_link",
        })
    }

    /// Submit an NZB document; default implementation reports lack of support.
    async fn add_nzb_file(&self, bytes: &[u8], file_name: &str) -> EngineResult<String> {
        let _ = (bytes, file_name);
        Err(EngineError::Unsupported {
            operation: "add_nzb_file",
        })
    }

    /// List every entry the account holds.
    async fn get_downloads(&self) -> EngineResult<Vec<ProviderTorrent>>;

    /// Fetch one entry by the job's provider identifier.
    ///
    /// Returns [`EngineError::NotFound`] when the provider no longer knows it.
    async fn get_torrent(&self, job: &Job) -> EngineResult<ProviderTorrent>;

    /// Files the provider can serve instantly for a hash.
    async fn get_available_files(&self, hash: &str) -> EngineResult<Vec<ProviderFile>>;

    /// Select files on the provider; returns how many files are selected.
    ///
    /// Default implementation selects nothing and reports the full file count.
    async fn select_files(&self, job: &Job, file_ids: &[String]) -> EngineResult<usize> {
        let _ = file_ids;
        Ok(job.files.len())
    }

    /// Remove the provider entry.
    async fn delete(&self, job: &Job) -> EngineResult<()>;

    /// Turn a restricted link into a direct download URL.
    async fn unrestrict(&self, job: &Job, link: &str) -> EngineResult<String>;

    /// Restricted links for a finished entry.
    async fn get_download_infos(&self, job: &Job) -> EngineResult<Vec<DownloadInfo>>;

    /// Fold a snapshot (fetched when absent) into the job.
    ///
    /// A provider "not found" marks the job as deleted remotely instead of
    /// failing. Calling it twice without a provider change leaves the job
    /// unchanged.
    async fn update_data(&self, job: &mut Job, snapshot: Option<ProviderTorrent>) -> EngineResult<()> {
        if job.provider_id.is_none() && snapshot.is_none() {
            return Ok(());
        }
        let snapshot = match snapshot {
            Some(snapshot) => snapshot,
            None => match self.get_torrent(job).await {
                Ok(snapshot) => snapshot,
                Err(EngineError::NotFound { .. }) => {
                    debug!(
                        job_id = %job.id,
                        provider = self.provider_name(),
                        "provider entry vanished"
                    );
                    job.mark_deleted_remotely();
                    return Ok(());
                }
                Err(err) => return Err(err),
            },
        };
        let status = self
            .status_table()
            .resolve(&snapshot.raw_status, job.provider_status);
        job.absorb(&snapshot, status);
        Ok(())
    }
}

/// Validate that a restricted link is an absolute HTTP(S) URL.
///
/// # Errors
///
/// Returns [`EngineError::InvalidArgument`] for anything else.
pub fn validate_link(link: &str) -> EngineResult<Url> {
    let invalid = |reason: &'static str| EngineError::InvalidArgument {
        field: "link",
        reason,
        value: Some(link.to_string()),
    };
    let url = Url::parse(link.trim()).map_err(|_| invalid("unparsable"))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        _ => Err(invalid("scheme")),
    }
}

/// Synchronous job persistence.
pub trait JobStore: Send + Sync {
    /// Load every persisted job.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Storage`] when the backing store is unreadable.
    fn load_jobs(&self) -> EngineResult<Vec<Job>>;

    /// Insert or replace a job.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Storage`] when the write fails.
    fn save_job(&self, job: &Job) -> EngineResult<()>;

    /// Remove a job; removing an unknown job is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Storage`] when the delete fails.
    fn delete_job(&self, job_id: Uuid) -> EngineResult<()>;
}

/// Free-space probe for the download volume.
pub trait DiskSpaceProbe: Send + Sync {
    /// Bytes available to unprivileged writers at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Storage`] when no volume backs the path.
    fn available_space(&self, path: &Path) -> EngineResult<u64>;
}

/// Injected time source.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::model::{JobPolicy, ProviderStatus, SubmitJob};
    use crate::status::StatusRule;
    use torrelay_events::JobState;

    const RULES: &[StatusRule] = &[
        StatusRule::exact("downloaded", ProviderStatus::Finished),
        StatusRule::exact("downloading", ProviderStatus::Downloading),
    ];

    struct ScriptedClient {
        responses: Mutex<Vec<EngineResult<ProviderTorrent>>>,
    }

    #[async_trait]
    impl DebridClient for ScriptedClient {
        fn provider_name(&self) -> &'static str {
            "scripted"
        }

        fn status_table(&self) -> StatusTable {
            StatusTable::new("scripted", RULES)
        }

        async fn add_magnet(&self, _magnet: &str) -> EngineResult<String> {
            Ok("id-1".into())
        }

        async fn add_torrent_file(&self, _bytes: &[u8]) -> EngineResult<String> {
            Ok("id-2".into())
        }

        async fn get_downloads(&self) -> EngineResult<Vec<ProviderTorrent>> {
            Ok(Vec::new())
        }

        async fn get_torrent(&self, _job: &Job) -> EngineResult<ProviderTorrent> {
            self.responses
                .lock()
                .expect("responses mutex poisoned")
                .remove(0)
        }

        async fn get_available_files(&self, _hash: &str) -> EngineResult<Vec<ProviderFile>> {
            Ok(Vec::new())
        }

        async fn delete(&self, _job: &Job) -> EngineResult<()> {
            Ok(())
        }

        async fn unrestrict(&self, _job: &Job, link: &str) -> EngineResult<String> {
            validate_link(link).map(|url| url.to_string())
        }

        async fn get_download_infos(&self, _job: &Job) -> EngineResult<Vec<DownloadInfo>> {
            Ok(Vec::new())
        }
    }

    fn job() -> Job {
        let mut job = Job::new(
            Uuid::new_v4(),
            SubmitJob {
                source: JobSource::NzbLink {
                    url: "https://indexer/nzb".into(),
                },
                policy: JobPolicy::default(),
                name_hint: None,
            },
            None,
            Utc::now(),
        );
        job.provider_id = Some("id-1".into());
        job
    }

    fn snapshot(raw: &str) -> ProviderTorrent {
        ProviderTorrent {
            id: "id-1".into(),
            raw_status: raw.into(),
            ..ProviderTorrent::default()
        }
    }

    #[tokio::test]
    async fn nzb_sources_are_unsupported_by_default() {
        let client = ScriptedClient {
            responses: Mutex::new(Vec::new()),
        };
        let err = client.add(&job().source).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Unsupported {
                operation: "add_nzb_link"
            }
        ));
    }

    #[tokio::test]
    async fn update_data_keeps_status_for_unknown_values() -> anyhow::Result<()> {
        let client = ScriptedClient {
            responses: Mutex::new(vec![Ok(snapshot("downloading")), Ok(snapshot("mystery"))]),
        };
        let mut job = job();
        client.update_data(&mut job, None).await?;
        assert_eq!(job.provider_status, Some(ProviderStatus::Downloading));
        client.update_data(&mut job, None).await?;
        assert_eq!(job.provider_status, Some(ProviderStatus::Downloading));
        assert_eq!(job.raw_status.as_deref(), Some("mystery"));
        assert_eq!(job.state, JobState::Queued, "update_data never moves job state");
        Ok(())
    }

    #[tokio::test]
    async fn vanished_entries_are_flagged_not_failed() -> anyhow::Result<()> {
        let client = ScriptedClient {
            responses: Mutex::new(vec![Err(EngineError::not_found("torrent", "id-1"))]),
        };
        let mut job = job();
        client.update_data(&mut job, None).await?;
        assert!(job.deleted_remotely);
        Ok(())
    }

    #[tokio::test]
    async fn default_selection_reports_file_count() -> anyhow::Result<()> {
        let client = ScriptedClient {
            responses: Mutex::new(Vec::new()),
        };
        let mut job = job();
        job.files = vec![
            ProviderFile {
                id: "1".into(),
                path: "a".into(),
                size_bytes: 1,
                selected: false,
            },
            ProviderFile {
                id: "2".into(),
                path: "b".into(),
                size_bytes: 1,
                selected: false,
            },
        ];
        assert_eq!(client.select_files(&job, &["1".into()]).await?, 2);
        Ok(())
    }

    #[test]
    fn link_validation_rejects_non_http() {
        assert!(validate_link("https://host/file").is_ok());
        assert!(validate_link("ftp://host/file").is_err());
        assert!(validate_link("garbage").is_err());
    }
}
