//! Delegation to an aria2 daemon over JSON-RPC.
//!
//! # Design
//! - The gid is derived from the download id, so a resubmission after a
//!   restart addresses the same aria2 entry.
//! - A "GID is not unique" rejection means a stale entry survived; it is
//!   purged and the submission counts as a failed attempt.
//! - Cancellation removes the gid before the handle reports.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use torrelay_core::transfer::ensure_dir;
use torrelay_core::{
    DownloadHandle, DownloadRequest, Downloader, TransferFailure, TransferOutcome,
    TransferProgress, TransferSuccess,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DownloaderError, DownloaderResult};

/// Status of one aria2 entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Aria2Status {
    /// `active`, `waiting`, `paused`, `error`, `complete`, or `removed`.
    pub status: String,
    /// Total length in bytes.
    pub total_length: u64,
    /// Completed length in bytes.
    pub completed_length: u64,
    /// Current speed in bytes per second.
    pub download_speed: u64,
    /// Error message reported by aria2.
    pub error_message: Option<String>,
}

/// JSON-RPC surface used by [`Aria2Downloader`].
#[async_trait]
pub trait Aria2Rpc: Send + Sync {
    /// `aria2.addUri` with an explicit gid; returns the gid aria2 accepted.
    async fn add_uri(
        &self,
        gid: &str,
        url: &str,
        dir: &Path,
        out: &str,
    ) -> DownloaderResult<String>;

    /// `aria2.tellStatus`.
    async fn tell_status(&self, gid: &str) -> DownloaderResult<Aria2Status>;

    /// `aria2.forceRemove` followed by `aria2.removeDownloadResult`.
    async fn remove(&self, gid: &str) -> DownloaderResult<()>;
}

/// aria2 JSON-RPC over HTTP.
#[derive(Debug, Clone)]
pub struct HttpAria2Rpc {
    http: Client,
    url: String,
    secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStatus {
    status: String,
    #[serde(default)]
    total_length: String,
    #[serde(default)]
    completed_length: String,
    #[serde(default)]
    download_speed: String,
    #[serde(default)]
    error_message: Option<String>,
}

impl From<RawStatus> for Aria2Status {
    fn from(raw: RawStatus) -> Self {
        Self {
            status: raw.status,
            total_length: raw.total_length.parse().unwrap_or(0),
            completed_length: raw.completed_length.parse().unwrap_or(0),
            download_speed: raw.download_speed.parse().unwrap_or(0),
            error_message: raw.error_message.filter(|message| !message.is_empty()),
        }
    }
}

impl HttpAria2Rpc {
    /// Bind to an endpoint such as `http://127.0.0.1:6800/jsonrpc`.
    #[must_use]
    pub fn new(http: Client, url: impl Into<String>, secret: Option<String>) -> Self {
        Self {
            http,
            url: url.into(),
            secret,
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Vec<Value>,
    ) -> DownloaderResult<T> {
        let mut full = Vec::with_capacity(params.len() + 1);
        if let Some(secret) = &self.secret {
            full.push(Value::String(format!("token:{secret}")));
        }
        full.extend(params);
        let body = json!({
            "jsonrpc": "2.0",
            "id": Uuid::new_v4().to_string(),
            "method": method,
            "params": full,
        });
        let rpc_err = |detail: String| DownloaderError::Rpc { method, detail };
        let response: RpcResponse<T> = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|err| rpc_err(err.to_string()))?
            .json()
            .await
            .map_err(|err| rpc_err(err.to_string()))?;
        if let Some(error) = response.error {
            return Err(rpc_err(error.message));
        }
        response
            .result
            .ok_or_else(|| rpc_err("response without result".into()))
    }
}

#[async_trait]
impl Aria2Rpc for HttpAria2Rpc {
    async fn add_uri(
        &self,
        gid: &str,
        url: &str,
        dir: &Path,
        out: &str,
    ) -> DownloaderResult<String> {
        self.call(
            "aria2.addUri",
            vec![
                json!([url]),
                json!({ "gid": gid, "dir": dir.to_string_lossy(), "out": out }),
            ],
        )
        .await
    }

    async fn tell_status(&self, gid: &str) -> DownloaderResult<Aria2Status> {
        let raw: RawStatus = self
            .call(
                "aria2.tellStatus",
                vec![
                    json!(gid),
                    json!([
                        "status",
                        "totalLength",
                        "completedLength",
                        "downloadSpeed",
                        "errorMessage"
                    ]),
                ],
            )
            .await?;
        Ok(raw.into())
    }

    async fn remove(&self, gid: &str) -> DownloaderResult<()> {
        let removed: DownloaderResult<String> =
            self.call("aria2.forceRemove", vec![json!(gid)]).await;
        if let Err(err) = removed {
            debug!(gid, error = %err, "forceRemove failed");
        }
        let _: String = self
            .call("aria2.removeDownloadResult", vec![json!(gid)])
            .await?;
        Ok(())
    }
}

/// Submission and polling knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aria2Options {
    /// Submission attempts before giving up.
    pub submit_attempts: u32,
    /// Delay between submission attempts.
    pub submit_delay: Duration,
    /// Status polling interval.
    pub poll_interval: Duration,
}

impl Default for Aria2Options {
    fn default() -> Self {
        Self {
            submit_attempts: 5,
            submit_delay: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Hands transfers to aria2 and tracks them to completion.
#[derive(Clone)]
pub struct Aria2Downloader {
    rpc: Arc<dyn Aria2Rpc>,
    options: Aria2Options,
}

impl Aria2Downloader {
    /// Build on any RPC transport.
    #[must_use]
    pub fn new(rpc: Arc<dyn Aria2Rpc>, options: Aria2Options) -> Self {
        Self { rpc, options }
    }
}

/// aria2 gid (16 hex digits) for a download.
#[must_use]
pub fn gid_for(download_id: Uuid) -> String {
    format!("{:016x}", download_id.as_u64_pair().0)
}

fn is_duplicate(err: &DownloaderError) -> bool {
    matches!(
        err,
        DownloaderError::Rpc { detail, .. }
            if detail.contains("not unique") || detail.contains("already")
    )
}

impl Downloader for Aria2Downloader {
    fn name(&self) -> &'static str {
        "aria2"
    }

    fn start(&self, request: DownloadRequest) -> DownloadHandle {
        let progress = Arc::new(TransferProgress::default());
        let rpc = Arc::clone(&self.rpc);
        let options = self.options;
        let observed = Arc::clone(&progress);
        let cancel = request.cancel.clone();
        DownloadHandle::spawn_cooperative(cancel, progress, async move {
            delegate(rpc.as_ref(), options, &request, &observed).await
        })
    }
}

async fn delegate(
    rpc: &dyn Aria2Rpc,
    options: Aria2Options,
    request: &DownloadRequest,
    progress: &TransferProgress,
) -> TransferOutcome {
    let gid = gid_for(request.download_id);
    let file_name = request.resolved_file_name();
    ensure_dir(&request.destination_dir)
        .await
        .map_err(DownloaderError::io("create_dir", &request.destination_dir))?;

    let attempts = submit(rpc, options, request, &gid, &file_name).await?;
    info!(download_id = %request.download_id, gid, attempts, "handed to aria2");

    let path: PathBuf = request.destination_dir.join(&file_name);
    let mut status_failures = 0;
    loop {
        tokio::select! {
            biased;
            () = request.cancel.cancelled() => {
                if let Err(err) = rpc.remove(&gid).await {
                    warn!(gid, error = %err, "failed to remove cancelled aria2 entry");
                }
                return Err(TransferFailure::Cancelled);
            }
            () = tokio::time::sleep(options.poll_interval) => {}
        }

        let status = match rpc.tell_status(&gid).await {
            Ok(status) => {
                status_failures = 0;
                status
            }
            Err(err) => {
                status_failures += 1;
                if status_failures >= options.submit_attempts.max(1) {
                    return Err(err.into());
                }
                debug!(gid, error = %err, "tellStatus failed");
                continue;
            }
        };
        if status.total_length > 0 {
            progress.set_total(status.total_length);
        }
        progress.set_done(status.completed_length);

        match status.status.as_str() {
            "complete" => {
                return Ok(TransferSuccess {
                    path,
                    bytes_written: status.completed_length,
                    attempts,
                });
            }
            "error" => {
                return Err(TransferFailure::failed(
                    status
                        .error_message
                        .unwrap_or_else(|| "aria2 reported an error".into()),
                ));
            }
            "removed" => return Err(TransferFailure::failed("removed from aria2")),
            _ => {}
        }
    }
}

async fn submit(
    rpc: &dyn Aria2Rpc,
    options: Aria2Options,
    request: &DownloadRequest,
    gid: &str,
    file_name: &str,
) -> Result<u32, TransferFailure> {
    let max_attempts = options.submit_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match rpc
            .add_uri(gid, &request.url, &request.destination_dir, file_name)
            .await
        {
            Ok(_) => return Ok(attempt),
            Err(err) => {
                if is_duplicate(&err) {
                    warn!(gid, "purging stale aria2 entry");
                    if let Err(remove_err) = rpc.remove(gid).await {
                        debug!(gid, error = %remove_err, "stale entry removal failed");
                    }
                }
                if attempt >= max_attempts {
                    return Err(err.into());
                }
                debug!(gid, attempt, error = %err, "aria2 submission failed");
            }
        }
        tokio::select! {
            biased;
            () = request.cancel.cancelled() => return Err(TransferFailure::Cancelled),
            () = tokio::time::sleep(options.submit_delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gid_is_stable_hex() {
        let id = Uuid::from_u128(0x0123_4567_89ab_cdef_0000_0000_0000_0001);
        assert_eq!(gid_for(id), "0123456789abcdef");
        assert_eq!(gid_for(id).len(), 16);
    }

    #[test]
    fn duplicate_rejections_are_recognised() {
        assert!(is_duplicate(&DownloaderError::Rpc {
            method: "aria2.addUri",
            detail: "GID 0123456789abcdef is not unique.".into(),
        }));
        assert!(!is_duplicate(&DownloaderError::Rpc {
            method: "aria2.addUri",
            detail: "connection refused".into(),
        }));
    }
}
