//! Downloader contract: requests, progress, completion handles.
//!
//! # Design
//!
//! - `Downloader::start` never blocks; the transfer runs on its own task and
//!   reports exactly once through a one-shot channel.
//! - Progress lives in atomics so the orchestrator can sample it without
//!   awaiting the transfer.
//! - Cancellation is a child of the process-wide token; a cancelled transfer
//!   reports `TransferFailure::Cancelled`, never success.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const SPEED_WINDOW: Duration = Duration::from_millis(500);

/// Everything a downloader needs to fetch one file.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Download being fetched.
    pub download_id: Uuid,
    /// Owning job.
    pub job_id: Uuid,
    /// Direct (unrestricted) URL.
    pub url: String,
    /// Directory the file lands in.
    pub destination_dir: PathBuf,
    /// Remote file name, if the provider reported one.
    pub file_name: Option<String>,
    /// Job display name used when the remote name is unusable.
    pub fallback_name: String,
    /// Path relative to the provider content root.
    pub remote_path: Option<String>,
    /// Expected size in bytes.
    pub size_hint: Option<u64>,
    /// Cancellation scope for the transfer.
    pub cancel: CancellationToken,
}

impl DownloadRequest {
    /// Local file name: the last component of the remote name, or the job
    /// display name when the remote name is empty or unusable.
    #[must_use]
    pub fn resolved_file_name(&self) -> String {
        self.file_name
            .as_deref()
            .and_then(sanitize_file_name)
            .or_else(|| sanitize_file_name(&self.fallback_name))
            .unwrap_or_else(|| self.download_id.to_string())
    }

    /// Final destination path.
    #[must_use]
    pub fn destination(&self) -> PathBuf {
        self.destination_dir.join(self.resolved_file_name())
    }
}

fn sanitize_file_name(candidate: &str) -> Option<String> {
    let last = candidate
        .rsplit(['/', '\\'])
        .find(|segment| !segment.trim().is_empty())?
        .trim();
    if last == "." || last == ".." || last.contains('\0') {
        return None;
    }
    Some(last.to_string())
}

/// Point-in-time progress values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Bytes written so far.
    pub bytes_done: u64,
    /// Expected total (0 when unknown).
    pub bytes_total: u64,
    /// Recent throughput in bytes per second.
    pub speed_bps: u64,
}

#[derive(Debug)]
struct SpeedSample {
    window_start: Instant,
    window_bytes: u64,
    bps: u64,
}

/// Lock-free progress counters shared between a transfer and its observer.
#[derive(Debug)]
pub struct TransferProgress {
    bytes_done: AtomicU64,
    bytes_total: AtomicU64,
    speed: Mutex<SpeedSample>,
}

impl Default for TransferProgress {
    fn default() -> Self {
        Self {
            bytes_done: AtomicU64::new(0),
            bytes_total: AtomicU64::new(0),
            speed: Mutex::new(SpeedSample {
                window_start: Instant::now(),
                window_bytes: 0,
                bps: 0,
            }),
        }
    }
}

impl TransferProgress {
    /// Record the expected total.
    pub fn set_total(&self, total: u64) {
        self.bytes_total.store(total, Ordering::Relaxed);
    }

    /// Overwrite the byte counter (used when a delegate reports absolute values).
    pub fn set_done(&self, done: u64) {
        let previous = self.bytes_done.swap(done, Ordering::Relaxed);
        self.sample(done.saturating_sub(previous));
    }

    /// Add freshly written bytes.
    pub fn advance(&self, bytes: u64) {
        self.bytes_done.fetch_add(bytes, Ordering::Relaxed);
        self.sample(bytes);
    }

    /// Take back bytes from an attempt that will be rewritten.
    pub fn rewind(&self, bytes: u64) {
        let _ = self
            .bytes_done
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |done| {
                Some(done.saturating_sub(bytes))
            });
    }

    fn sample(&self, bytes: u64) {
        let Ok(mut speed) = self.speed.lock() else {
            return;
        };
        speed.window_bytes = speed.window_bytes.saturating_add(bytes);
        let elapsed = speed.window_start.elapsed();
        if elapsed >= SPEED_WINDOW {
            let millis = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX).max(1);
            speed.bps = speed.window_bytes.saturating_mul(1_000) / millis;
            speed.window_bytes = 0;
            speed.window_start = Instant::now();
        }
    }

    /// Current values.
    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        let speed_bps = self.speed.lock().map(|speed| speed.bps).unwrap_or(0);
        ProgressSnapshot {
            bytes_done: self.bytes_done.load(Ordering::Relaxed),
            bytes_total: self.bytes_total.load(Ordering::Relaxed),
            speed_bps,
        }
    }
}

/// Successful transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSuccess {
    /// Final local path.
    pub path: PathBuf,
    /// Bytes written (0 for links and placeholders).
    pub bytes_written: u64,
    /// Attempts the downloader needed, including the successful one.
    pub attempts: u32,
}

/// Failed transfer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferFailure {
    /// The transfer failed after exhausting the downloader's own retries.
    #[error("{message}")]
    Failed {
        /// Human-readable failure detail.
        message: String,
    },
    /// Shutdown or an explicit cancel stopped the transfer.
    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferFailure {
    /// Build a failure from any displayable error.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// Result reported once per transfer.
pub type TransferOutcome = Result<TransferSuccess, TransferFailure>;

/// Observer side of a running transfer.
#[derive(Debug)]
pub struct DownloadHandle {
    progress: Arc<TransferProgress>,
    outcome: Option<oneshot::Receiver<TransferOutcome>>,
    cancel: CancellationToken,
}

impl DownloadHandle {
    /// Run `work` on a new task, racing it against `cancel`.
    #[must_use]
    pub fn spawn<F>(cancel: CancellationToken, progress: Arc<TransferProgress>, work: F) -> Self
    where
        F: Future<Output = TransferOutcome> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let token = cancel.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                () = token.cancelled() => Err(TransferFailure::Cancelled),
                outcome = work => outcome,
            };
            let _ = tx.send(outcome);
        });
        Self {
            progress,
            outcome: Some(rx),
            cancel,
        }
    }

    /// Run `work` on a new task that observes `cancel` itself (for delegates
    /// that must clean up remote state before reporting).
    #[must_use]
    pub fn spawn_cooperative<F>(
        cancel: CancellationToken,
        progress: Arc<TransferProgress>,
        work: F,
    ) -> Self
    where
        F: Future<Output = TransferOutcome> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(work.await);
        });
        Self {
            progress,
            outcome: Some(rx),
            cancel,
        }
    }

    /// Handle whose outcome is already known.
    #[must_use]
    pub fn completed(cancel: CancellationToken, outcome: TransferOutcome) -> Self {
        let (tx, rx) = oneshot::channel();
        let progress = Arc::new(TransferProgress::default());
        if let Ok(success) = &outcome {
            progress.set_total(success.bytes_written);
            progress.advance(success.bytes_written);
        }
        let _ = tx.send(outcome);
        Self {
            progress,
            outcome: Some(rx),
            cancel,
        }
    }

    /// Non-blocking progress sample.
    #[must_use]
    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    /// Outcome if the transfer finished; `None` while it is still running or
    /// after the outcome was already taken.
    pub fn poll_outcome(&mut self) -> Option<TransferOutcome> {
        let receiver = self.outcome.as_mut()?;
        let outcome = match receiver.try_recv() {
            Ok(outcome) => outcome,
            Err(oneshot::error::TryRecvError::Empty) => return None,
            Err(oneshot::error::TryRecvError::Closed) => Err(TransferFailure::failed(
                "transfer task ended without reporting",
            )),
        };
        self.outcome = None;
        Some(outcome)
    }

    /// Wait for the outcome.
    pub async fn wait(mut self) -> TransferOutcome {
        let Some(receiver) = self.outcome.take() else {
            return Err(TransferFailure::failed("outcome already consumed"));
        };
        receiver.await.unwrap_or_else(|_| {
            Err(TransferFailure::failed(
                "transfer task ended without reporting",
            ))
        })
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Transport that moves a direct link to local storage.
pub trait Downloader: Send + Sync {
    /// Stable label used in logs.
    fn name(&self) -> &'static str;

    /// Begin a transfer and return immediately.
    fn start(&self, request: DownloadRequest) -> DownloadHandle;
}

/// Create `dir` and its parents; succeeds when it already exists.
///
/// # Errors
///
/// Returns the underlying I/O error.
pub async fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(file_name: Option<&str>, fallback: &str) -> DownloadRequest {
        DownloadRequest {
            download_id: Uuid::nil(),
            job_id: Uuid::nil(),
            url: "https://cdn/file".into(),
            destination_dir: PathBuf::from("/data"),
            file_name: file_name.map(str::to_string),
            fallback_name: fallback.into(),
            remote_path: None,
            size_hint: None,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn file_names_fall_back_to_job_name() {
        assert_eq!(request(Some("dir/movie.mkv"), "job").resolved_file_name(), "movie.mkv");
        assert_eq!(request(Some("  "), "job").resolved_file_name(), "job");
        assert_eq!(request(Some(".."), "job").resolved_file_name(), "job");
        assert_eq!(request(None, "Show S01").resolved_file_name(), "Show S01");
        assert_eq!(
            request(None, "").resolved_file_name(),
            Uuid::nil().to_string()
        );
        assert_eq!(
            request(Some("a/b/"), "job").destination(),
            PathBuf::from("/data/b")
        );
    }

    #[tokio::test]
    async fn cancelled_transfers_never_succeed() {
        let cancel = CancellationToken::new();
        let handle = DownloadHandle::spawn(
            cancel.clone(),
            Arc::new(TransferProgress::default()),
            async {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                Ok(TransferSuccess {
                    path: PathBuf::from("/never"),
                    bytes_written: 0,
                    attempts: 1,
                })
            },
        );
        handle.cancel();
        assert_eq!(handle.wait().await, Err(TransferFailure::Cancelled));
    }

    #[tokio::test]
    async fn completed_handles_report_once() {
        let mut handle = DownloadHandle::completed(
            CancellationToken::new(),
            Err(TransferFailure::failed("disk full")),
        );
        assert_eq!(
            handle.poll_outcome(),
            Some(Err(TransferFailure::failed("disk full")))
        );
        assert_eq!(handle.poll_outcome(), None);
    }

    #[test]
    fn progress_accumulates() {
        let progress = TransferProgress::default();
        progress.set_total(100);
        progress.advance(40);
        progress.advance(10);
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.bytes_done, 50);
        assert_eq!(snapshot.bytes_total, 100);
        progress.set_done(80);
        assert_eq!(progress.snapshot().bytes_done, 80);
        progress.rewind(100);
        assert_eq!(progress.snapshot().bytes_done, 0);
    }
}
