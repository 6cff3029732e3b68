//! # Design
//!
//! - Structured errors for every transfer backend.
//! - Converted to a human-readable `TransferFailure` at the handle boundary;
//!   the orchestrator only sees the message.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use torrelay_core::TransferFailure;

/// Result type for transfer backends.
pub type DownloaderResult<T> = Result<T, DownloaderError>;

/// Errors produced by transfer backends.
#[derive(Debug, Error)]
pub enum DownloaderError {
    /// Local filesystem failure.
    #[error("{operation} failed for {}: {source}", path.display())]
    Io {
        /// Operation that failed.
        operation: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
    /// HTTP transport failure.
    #[error("{operation} request failed: {source}")]
    Http {
        /// Operation that failed.
        operation: &'static str,
        /// Underlying error.
        source: reqwest::Error,
    },
    /// Remote answered with an unexpected status.
    #[error("{operation} returned HTTP {status}")]
    Status {
        /// Operation that failed.
        operation: &'static str,
        /// HTTP status code.
        status: u16,
    },
    /// A byte range came back shorter or longer than requested.
    #[error("part {index} received {received} of {expected} bytes")]
    ShortPart {
        /// Part index.
        index: usize,
        /// Bytes expected.
        expected: u64,
        /// Bytes received.
        received: u64,
    },
    /// aria2 JSON-RPC failure.
    #[error("aria2 {method} failed: {detail}")]
    Rpc {
        /// RPC method.
        method: &'static str,
        /// Failure detail.
        detail: String,
    },
    /// Mount traversal failure.
    #[error("failed to scan {}: {source}", path.display())]
    Walk {
        /// Root being scanned.
        path: PathBuf,
        /// Underlying error.
        source: walkdir::Error,
    },
    /// Nothing under the mount matched the requested file.
    #[error("{name} not found under {}", root.display())]
    MissingSource {
        /// File looked for.
        name: String,
        /// Mount root.
        root: PathBuf,
    },
    /// Worker task panicked or was aborted.
    #[error("transfer task failed: {detail}")]
    Task {
        /// Join failure detail.
        detail: String,
    },
    /// Backend cannot run with the given settings.
    #[error("invalid downloader configuration: {field}")]
    Configuration {
        /// Offending setting.
        field: &'static str,
    },
}

impl DownloaderError {
    pub(crate) fn io(
        operation: &'static str,
        path: impl Into<PathBuf>,
    ) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io {
            operation,
            path,
            source,
        }
    }

    pub(crate) fn http(operation: &'static str) -> impl FnOnce(reqwest::Error) -> Self {
        move |source| Self::Http { operation, source }
    }
}

impl From<DownloaderError> for TransferFailure {
    fn from(err: DownloaderError) -> Self {
        Self::failed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_keep_context_in_message() {
        let err = DownloaderError::io("create_file", "/data/a.mkv")(io::Error::other("disk full"));
        let failure = TransferFailure::from(err);
        assert_eq!(
            failure,
            TransferFailure::failed("create_file failed for /data/a.mkv: disk full")
        );
    }
}
