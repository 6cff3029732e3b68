//! Links provider-mounted files into the download directory.
//!
//! The mount search and link calls block, so they run on the blocking pool.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use torrelay_core::{
    DownloadHandle, DownloadRequest, Downloader, TransferProgress, TransferSuccess,
};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{DownloaderError, DownloaderResult};

const SEARCH_DEPTH: usize = 6;

/// Resolves files under a provider mount (rclone, WebDAV) and symlinks them.
#[derive(Debug, Clone)]
pub struct SymlinkDownloader {
    mount_root: PathBuf,
}

impl SymlinkDownloader {
    /// Resolve sources under `mount_root`.
    #[must_use]
    pub fn new(mount_root: impl Into<PathBuf>) -> Self {
        Self {
            mount_root: mount_root.into(),
        }
    }

    /// Locate the mounted file for a request: the remote path first, then a
    /// name search below the mount.
    ///
    /// # Errors
    ///
    /// Returns [`DownloaderError::MissingSource`] when nothing matches.
    pub fn locate(&self, request: &DownloadRequest) -> DownloaderResult<PathBuf> {
        if let Some(remote) = request.remote_path.as_deref() {
            let direct = self.mount_root.join(remote.trim_start_matches('/'));
            if direct.is_file() {
                return Ok(direct);
            }
        }
        let name = request.resolved_file_name();
        for entry in WalkDir::new(&self.mount_root).max_depth(SEARCH_DEPTH) {
            let entry = entry.map_err(|source| DownloaderError::Walk {
                path: self.mount_root.clone(),
                source,
            })?;
            if !entry.file_type().is_dir() && entry.file_name().to_string_lossy() == name {
                return Ok(entry.into_path());
            }
        }
        Err(DownloaderError::MissingSource {
            name,
            root: self.mount_root.clone(),
        })
    }

    fn link(&self, request: &DownloadRequest) -> DownloaderResult<TransferSuccess> {
        let source = self.locate(request)?;
        fs::create_dir_all(&request.destination_dir)
            .map_err(DownloaderError::io("create_dir", &request.destination_dir))?;
        let destination = request.destination();
        if fs::symlink_metadata(&destination).is_ok() {
            fs::remove_file(&destination)
                .map_err(DownloaderError::io("replace_link", &destination))?;
        }
        create_link(&source, &destination)?;
        debug!(
            download_id = %request.download_id,
            source = %source.display(),
            destination = %destination.display(),
            "linked mounted file"
        );
        Ok(TransferSuccess {
            path: destination,
            bytes_written: 0,
            attempts: 1,
        })
    }
}

#[cfg(unix)]
fn create_link(source: &Path, destination: &Path) -> DownloaderResult<()> {
    std::os::unix::fs::symlink(source, destination)
        .map_err(DownloaderError::io("create_link", destination))
}

#[cfg(not(unix))]
fn create_link(_source: &Path, destination: &Path) -> DownloaderResult<()> {
    Err(DownloaderError::io("create_link", destination)(
        std::io::Error::new(std::io::ErrorKind::Unsupported, "symlinks require unix"),
    ))
}

impl Downloader for SymlinkDownloader {
    fn name(&self) -> &'static str {
        "symlink"
    }

    fn start(&self, request: DownloadRequest) -> DownloadHandle {
        let linker = self.clone();
        let progress = Arc::new(TransferProgress::default());
        DownloadHandle::spawn(request.cancel.clone(), progress, async move {
            tokio::task::spawn_blocking(move || linker.link(&request))
                .await
                .map_err(|err| DownloaderError::Task {
                    detail: err.to_string(),
                })?
                .map_err(Into::into)
        })
    }
}
