//! `.strm` placeholder files for media servers.

use std::path::Path;
use std::sync::Arc;

use torrelay_core::transfer::ensure_dir;
use torrelay_core::{
    DownloadHandle, DownloadRequest, Downloader, TransferFailure, TransferProgress,
    TransferSuccess,
};

use crate::error::DownloaderError;

/// Writes `<name>.strm` containing the direct link instead of the content.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrmDownloader;

impl Downloader for StrmDownloader {
    fn name(&self) -> &'static str {
        "strm"
    }

    fn start(&self, request: DownloadRequest) -> DownloadHandle {
        let progress = Arc::new(TransferProgress::default());
        DownloadHandle::spawn(request.cancel.clone(), progress, async move {
            ensure_dir(&request.destination_dir)
                .await
                .map_err(DownloaderError::io("create_dir", &request.destination_dir))?;
            let name = request.resolved_file_name();
            let path = request
                .destination_dir
                .join(Path::new(&name).with_extension("strm"));
            tokio::fs::write(&path, format!("{}\n", request.url))
                .await
                .map_err(DownloaderError::io("write_strm", &path))?;
            Ok::<_, TransferFailure>(TransferSuccess {
                path,
                bytes_written: 0,
                attempts: 1,
            })
        })
    }
}
