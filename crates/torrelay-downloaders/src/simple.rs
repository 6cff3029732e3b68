//! Single-stream HTTP transfer.

use std::path::Path;
use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::Client;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use torrelay_core::transfer::ensure_dir;
use torrelay_core::{
    DownloadHandle, DownloadRequest, Downloader, TransferFailure, TransferProgress,
    TransferSuccess,
};
use tracing::debug;

use crate::error::{DownloaderError, DownloaderResult};

/// Streams the whole body into the destination file.
#[derive(Debug, Clone)]
pub struct SimpleDownloader {
    http: Client,
}

impl SimpleDownloader {
    /// Use `http` for every transfer.
    #[must_use]
    pub const fn new(http: Client) -> Self {
        Self { http }
    }
}

impl Downloader for SimpleDownloader {
    fn name(&self) -> &'static str {
        "simple"
    }

    fn start(&self, request: DownloadRequest) -> DownloadHandle {
        let progress = Arc::new(TransferProgress::default());
        let http = self.http.clone();
        let observed = Arc::clone(&progress);
        DownloadHandle::spawn(request.cancel.clone(), progress, async move {
            let path = request.destination();
            ensure_dir(&request.destination_dir)
                .await
                .map_err(DownloaderError::io("create_dir", &request.destination_dir))?;
            let bytes_written =
                stream_to_file(&http, &request.url, &path, &observed, request.size_hint).await?;
            debug!(download_id = %request.download_id, bytes_written, "stream finished");
            Ok::<_, TransferFailure>(TransferSuccess {
                path,
                bytes_written,
                attempts: 1,
            })
        })
    }
}

/// GET `url` and write the body to `path`, truncating any previous content.
pub(crate) async fn stream_to_file(
    http: &Client,
    url: &str,
    path: &Path,
    progress: &TransferProgress,
    size_hint: Option<u64>,
) -> DownloaderResult<u64> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(DownloaderError::http("download"))?;
    let status = response.status();
    if !status.is_success() {
        return Err(DownloaderError::Status {
            operation: "download",
            status: status.as_u16(),
        });
    }
    if let Some(total) = response.content_length().or(size_hint) {
        progress.set_total(total);
    }

    let mut file = File::create(path)
        .await
        .map_err(DownloaderError::io("create_file", path))?;
    let mut stream = response.bytes_stream();
    let mut written = 0_u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(DownloaderError::http("download"))?;
        file.write_all(&chunk)
            .await
            .map_err(DownloaderError::io("write_file", path))?;
        let len = chunk.len() as u64;
        written += len;
        progress.advance(len);
    }
    file.flush()
        .await
        .map_err(DownloaderError::io("flush_file", path))?;
    Ok(written)
}
