//! Parallel byte-range transfer.
//!
//! # Design
//! - A one-byte ranged probe learns the length and whether ranges are honoured;
//!   anything else degrades to a single stream.
//! - The file is pre-sized and each part writes at its own offset through its
//!   own handle, so parts never coordinate.
//! - Parts retry independently; one part exhausting its budget fails the
//!   transfer and aborts the rest.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use torrelay_core::transfer::ensure_dir;
use torrelay_core::{
    DownloadHandle, DownloadRequest, Downloader, TransferFailure, TransferProgress,
    TransferSuccess,
};
use tracing::{debug, warn};

use crate::error::{DownloaderError, DownloaderResult};
use crate::simple::stream_to_file;

const PART_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Tuning for the multi-part transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultipartOptions {
    /// Parts per file.
    pub part_count: usize,
    /// Parts fetched concurrently.
    pub parallel_parts: usize,
    /// Retries per part after the first attempt.
    pub part_retries: u32,
    /// Files below this size use a single stream.
    pub min_part_size: u64,
}

impl Default for MultipartOptions {
    fn default() -> Self {
        Self {
            part_count: 4,
            parallel_parts: 4,
            part_retries: 3,
            min_part_size: 8 * 1024 * 1024,
        }
    }
}

/// Byte-range downloader.
#[derive(Debug, Clone)]
pub struct MultipartDownloader {
    http: Client,
    options: MultipartOptions,
}

impl MultipartDownloader {
    /// Build with explicit tuning.
    #[must_use]
    pub const fn new(http: Client, options: MultipartOptions) -> Self {
        Self { http, options }
    }
}

impl Downloader for MultipartDownloader {
    fn name(&self) -> &'static str {
        "multipart"
    }

    fn start(&self, request: DownloadRequest) -> DownloadHandle {
        let progress = Arc::new(TransferProgress::default());
        let http = self.http.clone();
        let options = self.options;
        let observed = Arc::clone(&progress);
        DownloadHandle::spawn(request.cancel.clone(), progress, async move {
            run(http, options, request, observed)
                .await
                .map_err(TransferFailure::from)
        })
    }
}

async fn run(
    http: Client,
    options: MultipartOptions,
    request: DownloadRequest,
    progress: Arc<TransferProgress>,
) -> DownloaderResult<TransferSuccess> {
    ensure_dir(&request.destination_dir)
        .await
        .map_err(DownloaderError::io("create_dir", &request.destination_dir))?;
    let path = request.destination();

    let ranged_total = probe(&http, &request.url).await;
    let total = match ranged_total {
        Some(total) if options.part_count > 1 && total >= options.min_part_size.max(1) => total,
        _ => {
            debug!(download_id = %request.download_id, "ranges unavailable, using a single stream");
            let bytes_written =
                stream_to_file(&http, &request.url, &path, &progress, request.size_hint).await?;
            return Ok(TransferSuccess {
                path,
                bytes_written,
                attempts: 1,
            });
        }
    };

    progress.set_total(total);
    let file = File::create(&path)
        .await
        .map_err(DownloaderError::io("create_file", &path))?;
    file.set_len(total)
        .await
        .map_err(DownloaderError::io("allocate_file", &path))?;
    drop(file);

    let semaphore = Arc::new(Semaphore::new(options.parallel_parts.max(1)));
    let url: Arc<str> = Arc::from(request.url.as_str());
    let shared_path: Arc<PathBuf> = Arc::new(path.clone());
    let mut parts = JoinSet::new();
    for (index, (start, end)) in split_ranges(total, options.part_count).into_iter().enumerate() {
        let part = Part {
            index,
            start,
            end,
            retries: options.part_retries,
        };
        let semaphore = Arc::clone(&semaphore);
        let http = http.clone();
        let url = Arc::clone(&url);
        let path = Arc::clone(&shared_path);
        let progress = Arc::clone(&progress);
        parts.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|err| DownloaderError::Task {
                    detail: err.to_string(),
                })?;
            part.fetch(&http, &url, &path, &progress).await
        });
    }

    let mut attempts = 1;
    while let Some(joined) = parts.join_next().await {
        let outcome = joined.map_err(|err| DownloaderError::Task {
            detail: err.to_string(),
        });
        match outcome.and_then(|result| result) {
            Ok(part_attempts) => attempts = attempts.max(part_attempts),
            Err(err) => {
                parts.abort_all();
                return Err(err);
            }
        }
    }

    Ok(TransferSuccess {
        path,
        bytes_written: total,
        attempts,
    })
}

/// Total length when the server honours byte ranges.
async fn probe(http: &Client, url: &str) -> Option<u64> {
    let response = http.get(url).header(RANGE, "bytes=0-0").send().await.ok()?;
    if response.status() != StatusCode::PARTIAL_CONTENT {
        return None;
    }
    let header = response.headers().get(CONTENT_RANGE)?.to_str().ok()?;
    header.rsplit('/').next()?.trim().parse().ok()
}

/// Inclusive byte ranges covering `total` in at most `count` parts.
fn split_ranges(total: u64, count: usize) -> Vec<(u64, u64)> {
    if total == 0 {
        return Vec::new();
    }
    let count = (count.max(1) as u64).min(total);
    let size = total.div_ceil(count);
    (0..count)
        .map(|index| index * size)
        .take_while(|start| *start < total)
        .map(|start| (start, (start + size).min(total) - 1))
        .collect()
}

#[derive(Debug, Clone, Copy)]
struct Part {
    index: usize,
    start: u64,
    end: u64,
    retries: u32,
}

impl Part {
    const fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    async fn fetch(
        &self,
        http: &Client,
        url: &str,
        path: &Path,
        progress: &TransferProgress,
    ) -> DownloaderResult<u32> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut written = 0;
            match self.attempt(http, url, path, progress, &mut written).await {
                Ok(()) => return Ok(attempt),
                Err(err) => {
                    progress.rewind(written);
                    if attempt > self.retries {
                        return Err(err);
                    }
                    warn!(part = self.index, attempt, error = %err, "retrying part");
                    tokio::time::sleep(PART_RETRY_DELAY * attempt).await;
                }
            }
        }
    }

    async fn attempt(
        &self,
        http: &Client,
        url: &str,
        path: &Path,
        progress: &TransferProgress,
        written: &mut u64,
    ) -> DownloaderResult<()> {
        let response = http
            .get(url)
            .header(RANGE, format!("bytes={}-{}", self.start, self.end))
            .send()
            .await
            .map_err(DownloaderError::http("download_part"))?;
        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(DownloaderError::Status {
                operation: "download_part",
                status: response.status().as_u16(),
            });
        }

        let mut file = OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(DownloaderError::io("open_part", path))?;
        file.seek(SeekFrom::Start(self.start))
            .await
            .map_err(DownloaderError::io("seek_part", path))?;

        let expected = self.len();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(DownloaderError::http("download_part"))?;
            let len = chunk.len() as u64;
            if *written + len > expected {
                return Err(DownloaderError::ShortPart {
                    index: self.index,
                    expected,
                    received: *written + len,
                });
            }
            file.write_all(&chunk)
                .await
                .map_err(DownloaderError::io("write_part", path))?;
            *written += len;
            progress.advance(len);
        }
        file.flush()
            .await
            .map_err(DownloaderError::io("flush_part", path))?;
        if *written != expected {
            return Err(DownloaderError::ShortPart {
                index: self.index,
                expected,
                received: *written,
            });
        }
        Ok(())
    }
}
