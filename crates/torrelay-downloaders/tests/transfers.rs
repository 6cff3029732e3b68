use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use httpmock::prelude::*;
use tokio_util::sync::CancellationToken;
use torrelay_core::{DownloadRequest, Downloader, TransferFailure};
use torrelay_downloaders::{
    Aria2Downloader, Aria2Options, Aria2Rpc, Aria2Status, DownloaderError, DownloaderResult,
    HttpAria2Rpc, MultipartDownloader, MultipartOptions, SimpleDownloader, StrmDownloader,
};
use uuid::Uuid;

const BODY: &str = "0123456789abcdefghij";

fn request(url: String, dir: &Path, file_name: Option<&str>) -> DownloadRequest {
    DownloadRequest {
        download_id: Uuid::new_v4(),
        job_id: Uuid::new_v4(),
        url,
        destination_dir: dir.to_path_buf(),
        file_name: file_name.map(str::to_string),
        fallback_name: "Job Name".into(),
        remote_path: None,
        size_hint: None,
        cancel: CancellationToken::new(),
    }
}

#[tokio::test]
async fn simple_streams_body_to_destination() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET).path("/file.bin");
        then.status(200).body(BODY);
    });
    let dir = tempfile::tempdir()?;
    let target = dir.path().join("nested");

    let handle = SimpleDownloader::new(reqwest::Client::new()).start(request(
        server.url("/file.bin"),
        &target,
        Some("remote/file.bin"),
    ));
    let success = handle.wait().await?;
    assert_eq!(success.path, target.join("file.bin"));
    assert_eq!(success.bytes_written, BODY.len() as u64);
    assert_eq!(std::fs::read_to_string(&success.path)?, BODY);
    Ok(())
}

#[tokio::test]
async fn simple_reports_http_failures() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET).path("/gone");
        then.status(404);
    });
    let dir = tempfile::tempdir()?;

    let outcome = SimpleDownloader::new(reqwest::Client::new())
        .start(request(server.url("/gone"), dir.path(), None))
        .wait()
        .await;
    match outcome {
        Err(TransferFailure::Failed { message }) => assert!(message.contains("404")),
        other => panic!("unexpected outcome: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn multipart_writes_each_range_at_its_offset() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET).path("/big").header("range", "bytes=0-0");
        then.status(206)
            .header("content-range", "bytes 0-0/20")
            .body(&BODY[0..1]);
    });
    let mut part_mocks = Vec::new();
    for (start, end) in [(0_usize, 4_usize), (5, 9), (10, 14), (15, 19)] {
        part_mocks.push(server.mock(|when, then| {
            when.method(GET)
                .path("/big")
                .header("range", format!("bytes={start}-{end}"));
            then.status(206)
                .header("content-range", format!("bytes {start}-{end}/20"))
                .body(&BODY[start..=end]);
        }));
    }
    let dir = tempfile::tempdir()?;

    let downloader = MultipartDownloader::new(
        reqwest::Client::new(),
        MultipartOptions {
            part_count: 4,
            parallel_parts: 2,
            part_retries: 1,
            min_part_size: 1,
        },
    );
    let handle = downloader.start(request(server.url("/big"), dir.path(), Some("big.bin")));
    let success = handle.wait().await?;
    assert_eq!(success.bytes_written, 20);
    assert_eq!(success.attempts, 1);
    assert_eq!(std::fs::read_to_string(dir.path().join("big.bin"))?, BODY);
    for mock in part_mocks {
        mock.assert();
    }
    Ok(())
}

#[tokio::test]
async fn multipart_falls_back_without_range_support() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET).path("/plain");
        then.status(200).body(BODY);
    });
    let dir = tempfile::tempdir()?;

    let downloader = MultipartDownloader::new(
        reqwest::Client::new(),
        MultipartOptions {
            min_part_size: 1,
            ..MultipartOptions::default()
        },
    );
    let success = downloader
        .start(request(server.url("/plain"), dir.path(), Some("plain.bin")))
        .wait()
        .await?;
    assert_eq!(success.bytes_written, 20);
    assert_eq!(std::fs::read_to_string(success.path)?, BODY);
    Ok(())
}

#[tokio::test]
async fn strm_placeholder_contains_the_link() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let success = StrmDownloader
        .start(request(
            "https://cdn.example/movie.mkv".into(),
            dir.path(),
            Some("movie.mkv"),
        ))
        .wait()
        .await?;
    assert_eq!(success.path, dir.path().join("movie.strm"));
    assert_eq!(
        std::fs::read_to_string(&success.path)?,
        "https://cdn.example/movie.mkv\n"
    );
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn symlink_links_mounted_file_by_name() -> anyhow::Result<()> {
    use torrelay_downloaders::SymlinkDownloader;

    let mount = tempfile::tempdir()?;
    let nested = mount.path().join("torrents/Show");
    std::fs::create_dir_all(&nested)?;
    std::fs::write(nested.join("e01.mkv"), b"video")?;
    let dir = tempfile::tempdir()?;

    let mut by_name = request("https://cdn/e01.mkv".into(), dir.path(), Some("e01.mkv"));
    by_name.remote_path = Some("elsewhere/e01.mkv".into());
    let success = SymlinkDownloader::new(mount.path()).start(by_name).wait().await?;
    assert_eq!(std::fs::read_link(&success.path)?, nested.join("e01.mkv"));

    let missing = request("https://cdn/x".into(), dir.path(), Some("absent.mkv"));
    let outcome = SymlinkDownloader::new(mount.path()).start(missing).wait().await;
    assert!(matches!(outcome, Err(TransferFailure::Failed { .. })));
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn symlink_start_returns_before_touching_the_filesystem() -> anyhow::Result<()> {
    use torrelay_downloaders::SymlinkDownloader;

    let mount = tempfile::tempdir()?;
    std::fs::write(mount.path().join("e02.mkv"), b"video")?;
    let dir = tempfile::tempdir()?;
    let target = dir.path().join("linked");

    let handle = SymlinkDownloader::new(mount.path()).start(request(
        "https://cdn/e02.mkv".into(),
        &target,
        Some("e02.mkv"),
    ));
    assert!(!target.exists());

    let success = handle.wait().await?;
    assert_eq!(success.path, target.join("e02.mkv"));
    assert!(std::fs::symlink_metadata(&success.path)?.file_type().is_symlink());
    Ok(())
}

struct FlakyRpc {
    failures_left: AtomicU32,
    submissions: AtomicU32,
}

#[async_trait]
impl Aria2Rpc for FlakyRpc {
    async fn add_uri(
        &self,
        gid: &str,
        _url: &str,
        _dir: &Path,
        _out: &str,
    ) -> DownloaderResult<String> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(DownloaderError::Rpc {
                method: "aria2.addUri",
                detail: "connection refused".into(),
            });
        }
        Ok(gid.to_string())
    }

    async fn tell_status(&self, _gid: &str) -> DownloaderResult<Aria2Status> {
        Ok(Aria2Status {
            status: "complete".into(),
            total_length: 42,
            completed_length: 42,
            ..Aria2Status::default()
        })
    }

    async fn remove(&self, _gid: &str) -> DownloaderResult<()> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn aria2_retries_submission_until_accepted() -> anyhow::Result<()> {
    let rpc = Arc::new(FlakyRpc {
        failures_left: AtomicU32::new(4),
        submissions: AtomicU32::new(0),
    });
    let downloader = Aria2Downloader::new(
        Arc::clone(&rpc) as Arc<dyn Aria2Rpc>,
        Aria2Options {
            submit_attempts: 5,
            submit_delay: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
        },
    );
    let dir = tempfile::tempdir()?;

    let success = downloader
        .start(request("https://cdn/a.mkv".into(), dir.path(), Some("a.mkv")))
        .wait()
        .await?;
    assert_eq!(success.attempts, 5);
    assert_eq!(success.bytes_written, 42);
    assert_eq!(success.path, dir.path().join("a.mkv"));
    assert_eq!(rpc.submissions.load(Ordering::SeqCst), 5);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn aria2_gives_up_after_submission_budget() -> anyhow::Result<()> {
    let rpc = Arc::new(FlakyRpc {
        failures_left: AtomicU32::new(10),
        submissions: AtomicU32::new(0),
    });
    let downloader = Aria2Downloader::new(
        Arc::clone(&rpc) as Arc<dyn Aria2Rpc>,
        Aria2Options::default(),
    );
    let dir = tempfile::tempdir()?;

    let outcome = downloader
        .start(request("https://cdn/a.mkv".into(), dir.path(), None))
        .wait()
        .await;
    assert!(matches!(outcome, Err(TransferFailure::Failed { .. })));
    assert_eq!(rpc.submissions.load(Ordering::SeqCst), 5);
    Ok(())
}

#[tokio::test]
async fn aria2_http_transport_speaks_json_rpc() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    let mock = server.mock(|when, then| {
        when.method(POST).path("/jsonrpc");
        then.status(200).json_body(serde_json::json!({
            "jsonrpc": "2.0",
            "id": "1",
            "result": "0123456789abcdef"
        }));
    });

    let rpc = HttpAria2Rpc::new(
        reqwest::Client::new(),
        server.url("/jsonrpc"),
        Some("secret".into()),
    );
    let gid = rpc
        .add_uri(
            "0123456789abcdef",
            "https://cdn/a.mkv",
            &PathBuf::from("/downloads"),
            "a.mkv",
        )
        .await?;
    assert_eq!(gid, "0123456789abcdef");
    mock.assert();
    Ok(())
}

#[tokio::test]
async fn aria2_http_transport_surfaces_rpc_errors() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(POST).path("/jsonrpc");
        then.status(200).json_body(serde_json::json!({
            "jsonrpc": "2.0",
            "id": "1",
            "error": { "code": 1, "message": "GID 0123456789abcdef is not unique." }
        }));
    });

    let rpc = HttpAria2Rpc::new(reqwest::Client::new(), server.url("/jsonrpc"), None);
    let err = rpc.tell_status("0123456789abcdef").await.unwrap_err();
    assert!(err.to_string().contains("not unique"));
}
