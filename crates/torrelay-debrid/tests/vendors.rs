use std::time::Duration;

use chrono::Utc;
use httpmock::prelude::*;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use torrelay_core::{
    DebridClient, EngineError, Job, JobPolicy, JobSource, JobState, ProviderStatus, SubmitJob,
};
use torrelay_debrid::{AllDebridClient, PremiumizeClient, RealDebridClient, TorBoxClient};
use torrelay_resilience::{LimiterSet, ResilientClient, RetryPolicy};
use uuid::Uuid;

const MAGNET: &str = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=Demo";

fn resilient() -> ResilientClient {
    ResilientClient::new(
        reqwest::Client::new(),
        LimiterSet::unlimited(),
        RetryPolicy::none(),
        CancellationToken::new(),
    )
}

fn job(source: JobSource, provider_id: &str) -> Job {
    let mut job = Job::new(
        Uuid::new_v4(),
        SubmitJob {
            source,
            policy: JobPolicy::default(),
            name_hint: None,
        },
        None,
        Utc::now(),
    );
    job.provider_id = Some(provider_id.to_string());
    job
}

#[tokio::test]
async fn real_debrid_adds_magnets_with_bearer_auth() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/torrents/addMagnet")
            .header("authorization", "Bearer secret");
        then.status(201)
            .json_body(json!({ "id": "RD1", "uri": "https://api/torrents/info/RD1" }));
    });

    let client = RealDebridClient::new(resilient(), &server.base_url(), "secret");
    let id = client.add(&JobSource::magnet(MAGNET)).await?;
    assert_eq!(id, "RD1");
    mock.assert();
    Ok(())
}

#[tokio::test]
async fn real_debrid_missing_entry_marks_job_deleted() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET).path("/torrents/info/RD9");
        then.status(404)
            .json_body(json!({ "error": "unknown_ressource", "error_code": 7 }));
    });

    let client = RealDebridClient::new(resilient(), &server.base_url(), "secret");
    let mut job = job(JobSource::magnet(MAGNET), "RD9");
    client.update_data(&mut job, None).await?;
    assert!(job.deleted_remotely);
    assert_eq!(job.state, JobState::Queued);
    Ok(())
}

#[tokio::test]
async fn real_debrid_pairs_links_with_selected_files() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET).path("/torrents/info/RD1");
        then.status(200).json_body(json!({
            "id": "RD1",
            "filename": "Demo",
            "hash": "0123456789ABCDEF0123456789ABCDEF01234567",
            "bytes": 30,
            "progress": 100,
            "status": "downloaded",
            "files": [
                { "id": 1, "path": "/Demo/a.mkv", "bytes": 20, "selected": 1 },
                { "id": 2, "path": "/Demo/sample.mkv", "bytes": 1, "selected": 0 },
                { "id": 3, "path": "/Demo/b.srt", "bytes": 10, "selected": 1 }
            ],
            "links": ["https://real-debrid.com/d/AAA", "https://real-debrid.com/d/BBB"]
        }));
    });

    let client = RealDebridClient::new(resilient(), &server.base_url(), "secret");
    let mut job = job(JobSource::magnet(MAGNET), "RD1");
    client.update_data(&mut job, None).await?;
    assert_eq!(job.provider_status, Some(ProviderStatus::Finished));
    assert_eq!(
        job.hash.as_deref(),
        Some("0123456789abcdef0123456789abcdef01234567")
    );

    let infos = client.get_download_infos(&job).await?;
    assert_eq!(infos.len(), 2);
    assert_eq!(infos[0].file_name.as_deref(), Some("a.mkv"));
    assert_eq!(infos[1].remote_path.as_deref(), Some("Demo/b.srt"));
    assert_eq!(infos[1].size_bytes, Some(10));
    Ok(())
}

#[tokio::test]
async fn real_debrid_rejects_malformed_links_locally() {
    let client = RealDebridClient::new(resilient(), "http://127.0.0.1:9", "secret");
    let job = job(JobSource::magnet(MAGNET), "RD1");
    let err = client.unrestrict(&job, "not a link").await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument { field: "link", .. }));
}

#[tokio::test]
async fn long_retry_after_surfaces_as_rate_limit() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(POST).path("/torrents/addMagnet");
        then.status(429).header("Retry-After", "3600");
    });

    let client = RealDebridClient::new(resilient(), &server.base_url(), "secret");
    let err = client.add_magnet(MAGNET).await.unwrap_err();
    assert_eq!(err.retry_after(), Some(Duration::from_secs(3_600)));
}

#[tokio::test]
async fn torbox_queue_positions_process_and_cache_hits_finish() -> anyhow::Result<()> {
    let queued = MockServer::start_async().await;
    queued.mock(|when, then| {
        when.method(GET)
            .path("/torrents/mylist")
            .query_param("id", "7");
        then.status(200).json_body(json!({
            "success": true,
            "detail": "ok",
            "data": { "id": 7, "hash": "abc", "name": "Demo", "size": 10,
                      "download_state": "queued_123", "progress": 0.0, "files": [] }
        }));
    });
    let cached = MockServer::start_async().await;
    cached.mock(|when, then| {
        when.method(GET)
            .path("/torrents/mylist")
            .query_param("id", "7");
        then.status(200).json_body(json!({
            "success": true,
            "detail": "ok",
            "data": { "id": 7, "hash": "abc", "name": "Demo", "size": 10,
                      "download_state": "cached", "progress": 1.0,
                      "files": [{ "id": 0, "name": "Demo/a.mkv", "size": 10 }] }
        }));
    });

    let mut job = job(JobSource::magnet(MAGNET), "7");
    TorBoxClient::new(resilient(), &queued.base_url(), "secret")
        .update_data(&mut job, None)
        .await?;
    assert_eq!(job.provider_status, Some(ProviderStatus::Processing));

    let client = TorBoxClient::new(resilient(), &cached.base_url(), "secret");
    client.update_data(&mut job, None).await?;
    assert_eq!(job.provider_status, Some(ProviderStatus::Finished));
    assert!(job.downloads.is_empty());

    let infos = client.get_download_infos(&job).await?;
    assert_eq!(infos.len(), 1);
    assert!(infos[0].restricted_link.ends_with("/torrents/requestdl?torrent_id=7&file_id=0"));
    assert_eq!(infos[0].file_name.as_deref(), Some("a.mkv"));
    Ok(())
}

#[tokio::test]
async fn torbox_accepts_nzb_links() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    let mock = server.mock(|when, then| {
        when.method(POST).path("/usenet/createusenetdownload");
        then.status(200).json_body(json!({
            "success": true,
            "data": { "usenetdownload_id": 55, "hash": "h", "auth_id": "a" }
        }));
    });

    let client = TorBoxClient::new(resilient(), &server.base_url(), "secret");
    let id = client
        .add(&JobSource::NzbLink {
            url: "https://indexer.example/get/1.nzb".into(),
        })
        .await?;
    assert_eq!(id, "55");
    mock.assert();
    Ok(())
}

#[tokio::test]
async fn torbox_availability_outage_is_a_provider_error() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET).path("/torrents/checkcached");
        then.status(500);
    });

    let client = TorBoxClient::new(resilient(), &server.base_url(), "secret");
    let err = client
        .get_available_files("0123456789abcdef0123456789abcdef01234567")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Provider { .. }), "{err:?}");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn torbox_uncached_hash_has_no_available_files() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET).path("/torrents/checkcached");
        then.status(200)
            .json_body(json!({ "success": true, "detail": "not cached", "data": null }));
    });

    let client = TorBoxClient::new(resilient(), &server.base_url(), "secret");
    let files = client
        .get_available_files("0123456789abcdef0123456789abcdef01234567")
        .await?;
    assert!(files.is_empty());
    Ok(())
}

#[tokio::test]
async fn all_debrid_waits_for_ready_code() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET).path("/magnet/status").query_param("id", "11");
        then.status(200).json_body(json!({
            "status": "success",
            "data": { "magnets": {
                "id": 11, "filename": "Demo", "hash": "abc", "size": 100,
                "status": "Downloading", "statusCode": 1, "downloaded": 25,
                "downloadSpeed": 5, "links": []
            }}
        }));
    });

    let client = AllDebridClient::new(resilient(), &server.base_url(), "secret");
    let mut job = job(JobSource::magnet(MAGNET), "11");
    client.update_data(&mut job, None).await?;
    assert_eq!(job.provider_status, Some(ProviderStatus::Downloading));
    assert!((job.progress - 25.0).abs() < f64::EPSILON);
    assert_eq!(job.provider_message.as_deref(), Some("Downloading"));

    let err = client.get_download_infos(&job).await.unwrap_err();
    assert!(err.is_retryable());
    Ok(())
}

#[tokio::test]
async fn all_debrid_nzb_is_unsupported() {
    let client = AllDebridClient::new(resilient(), "http://127.0.0.1:9", "secret");
    let err = client
        .add(&JobSource::NzbFile {
            bytes: b"<nzb/>".to_vec(),
            file_name: "a.nzb".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Unsupported { operation: "add_nzb_file" }));
}

#[tokio::test]
async fn premiumize_resolves_links_from_folder_listing() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET)
            .path("/transfer/list")
            .query_param("apikey", "secret");
        then.status(200).json_body(json!({
            "status": "success",
            "transfers": [
                { "id": "other", "name": "Other", "status": "running", "progress": 0.5 },
                { "id": "pm1", "name": "Demo", "status": "seeding", "progress": 1.0,
                  "src": MAGNET, "folder_id": "f1" }
            ]
        }));
    });
    server.mock(|when, then| {
        when.method(GET).path("/folder/list").query_param("id", "f1");
        then.status(200).json_body(json!({
            "status": "success",
            "content": [
                { "id": "a", "name": "a.mkv", "type": "file", "size": 20,
                  "link": "https://cdn.premiumize.me/a.mkv" },
                { "id": "f2", "name": "Subs", "type": "folder" }
            ]
        }));
    });
    server.mock(|when, then| {
        when.method(GET).path("/folder/list").query_param("id", "f2");
        then.status(200).json_body(json!({
            "status": "success",
            "content": [
                { "id": "b", "name": "b.srt", "type": "file", "size": 1,
                  "link": "https://cdn.premiumize.me/b.srt" }
            ]
        }));
    });

    let client = PremiumizeClient::new(resilient(), &server.base_url(), "secret");
    let mut job = job(JobSource::magnet(MAGNET), "pm1");
    client.update_data(&mut job, None).await?;
    assert_eq!(job.provider_status, Some(ProviderStatus::Finished));

    let infos = client.get_download_infos(&job).await?;
    let paths: Vec<_> = infos
        .iter()
        .filter_map(|info| info.remote_path.as_deref())
        .collect();
    assert_eq!(paths, vec!["Subs/b.srt", "a.mkv"]);
    assert_eq!(
        client.unrestrict(&job, &infos[1].restricted_link).await?,
        "https://cdn.premiumize.me/a.mkv"
    );
    Ok(())
}

#[tokio::test]
async fn premiumize_unknown_transfer_is_flagged_deleted() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET).path("/transfer/list");
        then.status(200)
            .json_body(json!({ "status": "success", "transfers": [] }));
    });

    let client = PremiumizeClient::new(resilient(), &server.base_url(), "secret");
    let mut job = job(JobSource::magnet(MAGNET), "gone");
    client.update_data(&mut job, None).await?;
    assert!(job.deleted_remotely);
    Ok(())
}

#[tokio::test]
async fn premiumize_cache_hits_list_every_file() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET).path("/cache/check");
        then.status(200).json_body(json!({
            "status": "success",
            "response": [true],
            "transcoded": [false],
            "filename": ["Demo"],
            "filesize": ["30"]
        }));
    });
    let direct = server.mock(|when, then| {
        when.method(POST).path("/transfer/directdl");
        then.status(200).json_body(json!({
            "status": "success",
            "content": [
                { "path": "Demo/a.mkv", "size": 20, "link": "https://cdn.premiumize.me/a.mkv" },
                { "path": "Demo/b.srt", "size": "10", "link": "https://cdn.premiumize.me/b.srt" }
            ]
        }));
    });

    let client = PremiumizeClient::new(resilient(), &server.base_url(), "secret");
    let files = client
        .get_available_files("0123456789abcdef0123456789abcdef01234567")
        .await?;
    let listed: Vec<(&str, u64)> = files
        .iter()
        .map(|file| (file.path.as_str(), file.size_bytes))
        .collect();
    assert_eq!(listed, vec![("Demo/a.mkv", 20), ("Demo/b.srt", 10)]);
    direct.assert();
    Ok(())
}

#[tokio::test]
async fn premiumize_cache_miss_skips_the_file_listing() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET).path("/cache/check");
        then.status(200)
            .json_body(json!({ "status": "success", "response": [false] }));
    });
    let direct = server.mock(|when, then| {
        when.method(POST).path("/transfer/directdl");
        then.status(200).json_body(json!({ "status": "success", "content": [] }));
    });

    let client = PremiumizeClient::new(resilient(), &server.base_url(), "secret");
    let files = client
        .get_available_files("0123456789abcdef0123456789abcdef01234567")
        .await?;
    assert!(files.is_empty());
    direct.assert_hits(0);
    Ok(())
}
