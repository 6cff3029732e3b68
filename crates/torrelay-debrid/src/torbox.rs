//! TorBox client for torrents and Usenet.
//!
//! # Design
//! - Torrent and Usenet jobs hit parallel endpoint families; the job kind
//!   picks the family.
//! - `cached` maps straight to `Finished`: an instant cache hit has nothing
//!   left to download on the provider side.
//! - Restricted links point at `requestdl`; `unrestrict` exchanges them for
//!   the signed CDN URL.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use torrelay_core::{
    DebridClient, DownloadInfo, EngineError, EngineResult, Job, JobKind, ProviderFile,
    ProviderStatus, ProviderTorrent, StatusRule, StatusTable, validate_link,
};
use torrelay_resilience::ResilientClient;

use crate::http::{Auth, VendorHttp, entry_not_found, provider_id};

/// Default API root.
pub const TORBOX_BASE_URL: &str = "https://api.torbox.app/v1/api";

const RULES: &[StatusRule] = &[
    StatusRule::prefix("queued", ProviderStatus::Processing),
    StatusRule::exact("metadl", ProviderStatus::Processing),
    StatusRule::prefix("checking", ProviderStatus::Processing),
    StatusRule::exact("downloading", ProviderStatus::Downloading),
    StatusRule::prefix("stalled", ProviderStatus::Downloading),
    StatusRule::exact("paused", ProviderStatus::Downloading),
    StatusRule::exact("uploading", ProviderStatus::Uploading),
    StatusRule::exact("moving", ProviderStatus::Uploading),
    StatusRule::exact("completed", ProviderStatus::Finished),
    StatusRule::exact("cached", ProviderStatus::Finished),
    StatusRule::contains("error", ProviderStatus::Error),
    StatusRule::contains("failed", ProviderStatus::Error),
    StatusRule::exact("missingfiles", ProviderStatus::Error),
];

/// Status table for TorBox download states.
pub const TORBOX_STATUS: StatusTable = StatusTable::new("torbox", RULES);

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    detail: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct Created {
    #[serde(alias = "usenetdownload_id")]
    torrent_id: u64,
}

#[derive(Debug, Deserialize)]
struct TbFile {
    id: u64,
    name: String,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Deserialize)]
struct TbEntry {
    id: u64,
    #[serde(default)]
    hash: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    size: u64,
    download_state: String,
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    download_speed: u64,
    #[serde(default)]
    seeds: Option<u32>,
    #[serde(default)]
    download_finished: bool,
    #[serde(default)]
    download_present: bool,
    #[serde(default)]
    files: Vec<TbFile>,
}

#[derive(Debug, Deserialize)]
struct CachedEntry {
    #[serde(default)]
    files: Vec<CachedFile>,
}

#[derive(Debug, Deserialize)]
struct CachedFile {
    name: String,
    #[serde(default)]
    size: u64,
}

impl From<TbEntry> for ProviderTorrent {
    fn from(value: TbEntry) -> Self {
        let present = value.download_finished && value.download_present;
        let failed = TORBOX_STATUS.lookup(&value.download_state) == Some(ProviderStatus::Error);
        let (raw_status, message) = if present && !failed {
            ("completed".to_string(), Some(value.download_state))
        } else {
            (value.download_state, None)
        };
        Self {
            id: value.id.to_string(),
            hash: value.hash,
            name: value.name,
            raw_status,
            message,
            size_bytes: value.size,
            progress: value.progress * 100.0,
            speed_bps: value.download_speed,
            seeders: value.seeds,
            files: value
                .files
                .into_iter()
                .map(|file| ProviderFile {
                    id: file.id.to_string(),
                    path: file.name,
                    size_bytes: file.size,
                    selected: true,
                })
                .collect(),
            links: Vec::new(),
        }
    }
}

/// Endpoint family for one job kind.
#[derive(Debug, Clone, Copy)]
struct Family {
    prefix: &'static str,
    id_param: &'static str,
    control: &'static str,
}

const TORRENTS: Family = Family {
    prefix: "torrents",
    id_param: "torrent_id",
    control: "controltorrent",
};

const USENET: Family = Family {
    prefix: "usenet",
    id_param: "usenet_id",
    control: "controlusenetdownload",
};

const fn family(kind: JobKind) -> Family {
    match kind {
        JobKind::Torrent => TORRENTS,
        JobKind::Nzb => USENET,
    }
}

/// TorBox client.
#[derive(Debug, Clone)]
pub struct TorBoxClient {
    http: VendorHttp,
    api_key: String,
}

impl TorBoxClient {
    /// Bind the client to an API root and token.
    #[must_use]
    pub fn new(client: ResilientClient, base_url: &str, api_key: &str) -> Self {
        Self {
            http: VendorHttp::new(client, base_url, Auth::Bearer(api_key.to_string())),
            api_key: api_key.to_string(),
        }
    }

    async fn call<T, F>(&self, operation: &'static str, build: F) -> EngineResult<T>
    where
        T: DeserializeOwned,
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder + Send + Sync,
    {
        self.call_optional(operation, build).await?.ok_or_else(|| {
            EngineError::provider(operation, "UNKNOWN: missing data")
        })
    }

    /// Like `call`, but a successful envelope without data yields `None`.
    async fn call_optional<T, F>(&self, operation: &'static str, build: F) -> EngineResult<Option<T>>
    where
        T: DeserializeOwned,
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder + Send + Sync,
    {
        let envelope: Envelope<T> = self.http.json(operation, build).await?;
        if envelope.success {
            return Ok(envelope.data);
        }
        Err(classify(
            operation,
            envelope.error.as_deref().unwrap_or("UNKNOWN"),
            envelope.detail.unwrap_or_else(|| "request failed".into()),
        ))
    }

    async fn create(
        &self,
        operation: &'static str,
        path: &str,
        form: impl Fn() -> Form + Send + Sync,
    ) -> EngineResult<String> {
        let url = self.http.url(path);
        let created: Created = self
            .call(operation, |http| http.post(&url).multipart(form()))
            .await?;
        Ok(created.torrent_id.to_string())
    }

    async fn list(&self, family: Family) -> EngineResult<Vec<TbEntry>> {
        let url = self.http.url(&format!("{}/mylist", family.prefix));
        let entries: Option<Vec<TbEntry>> = self
            .call("get_downloads", |http| {
                http.get(&url).query(&[("bypass_cache", "true")])
            })
            .await?;
        Ok(entries.unwrap_or_default())
    }

    async fn entry(&self, job: &Job) -> EngineResult<TbEntry> {
        let id = provider_id(job)?;
        let url = self.http.url(&format!("{}/mylist", family(job.kind()).prefix));
        self.call("get_torrent", |http| {
            http.get(&url)
                .query(&[("id", id), ("bypass_cache", "true")])
        })
        .await
        .map_err(entry_not_found(id))
    }
}

fn classify(operation: &'static str, code: &str, detail: String) -> EngineError {
    match code {
        "AUTH_ERROR" | "BAD_TOKEN" | "NO_AUTH" => EngineError::Configuration {
            field: "provider.api_key",
            reason: detail,
        },
        "INVALID_OPTION" | "MISSING_REQUIRED_OPTION" | "INVALID_MAGNET" => {
            EngineError::InvalidArgument {
                field: operation,
                reason: "rejected by provider",
                value: Some(detail),
            }
        }
        "ITEM_NOT_FOUND" | "DOWNLOAD_NOT_FOUND" => EngineError::not_found("provider entry", detail),
        "ACTIVE_LIMIT" | "COOLDOWN_LIMIT" => EngineError::RateLimited {
            operation,
            retry_after: std::time::Duration::from_secs(60),
        },
        _ => EngineError::provider(operation, format!("{code}: {detail}")),
    }
}

#[async_trait]
impl DebridClient for TorBoxClient {
    fn provider_name(&self) -> &'static str {
        "torbox"
    }

    fn status_table(&self) -> StatusTable {
        TORBOX_STATUS
    }

    async fn add_magnet(&self, magnet: &str) -> EngineResult<String> {
        self.create("add_magnet", "torrents/createtorrent", || {
            Form::new().text("magnet", magnet.to_string())
        })
        .await
    }

    async fn add_torrent_file(&self, bytes: &[u8]) -> EngineResult<String> {
        self.create("add_torrent_file", "torrents/createtorrent", || {
            Form::new().part("file", Part::bytes(bytes.to_vec()).file_name("upload.torrent"))
        })
        .await
    }

    async fn add_nzb_link(&self, url: &str) -> EngineResult<String> {
        let link = validate_link(url)?;
        self.create("add_nzb_link", "usenet/createusenetdownload", || {
            Form::new().text("link", link.to_string())
        })
        .await
    }

    async fn add_nzb_file(&self, bytes: &[u8], file_name: &str) -> EngineResult<String> {
        let file_name = file_name.to_string();
        self.create("add_nzb_file", "usenet/createusenetdownload", || {
            Form::new().part("file", Part::bytes(bytes.to_vec()).file_name(file_name.clone()))
        })
        .await
    }

    async fn get_downloads(&self) -> EngineResult<Vec<ProviderTorrent>> {
        let mut entries = self.list(TORRENTS).await?;
        entries.extend(self.list(USENET).await?);
        Ok(entries.into_iter().map(ProviderTorrent::from).collect())
    }

    async fn get_torrent(&self, job: &Job) -> EngineResult<ProviderTorrent> {
        self.entry(job).await.map(ProviderTorrent::from)
    }

    async fn get_available_files(&self, hash: &str) -> EngineResult<Vec<ProviderFile>> {
        let url = self.http.url("torrents/checkcached");
        // Not cached reads as `data: null` or an empty list.
        let cached: Option<Vec<CachedEntry>> = self
            .call_optional("get_available_files", |http| {
                http.get(&url).query(&[
                    ("hash", hash),
                    ("format", "list"),
                    ("list_files", "true"),
                ])
            })
            .await?;
        Ok(cached
            .unwrap_or_default()
            .into_iter()
            .flat_map(|entry| entry.files)
            .enumerate()
            .map(|(index, file)| ProviderFile {
                id: index.to_string(),
                path: file.name,
                size_bytes: file.size,
                selected: false,
            })
            .collect())
    }

    async fn delete(&self, job: &Job) -> EngineResult<()> {
        let id = provider_id(job)?;
        let family = family(job.kind());
        let numeric: u64 = id.parse().map_err(|_| EngineError::InvalidArgument {
            field: "provider_id",
            reason: "not numeric",
            value: Some(id.to_string()),
        })?;
        let url = self.http.url(&format!("{}/{}", family.prefix, family.control));
        let mut body = serde_json::Map::new();
        body.insert(family.id_param.to_string(), json!(numeric));
        body.insert("operation".to_string(), json!("delete"));
        let _: serde_json::Value = self
            .call("delete", |http| http.post(&url).json(&body))
            .await
            .map_err(entry_not_found(id))?;
        Ok(())
    }

    async fn unrestrict(&self, _job: &Job, link: &str) -> EngineResult<String> {
        let link = validate_link(link)?;
        let direct: String = self
            .call("unrestrict", |http| {
                http.get(link.as_str())
                    .query(&[("token", self.api_key.as_str())])
            })
            .await?;
        Ok(direct)
    }

    async fn get_download_infos(&self, job: &Job) -> EngineResult<Vec<DownloadInfo>> {
        let entry = self.entry(job).await?;
        let family = family(job.kind());
        let base = self.http.url(&format!("{}/requestdl", family.prefix));
        Ok(entry
            .files
            .into_iter()
            .map(|file| {
                let file_name = file.name.rsplit('/').next().map(str::to_string);
                DownloadInfo {
                    restricted_link: format!(
                        "{base}?{}={}&file_id={}",
                        family.id_param, entry.id, file.id
                    ),
                    file_name,
                    remote_path: Some(file.name),
                    size_bytes: Some(file.size),
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_positions_and_cache_hits_map() {
        assert_eq!(TORBOX_STATUS.lookup("queued_123"), Some(ProviderStatus::Processing));
        assert_eq!(TORBOX_STATUS.lookup("cached"), Some(ProviderStatus::Finished));
        assert_eq!(
            TORBOX_STATUS.lookup("stalled (no seeds)"),
            Some(ProviderStatus::Downloading)
        );
        assert_eq!(TORBOX_STATUS.lookup("metaDL"), Some(ProviderStatus::Processing));
        assert_eq!(TORBOX_STATUS.lookup("failed (dmca)"), Some(ProviderStatus::Error));
    }

    #[test]
    fn seeding_entries_with_present_files_read_as_completed() -> anyhow::Result<()> {
        let entry: TbEntry = serde_json::from_str(
            r#"{"id":7,"hash":"abc","name":"x","size":3,"download_state":"uploading",
                "progress":1.0,"download_finished":true,"download_present":true,"files":[]}"#,
        )?;
        let snapshot = ProviderTorrent::from(entry);
        assert_eq!(snapshot.raw_status, "completed");
        assert_eq!(snapshot.message.as_deref(), Some("uploading"));
        assert!((snapshot.progress - 100.0).abs() < f64::EPSILON);
        Ok(())
    }
}
