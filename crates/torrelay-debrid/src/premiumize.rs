//! Premiumize client.
//!
//! # Design
//! - Transfers have no per-id endpoint; lookups scan `transfer/list`.
//! - Finished content lives in a cloud folder whose listing already holds
//!   direct links, so `unrestrict` only validates.
//! - `seeding` counts as finished: the content is complete in the cloud.
//! - `cache/check` only answers per item; a hit is expanded into its files
//!   through `transfer/directdl`, keyed by path since the cache has no file ids.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use torrelay_core::{
    DebridClient, DownloadInfo, EngineError, EngineResult, Job, ProviderFile, ProviderStatus,
    ProviderTorrent, StatusRule, StatusTable, validate_link,
};
use torrelay_resilience::ResilientClient;

use crate::http::{Auth, VendorHttp, provider_id};

/// Default API root.
pub const PREMIUMIZE_BASE_URL: &str = "https://www.premiumize.me/api";

const MAX_FOLDER_DEPTH: usize = 8;

const RULES: &[StatusRule] = &[
    StatusRule::exact("waiting", ProviderStatus::Processing),
    StatusRule::exact("queued", ProviderStatus::Processing),
    StatusRule::exact("running", ProviderStatus::Downloading),
    StatusRule::exact("finished", ProviderStatus::Finished),
    StatusRule::exact("seeding", ProviderStatus::Finished),
    StatusRule::exact("deleted", ProviderStatus::Error),
    StatusRule::exact("banned", ProviderStatus::Error),
    StatusRule::exact("timeout", ProviderStatus::Error),
    StatusRule::exact("error", ProviderStatus::Error),
];

/// Status table for Premiumize transfers.
pub const PREMIUMIZE_STATUS: StatusTable = StatusTable::new("premiumize", RULES);

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(flatten)]
    body: Option<T>,
}

#[derive(Debug, Deserialize)]
struct Created {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TransferList {
    transfers: Vec<Transfer>,
}

#[derive(Debug, Deserialize)]
struct Transfer {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    message: Option<String>,
    status: String,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    src: Option<String>,
    #[serde(default)]
    folder_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FolderList {
    content: Vec<FolderItem>,
}

#[derive(Debug, Deserialize)]
struct FolderItem {
    id: String,
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CacheCheck {
    response: Vec<bool>,
}

#[derive(Debug, Deserialize)]
struct DirectContent {
    #[serde(default)]
    content: Vec<DirectFile>,
}

#[derive(Debug, Deserialize)]
struct DirectFile {
    path: String,
    #[serde(default)]
    size: Option<serde_json::Value>,
}

impl From<Transfer> for ProviderTorrent {
    fn from(value: Transfer) -> Self {
        let hash = value
            .src
            .as_deref()
            .and_then(|src| torrelay_core::MagnetLink::parse(src).ok())
            .map(|magnet| magnet.info_hash)
            .unwrap_or_default();
        Self {
            id: value.id,
            hash,
            name: value.name,
            raw_status: value.status,
            message: value.message,
            size_bytes: 0,
            progress: value.progress.unwrap_or(0.0) * 100.0,
            speed_bps: 0,
            seeders: None,
            files: Vec::new(),
            links: Vec::new(),
        }
    }
}

/// Premiumize client.
#[derive(Debug, Clone)]
pub struct PremiumizeClient {
    http: VendorHttp,
}

impl PremiumizeClient {
    /// Bind the client to an API root and key.
    #[must_use]
    pub fn new(client: ResilientClient, base_url: &str, api_key: &str) -> Self {
        Self {
            http: VendorHttp::new(
                client,
                base_url,
                Auth::Query {
                    name: "apikey",
                    value: api_key.to_string(),
                },
            ),
        }
    }

    async fn call<T, F>(&self, operation: &'static str, build: F) -> EngineResult<T>
    where
        T: DeserializeOwned,
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder + Send + Sync,
    {
        let envelope: Envelope<T> = self.http.json(operation, build).await?;
        match (envelope.status.as_str(), envelope.body) {
            ("success", Some(body)) => Ok(body),
            _ => Err(classify_message(
                operation,
                envelope.message.unwrap_or_else(|| "unknown error".into()),
            )),
        }
    }

    async fn transfers(&self) -> EngineResult<Vec<Transfer>> {
        let url = self.http.url("transfer/list");
        let list: TransferList = self.call("get_downloads", |http| http.get(&url)).await?;
        Ok(list.transfers)
    }

    async fn transfer(&self, id: &str) -> EngineResult<Transfer> {
        self.transfers()
            .await?
            .into_iter()
            .find(|transfer| transfer.id == id)
            .ok_or_else(|| EngineError::not_found("provider entry", id))
    }

    async fn create(
        &self,
        operation: &'static str,
        form: impl Fn() -> Form + Send + Sync,
    ) -> EngineResult<String> {
        let url = self.http.url("transfer/create");
        let created: Created = self
            .call(operation, |http| http.post(&url).multipart(form()))
            .await?;
        Ok(created.id)
    }

    async fn folder_files(&self, folder_id: &str) -> EngineResult<Vec<(String, FolderItem)>> {
        let url = self.http.url("folder/list");
        let mut pending = vec![(folder_id.to_string(), String::new(), 0_usize)];
        let mut files = Vec::new();
        while let Some((id, prefix, depth)) = pending.pop() {
            let listing: FolderList = self
                .call("get_download_infos", |http| {
                    http.get(&url).query(&[("id", id.as_str())])
                })
                .await?;
            for item in listing.content {
                let path = if prefix.is_empty() {
                    item.name.clone()
                } else {
                    format!("{prefix}/{}", item.name)
                };
                if item.kind == "folder" {
                    if depth < MAX_FOLDER_DEPTH {
                        pending.push((item.id.clone(), path, depth + 1));
                    }
                } else {
                    files.push((path, item));
                }
            }
        }
        files.sort_by(|left, right| left.0.cmp(&right.0));
        Ok(files)
    }
}

fn classify_message(operation: &'static str, message: String) -> EngineError {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("not logged in") || lowered.contains("apikey") {
        EngineError::Configuration {
            field: "provider.api_key",
            reason: message,
        }
    } else if lowered.contains("not found") {
        EngineError::not_found("provider entry", message)
    } else if lowered.contains("invalid") {
        EngineError::InvalidArgument {
            field: operation,
            reason: "rejected by provider",
            value: Some(message),
        }
    } else {
        EngineError::provider(operation, message)
    }
}

fn size_of(value: Option<&serde_json::Value>) -> u64 {
    match value {
        Some(serde_json::Value::Number(number)) => number.as_u64().unwrap_or(0),
        Some(serde_json::Value::String(text)) => text.parse().unwrap_or(0),
        _ => 0,
    }
}

#[async_trait]
impl DebridClient for PremiumizeClient {
    fn provider_name(&self) -> &'static str {
        "premiumize"
    }

    fn status_table(&self) -> StatusTable {
        PREMIUMIZE_STATUS
    }

    async fn add_magnet(&self, magnet: &str) -> EngineResult<String> {
        self.create("add_magnet", || Form::new().text("src", magnet.to_string()))
            .await
    }

    async fn add_torrent_file(&self, bytes: &[u8]) -> EngineResult<String> {
        self.create("add_torrent_file", || {
            Form::new().part("file", Part::bytes(bytes.to_vec()).file_name("upload.torrent"))
        })
        .await
    }

    async fn add_nzb_link(&self, url: &str) -> EngineResult<String> {
        let link = validate_link(url)?;
        self.create("add_nzb_link", || Form::new().text("src", link.to_string()))
            .await
    }

    async fn add_nzb_file(&self, bytes: &[u8], file_name: &str) -> EngineResult<String> {
        let file_name = file_name.to_string();
        self.create("add_nzb_file", || {
            Form::new().part("file", Part::bytes(bytes.to_vec()).file_name(file_name.clone()))
        })
        .await
    }

    async fn get_downloads(&self) -> EngineResult<Vec<ProviderTorrent>> {
        Ok(self
            .transfers()
            .await?
            .into_iter()
            .map(ProviderTorrent::from)
            .collect())
    }

    async fn get_torrent(&self, job: &Job) -> EngineResult<ProviderTorrent> {
        let id = provider_id(job)?;
        self.transfer(id).await.map(ProviderTorrent::from)
    }

    async fn get_available_files(&self, hash: &str) -> EngineResult<Vec<ProviderFile>> {
        let url = self.http.url("cache/check");
        let check: CacheCheck = self
            .call("get_available_files", |http| {
                http.get(&url).query(&[("items[]", hash)])
            })
            .await?;
        if !check.response.first().copied().unwrap_or(false) {
            return Ok(Vec::new());
        }
        let url = self.http.url("transfer/directdl");
        let magnet = format!("magnet:?xt=urn:btih:{hash}");
        let direct: DirectContent = self
            .call("get_available_files", |http| {
                http.post(&url).form(&[("src", magnet.as_str())])
            })
            .await?;
        Ok(direct
            .content
            .into_iter()
            .map(|file| ProviderFile {
                id: file.path.clone(),
                path: file.path,
                size_bytes: size_of(file.size.as_ref()),
                selected: false,
            })
            .collect())
    }

    async fn delete(&self, job: &Job) -> EngineResult<()> {
        let id = provider_id(job)?;
        let url = self.http.url("transfer/delete");
        let _: serde_json::Value = self
            .call("delete", |http| http.post(&url).form(&[("id", id)]))
            .await?;
        Ok(())
    }

    async fn unrestrict(&self, _job: &Job, link: &str) -> EngineResult<String> {
        validate_link(link).map(|url| url.to_string())
    }

    async fn get_download_infos(&self, job: &Job) -> EngineResult<Vec<DownloadInfo>> {
        let id = provider_id(job)?;
        let transfer = self.transfer(id).await?;
        let folder_id = transfer.folder_id.ok_or_else(|| {
            EngineError::provider("get_download_infos", "finished transfer has no folder")
        })?;
        Ok(self
            .folder_files(&folder_id)
            .await?
            .into_iter()
            .filter_map(|(path, item)| {
                let link = item.link?;
                Some(DownloadInfo {
                    restricted_link: link,
                    file_name: Some(item.name),
                    remote_path: Some(path),
                    size_bytes: item.size,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_and_seeding_are_terminal_successes() {
        assert_eq!(PREMIUMIZE_STATUS.lookup("finished"), Some(ProviderStatus::Finished));
        assert_eq!(PREMIUMIZE_STATUS.lookup("seeding"), Some(ProviderStatus::Finished));
        assert_eq!(PREMIUMIZE_STATUS.lookup("running"), Some(ProviderStatus::Downloading));
        assert_eq!(PREMIUMIZE_STATUS.lookup("cached"), None);
    }

    #[test]
    fn sizes_accept_numbers_and_strings() {
        assert_eq!(size_of(Some(&serde_json::json!(42))), 42);
        assert_eq!(size_of(Some(&serde_json::json!("7"))), 7);
        assert_eq!(size_of(None), 0);
    }

    #[test]
    fn envelope_flattens_body() -> anyhow::Result<()> {
        let envelope: Envelope<Created> =
            serde_json::from_str(r#"{"status":"success","id":"abc","name":"x","type":"torrent"}"#)?;
        assert_eq!(envelope.body.map(|body| body.id).as_deref(), Some("abc"));
        Ok(())
    }
}
