//! AllDebrid v4 client.
//!
//! Every response is wrapped in a `{status, data | error}` envelope; the
//! numeric `statusCode` is the raw status, and only code 4 (`Ready`) counts
//! as finished.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use torrelay_core::{
    DebridClient, DownloadInfo, EngineError, EngineResult, Job, ProviderFile, ProviderStatus,
    ProviderTorrent, StatusRule, StatusTable, validate_link,
};
use torrelay_resilience::ResilientClient;

use crate::http::{Auth, VendorHttp, entry_not_found, provider_id};

/// Default API root.
pub const ALL_DEBRID_BASE_URL: &str = "https://api.alldebrid.com/v4";

fn is_failure_code(raw: &str) -> bool {
    raw.parse::<u32>().is_ok_and(|code| code >= 5)
}

const RULES: &[StatusRule] = &[
    StatusRule::exact("0", ProviderStatus::Processing),
    StatusRule::exact("1", ProviderStatus::Downloading),
    StatusRule::exact("2", ProviderStatus::Uploading),
    StatusRule::exact("3", ProviderStatus::Uploading),
    StatusRule::exact("4", ProviderStatus::Finished),
    StatusRule::predicate(is_failure_code, ProviderStatus::Error),
];

/// Status table for AllDebrid status codes.
pub const ALL_DEBRID_STATUS: StatusTable = StatusTable::new("all_debrid", RULES);

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    data: Option<T>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct Uploaded {
    #[serde(default)]
    magnets: Vec<UploadedEntry>,
    #[serde(default)]
    files: Vec<UploadedEntry>,
}

#[derive(Debug, Deserialize)]
struct UploadedEntry {
    id: Option<u64>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MagnetList {
    One(AdMagnet),
    Many(Vec<AdMagnet>),
}

#[derive(Debug, Deserialize)]
struct StatusData {
    magnets: MagnetList,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdMagnet {
    id: u64,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    hash: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    status: String,
    status_code: u32,
    #[serde(default)]
    downloaded: u64,
    #[serde(default)]
    download_speed: u64,
    #[serde(default)]
    seeders: Option<u32>,
    #[serde(default)]
    links: Vec<AdLink>,
}

#[derive(Debug, Deserialize)]
struct AdLink {
    link: String,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Unlocked {
    link: String,
}

#[derive(Debug, Deserialize)]
struct InstantData {
    magnets: Vec<InstantEntry>,
}

#[derive(Debug, Deserialize)]
struct InstantEntry {
    #[serde(default)]
    instant: bool,
    #[serde(default)]
    files: Vec<InstantNode>,
}

/// Nested file tree node: `n` name, `s` size, `e` children.
#[derive(Debug, Deserialize)]
struct InstantNode {
    n: String,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    e: Vec<InstantNode>,
}

impl From<AdMagnet> for ProviderTorrent {
    #[allow(clippy::cast_precision_loss)]
    fn from(value: AdMagnet) -> Self {
        let progress = if value.size == 0 {
            0.0
        } else {
            (value.downloaded as f64 / value.size as f64) * 100.0
        };
        let links = value.links.iter().map(|link| link.link.clone()).collect();
        let files = value
            .links
            .into_iter()
            .enumerate()
            .map(|(index, link)| ProviderFile {
                id: index.to_string(),
                path: link.filename.unwrap_or_default(),
                size_bytes: link.size.unwrap_or(0),
                selected: true,
            })
            .collect();
        Self {
            id: value.id.to_string(),
            hash: value.hash,
            name: value.filename,
            raw_status: value.status_code.to_string(),
            message: Some(value.status).filter(|status| !status.is_empty()),
            size_bytes: value.size,
            progress,
            speed_bps: value.download_speed,
            seeders: value.seeders,
            files,
            links,
        }
    }
}

/// AllDebrid client.
#[derive(Debug, Clone)]
pub struct AllDebridClient {
    http: VendorHttp,
}

impl AllDebridClient {
    /// Bind the client to an API root and token.
    #[must_use]
    pub fn new(client: ResilientClient, base_url: &str, api_key: &str) -> Self {
        Self {
            http: VendorHttp::new(client, base_url, Auth::Bearer(api_key.to_string())),
        }
    }

    async fn call<T, F>(&self, operation: &'static str, build: F) -> EngineResult<T>
    where
        T: DeserializeOwned,
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder + Send + Sync,
    {
        let envelope: Envelope<T> = self.http.json(operation, build).await?;
        unwrap_envelope(operation, envelope)
    }

    async fn magnets(&self, id: Option<&str>) -> EngineResult<Vec<AdMagnet>> {
        let url = self.http.url("magnet/status");
        let data: StatusData = self
            .call("get_torrent", |http| {
                let request = http.get(&url);
                match id {
                    Some(id) => request.query(&[("id", id)]),
                    None => request,
                }
            })
            .await?;
        Ok(match data.magnets {
            MagnetList::One(magnet) => vec![magnet],
            MagnetList::Many(magnets) => magnets,
        })
    }

    async fn magnet(&self, id: &str) -> EngineResult<AdMagnet> {
        self.magnets(Some(id))
            .await
            .map_err(entry_not_found(id))?
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::not_found("provider entry", id))
    }
}

fn unwrap_envelope<T>(operation: &'static str, envelope: Envelope<T>) -> EngineResult<T> {
    if envelope.status == "success"
        && let Some(data) = envelope.data
    {
        return Ok(data);
    }
    let error = envelope.error.unwrap_or(ApiError {
        code: "UNKNOWN".into(),
        message: "missing data".into(),
    });
    Err(classify_code(operation, error))
}

fn classify_code(operation: &'static str, error: ApiError) -> EngineError {
    let code = error.code.as_str();
    if code.starts_with("AUTH_") {
        EngineError::Configuration {
            field: "provider.api_key",
            reason: error.message,
        }
    } else if code == "MAGNET_INVALID_ID" || code.ends_with("NOT_FOUND") {
        EngineError::not_found("provider entry", error.message)
    } else if code == "MAGNET_INVALID_URI" || code == "LINK_IS_MISSING" || code.ends_with("_INVALID") {
        EngineError::InvalidArgument {
            field: operation,
            reason: "rejected by provider",
            value: Some(error.message),
        }
    } else if code.contains("FLOOD") || code.contains("TOO_MANY") {
        EngineError::RateLimited {
            operation,
            retry_after: std::time::Duration::from_secs(60),
        }
    } else {
        EngineError::provider(operation, format!("{}: {}", error.code, error.message))
    }
}

fn first_id(operation: &'static str, entries: Vec<UploadedEntry>) -> EngineResult<String> {
    let entry = entries
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::provider(operation, "empty upload response"))?;
    if let Some(error) = entry.error {
        return Err(classify_code(operation, error));
    }
    entry
        .id
        .map(|id| id.to_string())
        .ok_or_else(|| EngineError::provider(operation, "upload response without id"))
}

fn flatten(nodes: Vec<InstantNode>, prefix: &str, out: &mut Vec<ProviderFile>) {
    for node in nodes {
        let path = if prefix.is_empty() {
            node.n
        } else {
            format!("{prefix}/{}", node.n)
        };
        if node.e.is_empty() {
            out.push(ProviderFile {
                id: out.len().to_string(),
                path,
                size_bytes: node.s.unwrap_or(0),
                selected: false,
            });
        } else {
            flatten(node.e, &path, out);
        }
    }
}

#[async_trait]
impl DebridClient for AllDebridClient {
    fn provider_name(&self) -> &'static str {
        "all_debrid"
    }

    fn status_table(&self) -> StatusTable {
        ALL_DEBRID_STATUS
    }

    async fn add_magnet(&self, magnet: &str) -> EngineResult<String> {
        let url = self.http.url("magnet/upload");
        let uploaded: Uploaded = self
            .call("add_magnet", |http| {
                http.get(&url).query(&[("magnets[]", magnet)])
            })
            .await?;
        first_id("add_magnet", uploaded.magnets)
    }

    async fn add_torrent_file(&self, bytes: &[u8]) -> EngineResult<String> {
        let url = self.http.url("magnet/upload/file");
        let uploaded: Uploaded = self
            .call("add_torrent_file", |http| {
                let part = Part::bytes(bytes.to_vec()).file_name("upload.torrent");
                http.post(&url).multipart(Form::new().part("files[]", part))
            })
            .await?;
        first_id("add_torrent_file", uploaded.files)
    }

    async fn get_downloads(&self) -> EngineResult<Vec<ProviderTorrent>> {
        Ok(self
            .magnets(None)
            .await?
            .into_iter()
            .map(ProviderTorrent::from)
            .collect())
    }

    async fn get_torrent(&self, job: &Job) -> EngineResult<ProviderTorrent> {
        let id = provider_id(job)?;
        self.magnet(id).await.map(ProviderTorrent::from)
    }

    async fn get_available_files(&self, hash: &str) -> EngineResult<Vec<ProviderFile>> {
        let url = self.http.url("magnet/instant");
        let data: InstantData = self
            .call("get_available_files", |http| {
                http.get(&url).query(&[("magnets[]", hash)])
            })
            .await?;
        let mut files = Vec::new();
        for entry in data.magnets.into_iter().filter(|entry| entry.instant) {
            flatten(entry.files, "", &mut files);
        }
        Ok(files)
    }

    async fn delete(&self, job: &Job) -> EngineResult<()> {
        let id = provider_id(job)?;
        let url = self.http.url("magnet/delete");
        let _: serde_json::Value = self
            .call("delete", |http| http.get(&url).query(&[("id", id)]))
            .await
            .map_err(entry_not_found(id))?;
        Ok(())
    }

    async fn unrestrict(&self, _job: &Job, link: &str) -> EngineResult<String> {
        let link = validate_link(link)?;
        let url = self.http.url("link/unlock");
        let unlocked: Unlocked = self
            .call("unrestrict", |http| {
                http.get(&url).query(&[("link", link.as_str())])
            })
            .await?;
        Ok(unlocked.link)
    }

    async fn get_download_infos(&self, job: &Job) -> EngineResult<Vec<DownloadInfo>> {
        let id = provider_id(job)?;
        let magnet = self.magnet(id).await?;
        if magnet.status_code != 4 {
            return Err(EngineError::provider(
                "get_download_infos",
                format!("magnet not ready (status code {})", magnet.status_code),
            ));
        }
        Ok(magnet
            .links
            .into_iter()
            .map(|link| DownloadInfo {
                restricted_link: link.link,
                remote_path: link.filename.clone(),
                file_name: link.filename,
                size_bytes: link.size,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_code_four_is_finished() {
        assert_eq!(ALL_DEBRID_STATUS.lookup("4"), Some(ProviderStatus::Finished));
        assert_eq!(ALL_DEBRID_STATUS.lookup("0"), Some(ProviderStatus::Processing));
        assert_eq!(ALL_DEBRID_STATUS.lookup("7"), Some(ProviderStatus::Error));
        assert_eq!(ALL_DEBRID_STATUS.lookup("15"), Some(ProviderStatus::Error));
        assert_eq!(ALL_DEBRID_STATUS.lookup("Ready"), None);
    }

    #[test]
    fn envelope_errors_are_classified() {
        let envelope: Envelope<Uploaded> = Envelope {
            status: "error".into(),
            data: None,
            error: Some(ApiError {
                code: "AUTH_BAD_APIKEY".into(),
                message: "The auth apikey is invalid".into(),
            }),
        };
        assert!(matches!(
            unwrap_envelope("add_magnet", envelope),
            Err(EngineError::Configuration { .. })
        ));
    }

    #[test]
    fn instant_tree_is_flattened() -> anyhow::Result<()> {
        let nodes: Vec<InstantNode> = serde_json::from_str(
            r#"[{"n":"Show","e":[{"n":"e01.mkv","s":5},{"n":"e02.mkv","s":6}]},{"n":"info.nfo","s":1}]"#,
        )?;
        let mut files = Vec::new();
        flatten(nodes, "", &mut files);
        let paths: Vec<&str> = files.iter().map(|file| file.path.as_str()).collect();
        assert_eq!(paths, vec!["Show/e01.mkv", "Show/e02.mkv", "info.nfo"]);
        assert_eq!(files[2].id, "2");
        Ok(())
    }
}
