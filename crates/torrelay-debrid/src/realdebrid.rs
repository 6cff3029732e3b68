//! Real-Debrid REST client.
//!
//! # Design
//! - The only vendor with an explicit file-selection step; `select_files`
//!   posts the chosen ids and re-reads the entry to report the count.
//! - Links on a finished entry are positional: the n-th link belongs to the
//!   n-th selected file.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use torrelay_core::{
    DebridClient, DownloadInfo, EngineError, EngineResult, Job, ProviderFile, ProviderStatus,
    ProviderTorrent, StatusRule, StatusTable, validate_link,
};

use crate::http::{Auth, VendorHttp, entry_not_found, provider_id};

/// Default API root.
pub const REAL_DEBRID_BASE_URL: &str = "https://api.real-debrid.com/rest/1.0";

const RULES: &[StatusRule] = &[
    StatusRule::exact("magnet_conversion", ProviderStatus::Processing),
    StatusRule::exact("queued", ProviderStatus::Processing),
    StatusRule::exact("waiting_files_selection", ProviderStatus::WaitingForFileSelection),
    StatusRule::exact("downloading", ProviderStatus::Downloading),
    StatusRule::exact("compressing", ProviderStatus::Uploading),
    StatusRule::exact("uploading", ProviderStatus::Uploading),
    StatusRule::exact("downloaded", ProviderStatus::Finished),
    StatusRule::exact("magnet_error", ProviderStatus::Error),
    StatusRule::exact("error", ProviderStatus::Error),
    StatusRule::exact("virus", ProviderStatus::Error),
    StatusRule::exact("dead", ProviderStatus::Error),
];

/// Status table for Real-Debrid.
pub const REAL_DEBRID_STATUS: StatusTable = StatusTable::new("real_debrid", RULES);

#[derive(Debug, Deserialize)]
struct AddResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RdFile {
    id: u64,
    path: String,
    bytes: u64,
    selected: u8,
}

#[derive(Debug, Deserialize)]
struct RdTorrent {
    id: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    hash: String,
    #[serde(default)]
    bytes: u64,
    #[serde(default)]
    progress: f64,
    status: String,
    #[serde(default)]
    speed: Option<u64>,
    #[serde(default)]
    seeders: Option<u32>,
    #[serde(default)]
    files: Vec<RdFile>,
    #[serde(default)]
    links: Vec<String>,
}

impl From<RdTorrent> for ProviderTorrent {
    fn from(value: RdTorrent) -> Self {
        Self {
            id: value.id,
            hash: value.hash,
            name: value.filename,
            raw_status: value.status,
            message: None,
            size_bytes: value.bytes,
            progress: value.progress,
            speed_bps: value.speed.unwrap_or(0),
            seeders: value.seeders,
            files: value
                .files
                .into_iter()
                .map(|file| ProviderFile {
                    id: file.id.to_string(),
                    path: file.path,
                    size_bytes: file.bytes,
                    selected: file.selected == 1,
                })
                .collect(),
            links: value.links,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UnrestrictResponse {
    download: String,
}

#[derive(Debug, Deserialize)]
struct CachedFile {
    filename: String,
    filesize: u64,
}

/// Real-Debrid client.
#[derive(Debug, Clone)]
pub struct RealDebridClient {
    http: VendorHttp,
}

impl RealDebridClient {
    /// Bind the client to an API root and token.
    #[must_use]
    pub fn new(
        client: torrelay_resilience::ResilientClient,
        base_url: &str,
        api_key: &str,
    ) -> Self {
        Self {
            http: VendorHttp::new(client, base_url, Auth::Bearer(api_key.to_string())),
        }
    }

    async fn info(&self, id: &str) -> EngineResult<RdTorrent> {
        let url = self.http.url(&format!("torrents/info/{id}"));
        self.http
            .json("get_torrent", |http| http.get(&url))
            .await
            .map_err(entry_not_found(id))
    }
}

#[async_trait]
impl DebridClient for RealDebridClient {
    fn provider_name(&self) -> &'static str {
        "real_debrid"
    }

    fn status_table(&self) -> StatusTable {
        REAL_DEBRID_STATUS
    }

    async fn add_magnet(&self, magnet: &str) -> EngineResult<String> {
        let url = self.http.url("torrents/addMagnet");
        let added: AddResponse = self
            .http
            .json("add_magnet", |http| http.post(&url).form(&[("magnet", magnet)]))
            .await?;
        Ok(added.id)
    }

    async fn add_torrent_file(&self, bytes: &[u8]) -> EngineResult<String> {
        let url = self.http.url("torrents/addTorrent");
        let added: AddResponse = self
            .http
            .json("add_torrent_file", |http| {
                http.request(Method::PUT, &url).body(bytes.to_vec())
            })
            .await?;
        Ok(added.id)
    }

    async fn get_downloads(&self) -> EngineResult<Vec<ProviderTorrent>> {
        let url = self.http.url("torrents");
        let torrents: Vec<RdTorrent> = self
            .http
            .json("get_downloads", |http| http.get(&url).query(&[("limit", "2500")]))
            .await?;
        Ok(torrents.into_iter().map(ProviderTorrent::from).collect())
    }

    async fn get_torrent(&self, job: &Job) -> EngineResult<ProviderTorrent> {
        let id = provider_id(job)?;
        self.info(id).await.map(ProviderTorrent::from)
    }

    async fn get_available_files(&self, hash: &str) -> EngineResult<Vec<ProviderFile>> {
        let hash = hash.to_ascii_lowercase();
        let url = self.http.url(&format!("torrents/instantAvailability/{hash}"));
        let body: HashMap<String, serde_json::Value> = self
            .http
            .json("get_available_files", |http| http.get(&url))
            .await?;
        let mut files: Vec<ProviderFile> = Vec::new();
        let variants = body
            .get(&hash)
            .and_then(|entry| entry.get("rd"))
            .and_then(serde_json::Value::as_array);
        for variant in variants.into_iter().flatten() {
            let Ok(variant) = serde_json::from_value::<HashMap<String, CachedFile>>(variant.clone())
            else {
                continue;
            };
            for (id, file) in variant {
                if files.iter().all(|known| known.id != id) {
                    files.push(ProviderFile {
                        id,
                        path: file.filename,
                        size_bytes: file.filesize,
                        selected: false,
                    });
                }
            }
        }
        files.sort_by(|left, right| left.id.cmp(&right.id));
        Ok(files)
    }

    async fn select_files(&self, job: &Job, file_ids: &[String]) -> EngineResult<usize> {
        let id = provider_id(job)?;
        if file_ids.is_empty() {
            return Err(EngineError::InvalidArgument {
                field: "file_ids",
                reason: "empty selection",
                value: None,
            });
        }
        let url = self.http.url(&format!("torrents/selectFiles/{id}"));
        let joined = file_ids.join(",");
        self.http
            .send("select_files", |http| {
                http.post(&url).form(&[("files", joined.as_str())])
            })
            .await
            .map_err(entry_not_found(id))?;
        let refreshed = self.info(id).await?;
        Ok(refreshed.files.iter().filter(|file| file.selected == 1).count())
    }

    async fn delete(&self, job: &Job) -> EngineResult<()> {
        let id = provider_id(job)?;
        let url = self.http.url(&format!("torrents/delete/{id}"));
        self.http
            .send("delete", |http| http.delete(&url))
            .await
            .map_err(entry_not_found(id))?;
        Ok(())
    }

    async fn unrestrict(&self, _job: &Job, link: &str) -> EngineResult<String> {
        let link = validate_link(link)?;
        let url = self.http.url("unrestrict/link");
        let unrestricted: UnrestrictResponse = self
            .http
            .json("unrestrict", |http| {
                http.post(&url).form(&[("link", link.as_str())])
            })
            .await?;
        Ok(unrestricted.download)
    }

    async fn get_download_infos(&self, job: &Job) -> EngineResult<Vec<DownloadInfo>> {
        let id = provider_id(job)?;
        let torrent = self.info(id).await?;
        let selected: Vec<&RdFile> = torrent.files.iter().filter(|file| file.selected == 1).collect();
        let positional = selected.len() == torrent.links.len();
        Ok(torrent
            .links
            .iter()
            .enumerate()
            .map(|(index, link)| {
                let file = positional.then(|| selected[index]);
                DownloadInfo {
                    restricted_link: link.clone(),
                    file_name: file.and_then(|file| file_name(&file.path)),
                    remote_path: file.map(|file| file.path.trim_start_matches('/').to_string()),
                    size_bytes: file.map(|file| file.bytes),
                }
            })
            .collect())
    }
}

fn file_name(path: &str) -> Option<String> {
    path.rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documented_statuses_are_mapped() {
        for raw in [
            "magnet_conversion",
            "queued",
            "waiting_files_selection",
            "downloading",
            "compressing",
            "uploading",
            "downloaded",
            "magnet_error",
            "error",
            "virus",
            "dead",
        ] {
            assert!(REAL_DEBRID_STATUS.lookup(raw).is_some(), "{raw} unmapped");
        }
        assert_eq!(
            REAL_DEBRID_STATUS.lookup("Downloaded"),
            Some(ProviderStatus::Finished)
        );
    }

    #[test]
    fn torrent_payload_converts() -> anyhow::Result<()> {
        let torrent: RdTorrent = serde_json::from_str(
            r#"{"id":"RD1","filename":"Movie","hash":"ABC","bytes":10,"progress":50,
                "status":"downloading","speed":7,"seeders":3,
                "files":[{"id":1,"path":"/Movie/a.mkv","bytes":10,"selected":1}],
                "links":[]}"#,
        )?;
        let snapshot = ProviderTorrent::from(torrent);
        assert_eq!(snapshot.files[0].id, "1");
        assert!(snapshot.files[0].selected);
        assert_eq!(snapshot.speed_bps, 7);
        assert_eq!(file_name("/Movie/a.mkv").as_deref(), Some("a.mkv"));
        Ok(())
    }
}
