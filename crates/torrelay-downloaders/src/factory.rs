//! Construction of the configured transport.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use torrelay_config::{DownloaderKind, DownloaderSettings};
use torrelay_core::Downloader;

use crate::aria2::{Aria2Downloader, Aria2Options, HttpAria2Rpc};
use crate::error::{DownloaderError, DownloaderResult};
use crate::multipart::{MultipartDownloader, MultipartOptions};
use crate::simple::SimpleDownloader;
use crate::strm::StrmDownloader;
use crate::symlink::SymlinkDownloader;

/// Build the downloader selected by `settings`.
///
/// # Errors
///
/// Returns [`DownloaderError::Configuration`] when the symlink transport has
/// no mount root.
pub fn build_downloader(
    settings: &DownloaderSettings,
    http: Client,
) -> DownloaderResult<Arc<dyn Downloader>> {
    Ok(match settings.kind {
        DownloaderKind::Simple => Arc::new(SimpleDownloader::new(http)),
        DownloaderKind::Multipart => Arc::new(MultipartDownloader::new(
            http,
            MultipartOptions {
                part_count: settings.part_count,
                parallel_parts: settings.parallel_parts,
                part_retries: settings.part_retries,
                min_part_size: settings.min_part_size_bytes,
            },
        )),
        DownloaderKind::Aria2 => {
            let aria2 = &settings.aria2;
            Arc::new(Aria2Downloader::new(
                Arc::new(HttpAria2Rpc::new(http, aria2.url.clone(), aria2.secret.clone())),
                Aria2Options {
                    submit_attempts: aria2.submit_attempts,
                    submit_delay: Duration::from_millis(aria2.submit_delay_ms),
                    poll_interval: Duration::from_millis(aria2.poll_interval_ms),
                },
            ))
        }
        DownloaderKind::Symlink => {
            let root = settings
                .mount_root
                .clone()
                .ok_or(DownloaderError::Configuration {
                    field: "downloader.mount_root",
                })?;
            Arc::new(SymlinkDownloader::new(root))
        }
        DownloaderKind::Strm => Arc::new(StrmDownloader),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_builds() -> anyhow::Result<()> {
        for kind in [
            DownloaderKind::Simple,
            DownloaderKind::Multipart,
            DownloaderKind::Aria2,
            DownloaderKind::Strm,
        ] {
            let settings = DownloaderSettings {
                kind,
                ..DownloaderSettings::default()
            };
            assert_eq!(build_downloader(&settings, Client::new())?.name(), kind.as_str());
        }
        Ok(())
    }

    #[test]
    fn symlink_requires_mount_root() {
        let settings = DownloaderSettings {
            kind: DownloaderKind::Symlink,
            ..DownloaderSettings::default()
        };
        assert!(build_downloader(&settings, Client::new()).is_err());
        let settings = DownloaderSettings {
            mount_root: Some("/mnt/debrid".into()),
            ..settings
        };
        assert!(build_downloader(&settings, Client::new()).is_ok());
    }
}
