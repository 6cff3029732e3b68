use std::io::Write;
use std::path::PathBuf;

use torrelay_config::{ConfigError, DownloaderKind, ENV_PROVIDER_API_KEY, EngineConfig, ProviderKind};
use torrelay_core::DownloadAction;

#[test]
fn loads_file_then_env_then_validates() -> anyhow::Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    writeln!(
        file,
        "provider:\n  kind: premiumize\norchestrator:\n  min_free_space_bytes: 1024\njobs:\n  download_action: manual\n  include_pattern: '\\.mkv$'"
    )?;

    let config = EngineConfig::load_with(Some(file.path()), |name| {
        (name == ENV_PROVIDER_API_KEY).then(|| "env-token".to_string())
    })?;

    assert_eq!(config.provider.kind, ProviderKind::Premiumize);
    assert_eq!(config.provider.api_key, "env-token");
    assert_eq!(config.orchestrator.min_free_space_bytes, 1_024);
    assert_eq!(config.downloader.kind, DownloaderKind::Simple);

    let policy = config.jobs.policy();
    assert_eq!(policy.download_action, DownloadAction::Manual);
    assert_eq!(policy.include_pattern.as_deref(), Some("\\.mkv$"));
    Ok(())
}

#[test]
fn missing_file_is_an_io_error() {
    let path = PathBuf::from("/nonexistent/torrelay.yaml");
    let err = EngineConfig::load_with(Some(&path), |_| None).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::Io {
            operation: "config.read",
            ..
        }
    ));
}

#[test]
fn no_file_and_no_key_fails_validation() {
    let err = EngineConfig::load_with(None, |_| None).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidField { section: "provider", .. }));
}
