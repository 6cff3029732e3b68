//! YAML loading with environment overrides.
//!
//! # Design
//! - Layering order: built-in defaults, then the YAML document, then
//!   environment variables, then validation.
//! - Environment lookup is injected so tests never touch process state.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{ConfigError, ConfigResult};
use crate::model::EngineConfig;
use crate::validate::validate;

/// Overrides `provider.api_key`.
pub const ENV_PROVIDER_API_KEY: &str = "TORRELAY_PROVIDER_API_KEY";
/// Overrides `orchestrator.download_root`.
pub const ENV_DOWNLOAD_ROOT: &str = "TORRELAY_DOWNLOAD_ROOT";
/// Overrides `logging.level`.
pub const ENV_LOG_LEVEL: &str = "TORRELAY_LOG_LEVEL";
/// Names the configuration file when no path is passed explicitly.
pub const ENV_CONFIG_PATH: &str = "TORRELAY_CONFIG";

impl EngineConfig {
    /// Decode a YAML document without validating it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the document is malformed.
    pub fn from_yaml_str(document: &str) -> ConfigResult<Self> {
        if document.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(document).map_err(|source| ConfigError::Parse { source })
    }

    /// Apply environment overrides using `lookup` to resolve variables.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        if let Some(api_key) = non_empty(ENV_PROVIDER_API_KEY) {
            debug!(variable = ENV_PROVIDER_API_KEY, "provider api key overridden");
            self.provider.api_key = api_key.trim().to_string();
        }
        if let Some(root) = non_empty(ENV_DOWNLOAD_ROOT) {
            debug!(variable = ENV_DOWNLOAD_ROOT, root = %root, "download root overridden");
            self.orchestrator.download_root = PathBuf::from(root);
        }
        if let Some(level) = non_empty(ENV_LOG_LEVEL) {
            self.logging.level = level.trim().to_string();
        }
    }

    /// Load a configuration: defaults, optional YAML file, overrides, validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when the file cannot be read,
    /// [`ConfigError::Parse`] when it is malformed, and
    /// [`ConfigError::InvalidField`] when validation fails.
    pub fn load_with<F>(path: Option<&Path>, lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match path {
            Some(path) => {
                let document =
                    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                        operation: "config.read",
                        path: path.to_path_buf(),
                        source,
                    })?;
                info!(path = %path.display(), "loading configuration");
                Self::from_yaml_str(&document)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(lookup);
        validate(&config)?;
        Ok(config)
    }

    /// Load using the process environment; `TORRELAY_CONFIG` names the file
    /// when `path` is `None`.
    ///
    /// # Errors
    ///
    /// See [`EngineConfig::load_with`].
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let from_env = std::env::var(ENV_CONFIG_PATH).ok().map(PathBuf::from);
        let path = path.map(Path::to_path_buf).or(from_env);
        Self::load_with(path.as_deref(), |name| std::env::var(name).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DownloaderKind, ProviderKind};

    #[test]
    fn yaml_sections_override_defaults() -> anyhow::Result<()> {
        let config = EngineConfig::from_yaml_str(
            r"
orchestrator:
  max_parallel_jobs: 3
  category_limits:
    movies: 1
provider:
  kind: torbox
  api_key: secret
downloader:
  kind: aria2
",
        )?;
        assert_eq!(config.orchestrator.max_parallel_jobs, 3);
        assert_eq!(config.orchestrator.category_limits.get("movies"), Some(&1));
        assert_eq!(config.orchestrator.tick_interval_ms, 1_000);
        assert_eq!(config.provider.kind, ProviderKind::TorBox);
        assert_eq!(config.downloader.kind, DownloaderKind::Aria2);
        Ok(())
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let err = EngineConfig::from_yaml_str("orchestrator: [1, 2").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn environment_wins_over_document() -> anyhow::Result<()> {
        let mut config = EngineConfig::from_yaml_str("provider:\n  api_key: from-file\n")?;
        config.apply_env_overrides(|name| match name {
            ENV_PROVIDER_API_KEY => Some("from-env".into()),
            ENV_LOG_LEVEL => Some("debug".into()),
            ENV_DOWNLOAD_ROOT => Some("   ".into()),
            _ => None,
        });
        assert_eq!(config.provider.api_key, "from-env");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.orchestrator.download_root, PathBuf::from("downloads"));
        Ok(())
    }
}
