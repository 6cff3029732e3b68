//! Structural validation for loaded configuration documents.

use regex::Regex;
use url::Url;

use crate::error::{ConfigError, ConfigResult};
use crate::model::{DownloaderKind, EngineConfig, JobDefaults};

fn positive(section: &'static str, field: &str, value: u64) -> ConfigResult<()> {
    if value == 0 {
        return Err(ConfigError::invalid(
            section,
            field,
            Some(value.to_string()),
            "must_be_positive",
        ));
    }
    Ok(())
}

fn positive_usize(section: &'static str, field: &str, value: usize) -> ConfigResult<()> {
    positive(section, field, u64::try_from(value).unwrap_or(u64::MAX))
}

fn http_url(section: &'static str, field: &str, value: &str) -> ConfigResult<()> {
    let invalid = |reason| ConfigError::invalid(section, field, Some(value.to_string()), reason);
    let url = Url::parse(value).map_err(|_| invalid("invalid_url"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("unsupported_scheme"));
    }
    Ok(())
}

/// Compile an optional file-path pattern.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidField`] when the expression does not compile.
pub fn compile_pattern(field: &str, pattern: Option<&str>) -> ConfigResult<Option<Regex>> {
    pattern
        .filter(|pattern| !pattern.trim().is_empty())
        .map(|pattern| {
            Regex::new(pattern).map_err(|_| {
                ConfigError::invalid("jobs", field, Some(pattern.to_string()), "invalid_regex")
            })
        })
        .transpose()
}

fn validate_job_defaults(jobs: &JobDefaults) -> ConfigResult<()> {
    compile_pattern("include_pattern", jobs.include_pattern.as_deref())?;
    compile_pattern("exclude_pattern", jobs.exclude_pattern.as_deref())?;
    if jobs.lifetime_minutes == Some(0) {
        return Err(ConfigError::invalid(
            "jobs",
            "lifetime_minutes",
            Some("0".into()),
            "must_be_positive",
        ));
    }
    Ok(())
}

/// Validate every section, returning the first violation.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidField`] naming the offending field.
pub fn validate(config: &EngineConfig) -> ConfigResult<()> {
    let orchestrator = &config.orchestrator;
    positive("orchestrator", "tick_interval_ms", orchestrator.tick_interval_ms)?;
    positive_usize("orchestrator", "max_parallel_jobs", orchestrator.max_parallel_jobs)?;
    positive_usize("orchestrator", "max_provider_calls", orchestrator.max_provider_calls)?;
    positive_usize(
        "orchestrator",
        "max_parallel_downloads",
        orchestrator.max_parallel_downloads,
    )?;
    positive_usize(
        "orchestrator",
        "max_downloads_per_job",
        orchestrator.max_downloads_per_job,
    )?;
    positive_usize("orchestrator", "max_workers", orchestrator.max_workers)?;
    for (category, limit) in &orchestrator.category_limits {
        positive_usize(
            "orchestrator",
            &format!("category_limits.{category}"),
            *limit,
        )?;
    }
    if orchestrator.download_root.as_os_str().is_empty() {
        return Err(ConfigError::invalid(
            "orchestrator",
            "download_root",
            None,
            "missing",
        ));
    }

    let provider = &config.provider;
    if provider.api_key.trim().is_empty() {
        return Err(ConfigError::invalid("provider", "api_key", None, "missing"));
    }
    if let Some(base_url) = &provider.base_url {
        http_url("provider", "base_url", base_url)?;
    }
    positive("provider", "timeout_secs", provider.timeout_secs)?;
    positive(
        "provider",
        "retry.max_attempts",
        u64::from(provider.retry.max_attempts),
    )?;
    if provider.retry.base_delay_ms > provider.retry.max_delay_ms {
        return Err(ConfigError::invalid(
            "provider",
            "retry.base_delay_ms",
            Some(provider.retry.base_delay_ms.to_string()),
            "exceeds_max_delay",
        ));
    }
    for (index, tier) in provider.rate_limits.iter().enumerate() {
        positive_usize(
            "provider",
            &format!("rate_limits[{index}].max_requests"),
            tier.max_requests,
        )?;
        positive(
            "provider",
            &format!("rate_limits[{index}].per_secs"),
            tier.per_secs,
        )?;
    }

    let downloader = &config.downloader;
    positive_usize("downloader", "part_count", downloader.part_count)?;
    positive_usize("downloader", "parallel_parts", downloader.parallel_parts)?;
    match downloader.kind {
        DownloaderKind::Aria2 => {
            http_url("downloader", "aria2.url", &downloader.aria2.url)?;
            positive(
                "downloader",
                "aria2.submit_attempts",
                u64::from(downloader.aria2.submit_attempts),
            )?;
            positive(
                "downloader",
                "aria2.poll_interval_ms",
                downloader.aria2.poll_interval_ms,
            )?;
        }
        DownloaderKind::Symlink if downloader.mount_root.is_none() => {
            return Err(ConfigError::invalid(
                "downloader",
                "mount_root",
                None,
                "required_for_symlink",
            ));
        }
        _ => {}
    }

    validate_job_defaults(&config.jobs)?;

    if config.logging.level.trim().is_empty() {
        return Err(ConfigError::invalid("logging", "level", None, "missing"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.provider.api_key = "token".into();
        config
    }

    fn field_of(err: ConfigError) -> String {
        match err {
            ConfigError::InvalidField { field, .. } => field,
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn defaults_with_credentials_are_valid() {
        assert!(validate(&valid()).is_ok());
    }

    #[test]
    fn missing_api_key_is_reported() {
        let err = validate(&EngineConfig::default()).unwrap_err();
        assert_eq!(field_of(err), "api_key");
    }

    #[test]
    fn zero_caps_are_rejected() {
        let mut config = valid();
        config.orchestrator.max_parallel_jobs = 0;
        assert_eq!(field_of(validate(&config).unwrap_err()), "max_parallel_jobs");

        let mut config = valid();
        config.orchestrator.category_limits.insert("tv".into(), 0);
        assert_eq!(
            field_of(validate(&config).unwrap_err()),
            "category_limits.tv"
        );
    }

    #[test]
    fn symlink_requires_mount_root() {
        let mut config = valid();
        config.downloader.kind = DownloaderKind::Symlink;
        assert_eq!(field_of(validate(&config).unwrap_err()), "mount_root");
    }

    #[test]
    fn bad_patterns_are_rejected() {
        let mut config = valid();
        config.jobs.include_pattern = Some("(unclosed".into());
        assert_eq!(field_of(validate(&config).unwrap_err()), "include_pattern");
        assert!(compile_pattern("exclude_pattern", Some("  ")).unwrap().is_none());
    }
}
