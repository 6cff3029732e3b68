//! Construction of the configured vendor client.

use std::sync::Arc;

use torrelay_config::{ProviderKind, ProviderSettings};
use torrelay_core::{DebridClient, EngineError, EngineResult};
use torrelay_resilience::{LimiterSet, ResilientClient, RetryPolicy, SlidingWindowLimiter};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::alldebrid::{ALL_DEBRID_BASE_URL, AllDebridClient};
use crate::premiumize::{PREMIUMIZE_BASE_URL, PremiumizeClient};
use crate::realdebrid::{REAL_DEBRID_BASE_URL, RealDebridClient};
use crate::torbox::{TORBOX_BASE_URL, TorBoxClient};

/// Default API root of a vendor.
#[must_use]
pub const fn default_base_url(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::RealDebrid => REAL_DEBRID_BASE_URL,
        ProviderKind::AllDebrid => ALL_DEBRID_BASE_URL,
        ProviderKind::Premiumize => PREMIUMIZE_BASE_URL,
        ProviderKind::TorBox => TORBOX_BASE_URL,
    }
}

/// Limiters for the provider's tiers. Built once and shared by every client.
#[must_use]
pub fn limiters(settings: &ProviderSettings) -> LimiterSet {
    LimiterSet::new(
        settings
            .effective_rate_tiers()
            .into_iter()
            .map(|tier| {
                Arc::new(SlidingWindowLimiter::new(
                    format!("{}:{}", settings.kind.as_str(), tier.name),
                    tier.max_requests,
                    tier.window(),
                    tier.queue_limit,
                ))
            })
            .collect(),
    )
}

/// Retry policy derived from settings.
#[must_use]
pub const fn retry_policy(settings: &ProviderSettings) -> RetryPolicy {
    RetryPolicy {
        max_attempts: settings.retry.max_attempts,
        base_delay: std::time::Duration::from_millis(settings.retry.base_delay_ms),
        max_delay: std::time::Duration::from_millis(settings.retry.max_delay_ms),
    }
}

/// Resilient HTTP client carrying the configured timeout and user agent.
///
/// # Errors
///
/// Returns [`EngineError::Configuration`] when the HTTP client cannot be built.
pub fn resilient_client(
    settings: &ProviderSettings,
    limiters: LimiterSet,
    cancel: CancellationToken,
) -> EngineResult<ResilientClient> {
    let http = reqwest::Client::builder()
        .timeout(settings.timeout())
        .user_agent(settings.user_agent.clone())
        .build()
        .map_err(|err| EngineError::Configuration {
            field: "provider",
            reason: format!("failed to build HTTP client: {err}"),
        })?;
    Ok(ResilientClient::new(
        http,
        limiters,
        retry_policy(settings),
        cancel,
    ))
}

/// Build the vendor client selected by `settings`.
///
/// # Errors
///
/// Returns [`EngineError::Configuration`] for a missing API key or an
/// unusable HTTP client.
pub fn build_client(
    settings: &ProviderSettings,
    cancel: CancellationToken,
) -> EngineResult<Arc<dyn DebridClient>> {
    if settings.api_key.trim().is_empty() {
        return Err(EngineError::Configuration {
            field: "provider.api_key",
            reason: "missing".into(),
        });
    }
    let base_url = settings
        .base_url
        .as_deref()
        .unwrap_or_else(|| default_base_url(settings.kind));
    let client = resilient_client(settings, limiters(settings), cancel)?;
    info!(provider = settings.kind.as_str(), base_url, "debrid client ready");
    let api_key = settings.api_key.as_str();
    Ok(match settings.kind {
        ProviderKind::RealDebrid => Arc::new(RealDebridClient::new(client, base_url, api_key)),
        ProviderKind::AllDebrid => Arc::new(AllDebridClient::new(client, base_url, api_key)),
        ProviderKind::Premiumize => Arc::new(PremiumizeClient::new(client, base_url, api_key)),
        ProviderKind::TorBox => Arc::new(TorBoxClient::new(client, base_url, api_key)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_each_vendor_with_its_tiers() -> anyhow::Result<()> {
        for kind in [
            ProviderKind::RealDebrid,
            ProviderKind::AllDebrid,
            ProviderKind::Premiumize,
            ProviderKind::TorBox,
        ] {
            let settings = ProviderSettings {
                kind,
                api_key: "token".into(),
                ..ProviderSettings::default()
            };
            let client = build_client(&settings, CancellationToken::new())?;
            assert_eq!(client.provider_name(), kind.as_str());
            assert_eq!(
                limiters(&settings).tiers().len(),
                kind.default_rate_tiers().len()
            );
        }
        Ok(())
    }

    #[test]
    fn missing_key_is_a_configuration_error() {
        let err = build_client(&ProviderSettings::default(), CancellationToken::new())
            .err()
            .map(|err| err.to_string());
        assert_eq!(
            err.as_deref(),
            Some("invalid configuration for provider.api_key: missing")
        );
    }
}
