//! Error taxonomy shared by provider clients, downloaders, and the orchestrator.
//!
//! # Design
//!
//! - Implementations classify failures; only the orchestrator decides between
//!   retry, deferral, and terminal error.
//! - Operation identifiers travel as context fields for log correlation.

use std::time::Duration;

use thiserror::Error;

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Primary error type for engine operations.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Provider quota exhausted; the caller must wait `retry_after`.
    #[error("provider rate limit reached")]
    RateLimited {
        /// Operation identifier.
        operation: &'static str,
        /// Delay requested by the provider or computed by the resilience layer.
        retry_after: Duration,
    },
    /// Provider rejected or failed the call.
    #[error("provider request failed: {detail}")]
    Provider {
        /// Operation identifier.
        operation: &'static str,
        /// Human-readable failure detail.
        detail: String,
    },
    /// A local transfer failed.
    #[error("transfer failed: {detail}")]
    Transfer {
        /// Human-readable failure detail.
        detail: String,
    },
    /// Required settings were missing or invalid.
    #[error("invalid configuration for {field}: {reason}")]
    Configuration {
        /// Offending setting.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },
    /// Remote resource vanished.
    #[error("{resource} not found")]
    NotFound {
        /// Kind of resource that was missing.
        resource: &'static str,
        /// Identifier that failed to resolve.
        id: String,
    },
    /// Caller supplied malformed input.
    #[error("invalid {field}: {reason}")]
    InvalidArgument {
        /// Field that failed validation.
        field: &'static str,
        /// Machine-readable reason.
        reason: &'static str,
        /// Offending value when available.
        value: Option<String>,
    },
    /// The provider does not implement the operation.
    #[error("{operation} is not supported by this provider")]
    Unsupported {
        /// Operation identifier.
        operation: &'static str,
    },
    /// Persistence collaborator failed.
    #[error("storage operation failed: {detail}")]
    Storage {
        /// Operation identifier.
        operation: &'static str,
        /// Human-readable failure detail.
        detail: String,
    },
    /// Process shutdown interrupted the operation.
    #[error("operation cancelled")]
    Cancelled {
        /// Operation identifier.
        operation: &'static str,
    },
}

impl EngineError {
    /// Build a provider failure.
    #[must_use]
    pub fn provider(operation: &'static str, detail: impl Into<String>) -> Self {
        Self::Provider {
            operation,
            detail: detail.into(),
        }
    }

    /// Build a transfer failure.
    #[must_use]
    pub fn transfer(detail: impl Into<String>) -> Self {
        Self::Transfer {
            detail: detail.into(),
        }
    }

    /// Build a storage failure.
    #[must_use]
    pub fn storage(operation: &'static str, detail: impl Into<String>) -> Self {
        Self::Storage {
            operation,
            detail: detail.into(),
        }
    }

    /// Build a not-found failure.
    #[must_use]
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    /// Whether the failure consumes a retry budget and may be retried automatically.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Provider { .. } | Self::Transfer { .. })
    }

    /// Delay carried by a rate-limit failure.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Whether the failure stems from shutdown.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_budget_rules() {
        assert!(EngineError::provider("add", "boom").is_retryable());
        assert!(EngineError::transfer("disk full").is_retryable());
        assert!(!EngineError::not_found("torrent", "abc").is_retryable());
        assert!(
            !EngineError::Configuration {
                field: "api_key",
                reason: "missing".into()
            }
            .is_retryable()
        );

        let limited = EngineError::RateLimited {
            operation: "add",
            retry_after: Duration::from_secs(3_600),
        };
        assert!(!limited.is_retryable());
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(3_600)));
        assert!(EngineError::Cancelled { operation: "poll" }.is_cancelled());
    }

    #[test]
    fn messages_are_human_readable() {
        assert_eq!(
            EngineError::provider("add", "magnet rejected").to_string(),
            "provider request failed: magnet rejected"
        );
        assert_eq!(
            EngineError::Unsupported {
                operation: "add_nzb_link"
            }
            .to_string(),
            "add_nzb_link is not supported by this provider"
        );
    }
}
