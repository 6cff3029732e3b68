//! Error types surfaced by the resilience layer.

use std::time::Duration;

use thiserror::Error;

/// Result alias for resilient calls.
pub type ResilienceResult<T> = Result<T, ResilienceError>;

/// Failure of a rate-limited, retried outbound call.
#[derive(Debug, Clone, Error)]
pub enum ResilienceError {
    /// The remote quota is exhausted; the caller should wait `retry_after`.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Operation identifier.
        operation: &'static str,
        /// Delay requested by the remote or derived from backoff.
        retry_after: Duration,
    },
    /// Too many callers are already waiting on a local limiter.
    #[error("rate limiter queue for {limiter} is full")]
    QueueFull {
        /// Limiter tier name.
        limiter: String,
        /// Wait the caller would have needed.
        retry_after: Duration,
    },
    /// Transient failures persisted through every attempt.
    #[error("{operation} failed after {attempts} attempts: {detail}")]
    Transient {
        /// Operation identifier.
        operation: &'static str,
        /// Attempts made.
        attempts: u32,
        /// Last failure detail.
        detail: String,
    },
    /// The remote answered with a non-retryable status.
    #[error("{operation} returned HTTP {status}")]
    Status {
        /// Operation identifier.
        operation: &'static str,
        /// HTTP status code.
        status: u16,
        /// Response body (possibly truncated).
        body: String,
    },
    /// The request could not be built or sent and retrying cannot help.
    #[error("{operation} transport error: {detail}")]
    Transport {
        /// Operation identifier.
        operation: &'static str,
        /// Failure detail.
        detail: String,
    },
    /// Shutdown interrupted the call.
    #[error("{operation} cancelled")]
    Cancelled {
        /// Operation identifier.
        operation: &'static str,
    },
}

impl ResilienceError {
    /// Delay hint for rate conditions (remote or local).
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } | Self::QueueFull { retry_after, .. } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }
}
