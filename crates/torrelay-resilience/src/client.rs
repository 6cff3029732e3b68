//! Rate-limited, retried HTTP execution.
//!
//! # Design
//! - Every attempt first takes a slot from each limiter tier.
//! - Transient failures back off with full jitter; a `Retry-After` hint wins
//!   over the computed delay. Hints on other statuses are ignored and the
//!   status is returned as is.
//! - A hint longer than the policy ceiling is not slept on in-call; the caller
//!   gets `RateLimited` and defers the work instead.
//! - Cancellation is observed while waiting, sending, and backing off.

use std::time::Duration;

use chrono::Utc;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ResilienceError, ResilienceResult};
use crate::limiter::LimiterSet;
use crate::retry::{RetryPolicy, is_transient_status, parse_retry_after};

const MAX_ERROR_BODY: usize = 512;

/// Failure of one attempt, kept until the retry decision is made.
enum AttemptFailure {
    Status {
        status: StatusCode,
        retry_after: Option<Duration>,
    },
    Network(String),
}

/// HTTP client wrapper applying rate limits and retries.
#[derive(Debug, Clone)]
pub struct ResilientClient {
    http: Client,
    limiters: LimiterSet,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl ResilientClient {
    /// Wrap a configured `reqwest` client.
    #[must_use]
    pub const fn new(
        http: Client,
        limiters: LimiterSet,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            http,
            limiters,
            retry,
            cancel,
        }
    }

    /// Underlying client.
    #[must_use]
    pub const fn http(&self) -> &Client {
        &self.http
    }

    /// Retry policy in force.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Send the request produced by `build`, retrying transient failures.
    ///
    /// `build` is invoked once per attempt, so request bodies are rebuilt.
    ///
    /// # Errors
    ///
    /// - [`ResilienceError::RateLimited`] when a rate condition outlasts the
    ///   retries or asks for a wait longer than the policy ceiling.
    /// - [`ResilienceError::QueueFull`] when a local limiter rejects the call.
    /// - [`ResilienceError::Transient`] when ordinary transient failures persist.
    /// - [`ResilienceError::Status`] for non-retryable HTTP statuses.
    /// - [`ResilienceError::Transport`] when the request cannot be built.
    /// - [`ResilienceError::Cancelled`] on shutdown.
    pub async fn execute<F>(&self, operation: &'static str, build: F) -> ResilienceResult<Response>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.limiters.acquire(operation, &self.cancel).await?;

            let sent = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(ResilienceError::Cancelled { operation }),
                sent = build(&self.http).send() => sent,
            };

            let failure = match sent {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    if !is_transient_status(status) {
                        let body = read_body(response).await;
                        return Err(ResilienceError::Status {
                            operation,
                            status: status.as_u16(),
                            body,
                        });
                    }
                    let retry_after = response
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|value| value.to_str().ok())
                        .and_then(|value| parse_retry_after(value, Utc::now()));
                    AttemptFailure::Status {
                        status,
                        retry_after,
                    }
                }
                Err(err) if err.is_builder() => {
                    return Err(ResilienceError::Transport {
                        operation,
                        detail: err.to_string(),
                    });
                }
                Err(err) => AttemptFailure::Network(err.to_string()),
            };

            let retry_after = match &failure {
                AttemptFailure::Status { retry_after, .. } => *retry_after,
                AttemptFailure::Network(_) => None,
            };
            let hint_too_long = retry_after.is_some_and(|hint| hint > self.retry.max_delay);
            if attempt >= max_attempts || hint_too_long {
                return Err(exhausted(operation, attempt, failure, &self.retry));
            }

            let delay = self.retry.delay_for(attempt, retry_after);
            debug!(
                operation,
                attempt,
                delay_ms = delay.as_millis(),
                "retrying transient provider failure"
            );
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(ResilienceError::Cancelled { operation }),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn exhausted(
    operation: &'static str,
    attempts: u32,
    failure: AttemptFailure,
    policy: &RetryPolicy,
) -> ResilienceError {
    match failure {
        AttemptFailure::Status {
            status,
            retry_after,
        } if status == StatusCode::TOO_MANY_REQUESTS || retry_after.is_some() => {
            let retry_after = retry_after.unwrap_or_else(|| policy.backoff_ceiling(attempts));
            warn!(operation, attempts, retry_after_secs = retry_after.as_secs(), "provider rate limit reached");
            ResilienceError::RateLimited {
                operation,
                retry_after,
            }
        }
        AttemptFailure::Status { status, .. } => ResilienceError::Transient {
            operation,
            attempts,
            detail: format!("HTTP {status}"),
        },
        AttemptFailure::Network(detail) => ResilienceError::Transient {
            operation,
            attempts,
            detail,
        },
    }
}

async fn read_body(response: Response) -> String {
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}
