//! Shared HTTP plumbing for vendor clients.
//!
//! # Design
//! - Every vendor call goes through [`ResilientClient`], so rate limits and
//!   retries apply uniformly.
//! - Transport outcomes are classified into [`EngineError`] here; vendor
//!   modules only translate envelope-level errors.

use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use torrelay_core::{EngineError, EngineResult};
use torrelay_resilience::{ResilienceError, ResilientClient};
use tracing::debug;

/// How a vendor expects the API token.
#[derive(Debug, Clone)]
pub(crate) enum Auth {
    /// `Authorization: Bearer <token>`.
    Bearer(String),
    /// Token passed as a query parameter.
    Query {
        /// Parameter name.
        name: &'static str,
        /// Token value.
        value: String,
    },
}

/// Vendor endpoint bound to a resilient client and credentials.
#[derive(Debug, Clone)]
pub(crate) struct VendorHttp {
    client: ResilientClient,
    base_url: String,
    auth: Auth,
}

impl VendorHttp {
    pub(crate) fn new(client: ResilientClient, base_url: &str, auth: Auth) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
        }
    }

    /// Absolute URL for an API path.
    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Auth::Bearer(token) => builder.bearer_auth(token),
            Auth::Query { name, value } => builder.query(&[(*name, value.as_str())]),
        }
    }

    /// Send an authorized request built fresh for every attempt.
    pub(crate) async fn send<F>(&self, operation: &'static str, build: F) -> EngineResult<Response>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        debug!(operation, "provider request");
        self.client
            .execute(operation, |http| self.authorize(build(http)))
            .await
            .map_err(|err| classify(operation, err))
    }

    /// Send and decode a JSON body.
    pub(crate) async fn json<T, F>(&self, operation: &'static str, build: F) -> EngineResult<T>
    where
        T: DeserializeOwned,
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let response = self.send(operation, build).await?;
        response
            .json::<T>()
            .await
            .map_err(|err| EngineError::provider(operation, format!("malformed response: {err}")))
    }
}

/// Map a resilience failure onto the engine taxonomy.
pub(crate) fn classify(operation: &'static str, err: ResilienceError) -> EngineError {
    match err {
        ResilienceError::RateLimited { retry_after, .. }
        | ResilienceError::QueueFull { retry_after, .. } => EngineError::RateLimited {
            operation,
            retry_after,
        },
        ResilienceError::Status {
            status: 404, body, ..
        } => EngineError::NotFound {
            resource: "provider entry",
            id: body,
        },
        ResilienceError::Status {
            status: status @ (401 | 403),
            ..
        } => EngineError::Configuration {
            field: "provider.api_key",
            reason: format!("{operation} rejected the credentials (HTTP {status})"),
        },
        ResilienceError::Status {
            status: 400 | 422,
            body,
            ..
        } => EngineError::InvalidArgument {
            field: operation,
            reason: "rejected by provider",
            value: Some(body),
        },
        ResilienceError::Cancelled { .. } => EngineError::Cancelled { operation },
        other => EngineError::provider(operation, other.to_string()),
    }
}

/// Replace the identifier of a not-found error with the provider entry id.
pub(crate) fn entry_not_found(id: &str) -> impl FnOnce(EngineError) -> EngineError + '_ {
    move |err| match err {
        EngineError::NotFound { .. } => EngineError::not_found("provider entry", id),
        other => other,
    }
}

/// Provider identifier of a job, or an argument error when it was never submitted.
pub(crate) fn provider_id(job: &torrelay_core::Job) -> EngineResult<&str> {
    job.provider_id
        .as_deref()
        .ok_or(EngineError::InvalidArgument {
            field: "provider_id",
            reason: "job has not been submitted",
            value: None,
        })
}
