//! # Design
//!
//! - Centralize bootstrap errors for the binary.
//! - Keep error messages constant while carrying context fields for debugging.
//! - Engine failures inside the running orchestrator never surface here; they
//!   are folded into job state instead.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias for application operations.
pub type AppResult<T> = Result<T, AppError>;

/// Application-level error type.
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration loading failed.
    #[error("configuration operation failed")]
    Config {
        /// Operation identifier.
        operation: &'static str,
        /// Source configuration error.
        source: torrelay_config::ConfigError,
    },
    /// Telemetry setup failed.
    #[error("telemetry operation failed")]
    Telemetry {
        /// Operation identifier.
        operation: &'static str,
        /// Source telemetry error.
        source: torrelay_telemetry::TelemetryError,
    },
    /// Engine component construction or hydration failed.
    #[error("engine operation failed")]
    Engine {
        /// Operation identifier.
        operation: &'static str,
        /// Source engine error.
        source: torrelay_core::EngineError,
    },
    /// Downloader construction failed.
    #[error("downloader operation failed")]
    Downloader {
        /// Operation identifier.
        operation: &'static str,
        /// Source downloader error.
        source: torrelay_downloaders::DownloaderError,
    },
    /// HTTP client construction failed.
    #[error("http client operation failed")]
    Http {
        /// Operation identifier.
        operation: &'static str,
        /// Source HTTP client error.
        source: reqwest::Error,
    },
    /// IO operations failed.
    #[error("io operation failed")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// Optional path involved in the failure.
        path: Option<PathBuf>,
        /// Source IO error.
        source: io::Error,
    },
}

impl AppError {
    pub(crate) const fn config(
        operation: &'static str,
        source: torrelay_config::ConfigError,
    ) -> Self {
        Self::Config { operation, source }
    }

    pub(crate) const fn telemetry(
        operation: &'static str,
        source: torrelay_telemetry::TelemetryError,
    ) -> Self {
        Self::Telemetry { operation, source }
    }

    pub(crate) const fn engine(operation: &'static str, source: torrelay_core::EngineError) -> Self {
        Self::Engine { operation, source }
    }

    pub(crate) const fn downloader(
        operation: &'static str,
        source: torrelay_downloaders::DownloaderError,
    ) -> Self {
        Self::Downloader { operation, source }
    }

    pub(crate) const fn http(operation: &'static str, source: reqwest::Error) -> Self {
        Self::Http { operation, source }
    }

    pub(crate) const fn io(operation: &'static str, path: Option<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path,
            source,
        }
    }
}
