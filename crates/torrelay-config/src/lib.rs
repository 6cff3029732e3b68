#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(
    missing_docs,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery
)]

//! File-backed configuration for the Torrelay engine.
//!
//! Layout: `model.rs` (typed sections), `defaults.rs` (fallback values),
//! `loader.rs` (YAML + environment layering), `validate.rs` (field checks).

mod defaults;
pub mod error;
pub mod loader;
pub mod model;
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ENV_CONFIG_PATH, ENV_DOWNLOAD_ROOT, ENV_LOG_LEVEL, ENV_PROVIDER_API_KEY};
pub use model::{
    Aria2Settings, DownloaderKind, DownloaderSettings, EngineConfig, JobDefaults,
    LogFormatSetting, LoggingSettings, OrchestratorSettings, ProviderKind, ProviderSettings,
    RateTier, RetrySettings,
};
pub use validate::{compile_pattern, validate};
