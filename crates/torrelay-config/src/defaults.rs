//! Default values applied when a configuration field is omitted.
//!
//! # Design
//! - Centralize defaults so serde, docs, and tests agree.
//! - Keep time-based defaults in their natural unit for readability.

pub(crate) const TICK_INTERVAL_MS: u64 = 1_000;
pub(crate) const MAX_PARALLEL_JOBS: usize = 5;
pub(crate) const MAX_PROVIDER_CALLS: usize = 4;
pub(crate) const MAX_PARALLEL_DOWNLOADS: usize = 4;
pub(crate) const MAX_DOWNLOADS_PER_JOB: usize = 2;
pub(crate) const MAX_WORKERS: usize = 8;
pub(crate) const JOB_RETRY_DELAY_SECS: u64 = 60;
pub(crate) const DOWNLOAD_ROOT: &str = "downloads";

pub(crate) const PROVIDER_TIMEOUT_SECS: u64 = 30;
pub(crate) const RETRY_MAX_ATTEMPTS: u32 = 3;
pub(crate) const RETRY_BASE_DELAY_MS: u64 = 500;
pub(crate) const RETRY_MAX_DELAY_MS: u64 = 30_000;
pub(crate) const RATE_QUEUE_LIMIT: usize = 64;
pub(crate) const USER_AGENT: &str = concat!("torrelay/", env!("CARGO_PKG_VERSION"));

pub(crate) const PART_COUNT: usize = 4;
pub(crate) const PARALLEL_PARTS: usize = 4;
pub(crate) const PART_RETRIES: u32 = 3;
pub(crate) const MIN_PART_SIZE_BYTES: u64 = 8 * 1024 * 1024;

pub(crate) const ARIA2_URL: &str = "http://127.0.0.1:6800/jsonrpc";
pub(crate) const ARIA2_SUBMIT_ATTEMPTS: u32 = 5;
pub(crate) const ARIA2_SUBMIT_DELAY_MS: u64 = 1_000;
pub(crate) const ARIA2_POLL_INTERVAL_MS: u64 = 1_000;

pub(crate) const LOG_LEVEL: &str = "info";
