#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(
    missing_docs,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery
)]
#![allow(clippy::module_name_repetitions)]

//! Provider-agnostic job model and collaborator contracts for Torrelay.
//!
//! Nothing in this crate performs I/O on its own: provider clients,
//! downloaders, stores, and probes implement the traits declared here and are
//! injected into the orchestrator.

pub mod error;
pub mod model;
pub mod service;
pub mod status;
pub mod transfer;

pub use error::{EngineError, EngineResult};
pub use model::{
    Download, DownloadAction, DownloadInfo, DownloadStatus, FinishedAction, Job, JobKind,
    JobPolicy, JobSource, MagnetLink, ProviderFile, ProviderStatus, ProviderTorrent, SubmitJob,
};
pub use service::{Clock, DebridClient, DiskSpaceProbe, JobStore, SystemClock, validate_link};
pub use status::{StatusMatcher, StatusRule, StatusTable};
pub use torrelay_events::JobState;
pub use transfer::{
    DownloadHandle, DownloadRequest, Downloader, ProgressSnapshot, TransferFailure,
    TransferOutcome, TransferProgress, TransferSuccess,
};
