#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(missing_docs, unreachable_pub, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

//! Torrelay engine wiring: the job orchestrator plus its local collaborators.
//!
//! Layout: `bootstrap.rs` (service wiring), `orchestrator.rs` (job state
//! machine), `selection.rs` (automatic file selection), `store.rs` (job
//! persistence), `disk.rs` (free-space probe).

/// Application bootstrap and environment loading.
pub mod bootstrap;
/// Free-space probing.
pub mod disk;
/// Error types for bootstrap wiring.
pub mod error;
/// Tick-driven job state machine.
pub mod orchestrator;
/// Automatic file selection.
pub mod selection;
/// Job persistence backends.
pub mod store;

pub use bootstrap::run_app;
pub use disk::SysinfoDiskProbe;
pub use error::{AppError, AppResult};
pub use orchestrator::{DeleteOptions, Orchestrator, OrchestratorDeps};
pub use store::{JsonJobStore, MemoryJobStore};
