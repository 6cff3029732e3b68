#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(missing_docs, unreachable_pub, clippy::all, clippy::pedantic, clippy::nursery)]

//! Binary entrypoint that wires the provider, downloader, and store together
//! and drives the orchestrator until interrupted.

use torrelay_app::{AppResult, run_app};

/// Bootstraps the engine and blocks until shutdown.
#[tokio::main]
async fn main() -> AppResult<()> {
    run_app().await
}
