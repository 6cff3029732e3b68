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

//! Resilience layer for calls to quota-limited, unreliable providers.
//!
//! Limiters are built once per provider tier and injected into every client
//! of that provider; `ResilientClient` combines them with a retry policy
//! around `reqwest`.

mod client;
pub mod error;
mod limiter;
mod retry;

pub use client::ResilientClient;
pub use error::{ResilienceError, ResilienceResult};
pub use limiter::{LimiterSet, SlidingWindowLimiter};
pub use retry::{RetryPolicy, is_transient_status, parse_retry_after};
