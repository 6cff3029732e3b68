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

//! Debrid vendor clients implementing [`torrelay_core::DebridClient`].
//!
//! Each vendor module owns its wire types and status table; shared transport
//! concerns (auth, rate limits, retries, error classification) live in one
//! place.

pub mod alldebrid;
mod factory;
mod http;
pub mod premiumize;
pub mod realdebrid;
pub mod torbox;

pub use alldebrid::{ALL_DEBRID_STATUS, AllDebridClient};
pub use factory::{build_client, default_base_url, limiters, resilient_client, retry_policy};
pub use premiumize::{PREMIUMIZE_STATUS, PremiumizeClient};
pub use realdebrid::{REAL_DEBRID_STATUS, RealDebridClient};
pub use torbox::{TORBOX_STATUS, TorBoxClient};
