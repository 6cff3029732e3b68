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

//! Transfer backends implementing [`torrelay_core::Downloader`].

pub mod aria2;
pub mod error;
mod factory;
pub mod multipart;
pub mod simple;
pub mod strm;
pub mod symlink;

pub use aria2::{Aria2Downloader, Aria2Options, Aria2Rpc, Aria2Status, HttpAria2Rpc, gid_for};
pub use error::{DownloaderError, DownloaderResult};
pub use factory::build_downloader;
pub use multipart::{MultipartDownloader, MultipartOptions};
pub use simple::SimpleDownloader;
pub use strm::StrmDownloader;
pub use symlink::SymlinkDownloader;
