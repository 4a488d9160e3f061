#![warn(missing_docs)]

//! <div class="warning">
//!
//! Note: API is unstable, and may change in `0.x` versions.
//!
//! </div>
//!
//! A client for the [e621](https://e621.net) API, which searches posts by tags and downloads
//! their files with crash-safe resumable transfers.
//!
//! e621 enforces a hard limit of two requests per second. Every request of this crate goes
//! through one [`limiter::RateLimiter`], so no two requests start less than 500ms apart.
//!
//! # As a library
//!
//! As a library, usually you prefer to use [`scheduler`] and [`api`]
//! to resolve tags, search posts and download their files.
//!
//! See [`scheduler::Scheduler#example`] for example.
//!
//! The lower level pieces are usable on their own:
//! - [`api::ApiClient`] for the remote calls, including tag alias resolution.
//! - [`download::Downloader`] for a single resumable transfer.
//! - [`resume::ResumeScanner`] to finish the transfers an earlier run left behind.
//!
//! # As a binary
//!
//! In addition to the above, you also need [`cli`] to build the command line.
//!
//! See `main.rs` to know how to assemble these modules as a binary.

#[cfg(not(any(
    feature = "default-tls",
    feature = "native-tls",
    feature = "native-tls-vendored",
    feature = "native-tls-alpn",
    feature = "rustls-tls",
    feature = "rustls-tls-manual-roots",
    feature = "rustls-tls-webpki-roots",
    feature = "rustls-tls-native-roots",
)))]
compile_error!("at least one `tls` feature must be enabled, because e621 is only served over https");

pub mod api;
#[cfg(feature = "cli")]
pub mod cli;
pub mod limiter;
pub mod resume;
pub mod scheduler;

pub mod config;
pub mod download;
pub mod hash;
pub mod tool;
