//! Resumable file transfers.
//!
//! A transfer in progress lives at `{path}.`[`PARTIAL_EXT`], and the length of that file is the
//! number of bytes received so far. Nothing else records progress: truncating or deleting the
//! partial file is a valid way to rewind a transfer. Once the transfer is complete, the partial
//! file is renamed to `path`.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, IntoUrl, Response, StatusCode};
use thiserror::Error;
use tokio::fs::{create_dir_all, rename, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::limiter::RateLimiter;

/// The extension marking a partial download.
pub const PARTIAL_EXT: &str = "parttmp";

/// An error of a single transfer. The partial file is never removed on error.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum DownloadError {
    /// Reading or writing the partial file failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The request failed, or was answered with an error status.
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    /// A `206` response started at another byte than the length of the partial file.
    #[error("The server resumed at byte {actual}, but {expected} bytes are already on disk")]
    RangeMismatch {
        /// The length of the partial file.
        expected: u64,
        /// The first byte of the response body.
        actual: u64,
    },
    /// The transfer ended before the size the server announced.
    #[error("The file is incomplete: expected {expected} bytes, got {actual}")]
    Incomplete {
        /// The size announced by the server.
        expected: u64,
        /// The size of the partial file.
        actual: u64,
    },
    /// A status which is neither an error nor a usable success, e.g. a redirect.
    #[error("Unexpected response status: {0}")]
    UnexpectedStatus(StatusCode),
}

/// Returns `true` if `path` carries the partial download extension.
#[inline]
pub fn is_partial(path: impl AsRef<Path>) -> bool {
    path.as_ref()
        .extension()
        .is_some_and(|extension| extension == PARTIAL_EXT)
}

/// The partial path of `path`: `path` with [`PARTIAL_EXT`] appended, unless already present.
///
/// e.g. `123.png` -> `123.png.parttmp`, `123.png.parttmp` -> `123.png.parttmp`.
pub fn partial_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if is_partial(path) {
        return path.to_path_buf();
    }
    let mut partial: OsString = path.as_os_str().to_owned();
    partial.push(".");
    partial.push(PARTIAL_EXT);
    partial.into()
}

/// The final path of `path`: `path` with [`PARTIAL_EXT`] stripped, if present.
///
/// e.g. `123.png.parttmp` -> `123.png`, `123.png` -> `123.png`.
pub fn final_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if is_partial(path) {
        path.with_extension("")
    } else {
        path.to_path_buf()
    }
}

/// A parsed `Content-Range` response header, e.g. `bytes 1000-1999/2000` or `bytes */2000`.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ContentRange {
    /// The first byte of the body, `None` for an unsatisfied range.
    pub(crate) start: Option<u64>,
    /// The complete length of the resource, `None` if unknown (`*`).
    pub(crate) total: Option<u64>,
}

impl ContentRange {
    pub(crate) fn parse(value: &str) -> Option<Self> {
        let (range, total) = value.trim().strip_prefix("bytes ")?.split_once('/')?;
        let total = match total.trim() {
            "*" => None,
            total => Some(total.parse().ok()?),
        };
        let start = match range.trim() {
            "*" => None,
            range => Some(range.split_once('-')?.0.parse().ok()?),
        };
        Some(Self { start, total })
    }

    fn of(response: &Response) -> Option<Self> {
        let value = response.headers().get(CONTENT_RANGE)?.to_str().ok()?;
        Self::parse(value)
    }
}

/// Downloads files with resumable, append-only transfers.
///
/// Usually, you get one from [`crate::api::ApiClient::downloader`],
/// so that the transfers share the rate limiter of the API calls.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: Client,
    limiter: RateLimiter,
}

impl Downloader {
    /// Create a downloader sending through `client`, paced by `limiter`.
    pub fn session(client: Client, limiter: RateLimiter) -> Self {
        Self { client, limiter }
    }

    /// Download `url` to `path`, resuming from `{path}.parttmp` if it exists.
    ///
    /// `path` may be given with or without the partial extension.
    /// Returns the final path, i.e. `path` without the partial extension.
    ///
    /// 1. Ensure the partial file exists, and measure its length `n`.
    /// 2. Request `bytes=n-` of `url`.
    /// 3. Append the body to the partial file.
    /// 4. Rename the partial file to its final name.
    ///
    /// If interrupted, the partial file holds exactly the bytes written so far,
    /// so calling this again with the same arguments resumes the transfer.
    ///
    /// # Errors
    ///
    /// - [`DownloadError::Reqwest`] if the server answers with a non-success status.
    /// - [`DownloadError::RangeMismatch`] if the server resumes at another byte than requested.
    /// - [`DownloadError::Incomplete`] if the server reported a size that the file does not have
    ///   after the transfer. The partial file is kept for a later resume.
    pub async fn download_to(
        &self,
        url: impl IntoUrl,
        path: impl AsRef<Path>,
    ) -> Result<PathBuf, DownloadError> {
        let partial = partial_path(&path);
        let finished = final_path(&partial);

        if let Some(parent) = partial.parent() {
            create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&partial)
            .await?;
        let offset = file.metadata().await?.len();

        tracing::debug!(path = %partial.display(), offset, "requesting file");
        let request = self
            .client
            .get(url)
            .header(RANGE, format!("bytes={offset}-"))
            .send();
        let mut response = self.limiter.send(request).await?;
        let content_range = ContentRange::of(&response);

        let expected = match response.status() {
            StatusCode::PARTIAL_CONTENT => {
                let start = content_range.as_ref().and_then(|range| range.start);
                if let Some(start) = start.filter(|&start| start != offset) {
                    return Err(DownloadError::RangeMismatch {
                        expected: offset,
                        actual: start,
                    });
                }
                content_range.and_then(|range| range.total)
            }
            StatusCode::RANGE_NOT_SATISFIABLE
                if content_range.as_ref().and_then(|range| range.total) == Some(offset) =>
            {
                // everything is on disk already, including an empty remote file
                drop(file);
                rename(&partial, &finished).await?;
                return Ok(finished);
            }
            status if status.is_success() => {
                if offset > 0 {
                    tracing::warn!(
                        path = %partial.display(),
                        offset,
                        "server ignored the range, restarting from the beginning"
                    );
                    file.set_len(0).await?;
                }
                response.content_length()
            }
            status => {
                response.error_for_status_ref()?;
                return Err(DownloadError::UnexpectedStatus(status));
            }
        };

        let mut file_buf = BufWriter::new(file);
        while let Some(mut chunk) = response.chunk().await? {
            file_buf.write_all_buf(&mut chunk).await?;
        }
        file_buf.flush().await?;

        let file = file_buf.into_inner();
        file.sync_all().await?;
        let actual = file.metadata().await?.len();
        drop(file);

        if let Some(expected) = expected {
            if actual != expected {
                return Err(DownloadError::Incomplete { expected, actual });
            }
        }

        rename(&partial, &finished).await?;
        Ok(finished)
    }
}
