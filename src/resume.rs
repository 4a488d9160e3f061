//! Finish the transfers that a previous run left behind.
//!
//! See [`ResumeScanner`].

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::read_dir;

use crate::api::{ApiClient, ApiError, Credentials};
use crate::download::{is_partial, DownloadError, Downloader};

/// Why [`ResumeScanner::repair_all`] stopped.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ResumeError {
    /// A directory could not be read.
    #[error("Failed to scan {}: {source}", path.display())]
    Io {
        /// The directory or entry being read.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },
    /// The post of a partial download could not be looked up.
    #[error("Failed to look up post {id}: {source}")]
    Api {
        /// The post id taken from the filename.
        id: u64,
        /// The underlying error.
        source: ApiError,
    },
    /// The transfer of a partial download failed; the partial file is kept.
    #[error("Failed to resume {}: {source}", path.display())]
    Download {
        /// The partial file.
        path: PathBuf,
        /// The underlying error.
        source: DownloadError,
    },
}

/// The post id of a download, which is the leading `.`-delimited segment of its filename.
///
/// e.g. `123.png.parttmp` -> `Some(123)`, `cover.png.parttmp` -> `None`.
pub fn post_id(path: impl AsRef<Path>) -> Option<u64> {
    let filename = path.as_ref().file_name()?.to_str()?;
    filename.split('.').next()?.parse().ok()
}

/// Collect every partial download under `root`, recursively, in sorted order.
///
/// A missing `root` has no partial downloads.
async fn scan(root: &Path) -> Result<Vec<PathBuf>, ResumeError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ResumeError::Io { path, source }
    };

    let mut partials = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = match read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound && dir == root => break,
            Err(err) => return Err(io_err(&dir)(err)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(io_err(&dir))? {
            let path = entry.path();
            let file_type = entry.file_type().await.map_err(io_err(&path))?;
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() && is_partial(&path) {
                partials.push(path);
            }
        }
    }
    partials.sort();
    Ok(partials)
}

/// Discovers interrupted downloads on disk and finishes them.
///
/// A download is interrupted if its file still carries the partial extension
/// (see [`crate::download`]). The post id is recovered from the filename, the current
/// `file_url` from the API, and the transfer resumes from the bytes already on disk.
///
/// # Example
///
/// ```no_run
/// use reqwest::Client;
/// use e621_dl::api::{ApiClient, Credentials};
/// use e621_dl::resume::ResumeScanner;
///
/// #[tokio::main]
/// async fn main() -> Result<(), e621_dl::resume::ResumeError> {
///     let api = ApiClient::new(Client::new());
///     let credentials = Credentials::new("username", "api_key");
///
///     let repaired = ResumeScanner::new(&api)
///         .repair_all("downloads", &credentials)
///         .await?;
///     println!("finished {} interrupted downloads", repaired.len());
///     Ok(())
/// }
/// ```
pub struct ResumeScanner<'a> {
    api: &'a ApiClient,
    downloader: Downloader,
}

impl ResumeScanner<'_> {
    /// Create a scanner whose transfers share the rate limiter of `api`.
    pub fn new(api: &ApiClient) -> ResumeScanner<'_> {
        ResumeScanner {
            api,
            downloader: api.downloader(),
        }
    }

    /// Walk `root` recursively and finish every partial download, one after another.
    ///
    /// Returns the final paths of the finished downloads.
    /// A directory with only complete files causes no request at all.
    ///
    /// Partial files whose name does not start with a post id are skipped.
    ///
    /// # Errors
    ///
    /// Stops at the first failure. Safe to call again: finished downloads are not repeated,
    /// and the failed one resumes where it stopped.
    pub async fn repair_all(
        &self,
        root: impl AsRef<Path>,
        credentials: &Credentials,
    ) -> Result<Vec<PathBuf>, ResumeError> {
        let partials = scan(root.as_ref()).await?;

        let mut repaired = Vec::with_capacity(partials.len());
        for path in partials {
            let Some(id) = post_id(&path) else {
                tracing::warn!(
                    "Skipping partial download without a post id: {}",
                    path.display()
                );
                continue;
            };
            tracing::info!(
                "Partial download found: {}. Finishing download.",
                path.display()
            );

            let post = self
                .api
                .get_post_by_id(id, credentials)
                .await
                .map_err(|source| ResumeError::Api { id, source })?;
            let finished = self
                .downloader
                .download_to(post.file_url.as_str(), &path)
                .await
                .map_err(|source| ResumeError::Download {
                    path: path.clone(),
                    source,
                })?;
            repaired.push(finished);
        }
        Ok(repaired)
    }
}
