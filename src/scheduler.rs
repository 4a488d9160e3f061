//! A core module to drive a whole run: repair, resolve, search, download.
//!
//! See [`Scheduler`] for more information.
//!
//! Following is the low-level module wrapped by this module:
//! - [`crate::api`]
//! - [`crate::download`]
//! - [`crate::resume`]
//! - [`crate::hash`]

use std::num::NonZeroU64;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use indicatif::{ProgressBar, ProgressFinish, ProgressStyle};

use crate::api::data::Post;
use crate::api::{ApiClient, ApiError, Credentials, SearchOutcome, SearchQuery, MAX_RESULTS};
use crate::download::Downloader;
use crate::hash::md5_matches;
use crate::resume::{ResumeError, ResumeScanner};

const PB_FINISH_MODE: ProgressFinish = ProgressFinish::Abandon;
const PB_TICK_SECS: u64 = 1;

/// How long to wait before retrying a rate limited search page.
pub const RATE_LIMITED_BACKOFF: Duration = Duration::from_secs(5);
/// How many times a rate limited search page is retried before giving up.
pub const MAX_RATE_LIMITED_RETRIES: u32 = 3;

/// The result of a single download task.
enum SingleDownloadResult {
    /// The file was downloaded successfully.
    Done,
    /// The file already existed.
    Existed,
}

/// current download number status
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DownloadStatus {
    /// the number of files that have been downloaded successfully
    pub done: u64,
    /// the number of files that already existed, which means no need to download
    pub existed: u64,
    /// the number of files that failed to download
    pub failed: u64,
}

/** The scheduler of a whole run against e621.

Everything runs one request at a time through the rate limiter of the [`ApiClient`]:

1. [`Self::repair`] finishes the downloads a previous run left behind.
2. [`Self::resolve`] turns the user tags into canonical tags.
3. [`Self::collect`] pages through the search results.
4. [`Self::launch`] downloads every post into the download directory.

    *If the file already exists with the same MD5, the download will be skipped.*

# Example
```no_run
use std::num::NonZeroU64;

use reqwest::Client;
use e621_dl::api::{ApiClient, Credentials, SearchQuery};
use e621_dl::scheduler::Scheduler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let api = ApiClient::new(Client::new());
    let credentials = Credentials::new("username", "api_key");

    let scheduler = Scheduler::build(api, "downloads", credentials).await?;
    scheduler.repair().await?;

    let tags = scheduler.resolve(&["cat", "-dog"]).await?;
    let query = SearchQuery::new(tags, 10, "2020-01-01");
    let posts = scheduler.collect(query, NonZeroU64::MIN).await?;

    let status = scheduler.launch(posts).await;
    println!("{status:?}");
    Ok(())
}
```
*/
pub struct Scheduler {
    api: ApiClient,
    downloader: Downloader,
    download_dir: PathBuf,
    credentials: Credentials,
}

impl Scheduler {
    /// Create a new scheduler.
    ///
    /// # Errors
    ///
    /// If the `download_dir` cannot be created, an error will be returned.
    pub async fn build(
        api: ApiClient,
        download_dir: impl Into<PathBuf>,
        credentials: Credentials,
    ) -> std::io::Result<Self> {
        let download_dir = download_dir.into();
        tokio::fs::create_dir_all(&download_dir).await?;
        Ok(Scheduler {
            downloader: api.downloader(),
            api,
            download_dir,
            credentials,
        })
    }

    /// Finish every interrupted download in the download directory.
    ///
    /// This should run before any new search, so that the disk is consistent.
    pub async fn repair(&self) -> Result<Vec<PathBuf>, ResumeError> {
        ResumeScanner::new(&self.api)
            .repair_all(&self.download_dir, &self.credentials)
            .await
    }

    /// Resolve every user tag and join them into one tag string.
    ///
    /// # Errors
    ///
    /// [`ApiError::UnknownTag`] if any tag is misspelled or does not exist.
    pub async fn resolve<S: AsRef<str>>(&self, user_tags: &[S]) -> Result<String, ApiError> {
        let tags = self.api.resolve_tags(user_tags, &self.credentials).await?;
        Ok(tags.join(" "))
    }

    /// Search one page, retrying after [`RATE_LIMITED_BACKOFF`] while it is rate limited.
    async fn search_page(&self, query: &SearchQuery) -> anyhow::Result<Vec<Post>> {
        let mut attempts = 0;
        loop {
            match self.api.search_posts(query, &self.credentials).await? {
                SearchOutcome::Posts(posts) => return Ok(posts),
                SearchOutcome::RateLimited if attempts < MAX_RATE_LIMITED_RETRIES => {
                    attempts += 1;
                    tracing::warn!(
                        attempts,
                        "Rate limited, retrying in {RATE_LIMITED_BACKOFF:?}"
                    );
                    tokio::time::sleep(RATE_LIMITED_BACKOFF).await;
                }
                SearchOutcome::RateLimited => {
                    anyhow::bail!("still rate limited after {attempts} retries")
                }
            }
        }
    }

    /// Page through the search results of `query`, newest first, for at most `max_pages` pages.
    ///
    /// Each page continues before the smallest post id of the previous one.
    /// Paging stops early at the first page that is not full.
    ///
    /// # Errors
    ///
    /// If a search fails, or stays rate limited, an error will be returned.
    pub async fn collect(
        &self,
        mut query: SearchQuery,
        max_pages: NonZeroU64,
    ) -> anyhow::Result<Vec<Post>> {
        let mut posts: Vec<Post> = Vec::new();
        for page in 0..max_pages.get() {
            let page_posts = self
                .search_page(&query)
                .await
                .with_context(|| format!("Failed to search page {page} of `{}`", query.tags))?;
            let page_len = page_posts.len();
            tracing::debug!(page, page_len, before_id = ?query.before_id, "search page");

            let Some(min_id) = page_posts.iter().map(|post| post.id).min() else {
                break;
            };
            posts.extend(page_posts);
            query.before_id = Some(min_id);

            if u64::try_from(page_len).map_or(true, |len| len < MAX_RESULTS) {
                break;
            }
        }
        Ok(posts)
    }

    /// Return the formated download status message
    #[inline]
    fn pb_msg(status: &DownloadStatus) -> String {
        let DownloadStatus {
            done,
            existed,
            failed,
        } = status;
        format!("[done:{done}\texisted:{existed}\tfailed:{failed}]")
    }

    /// Build a process bar with a specific length and custom style.
    #[inline]
    fn build_process_bar(len: u64) -> ProgressBar {
        // see: https://docs.rs/indicatif/latest/indicatif/#templates
        const PROCESS_CHARS: &str = "#>-";
        // `msg` for download status
        const TEMPLATE: &str =
            "[{elapsed_precise}] [{wide_bar:.cyan/blue}] {msg} {human_pos}/{human_len} ({eta})";

        // `TEMPLATE` is a constant, it always parses.
        let style = ProgressStyle::with_template(TEMPLATE)
            .expect("invalid progress bar template")
            .progress_chars(PROCESS_CHARS);

        ProgressBar::new(len)
            .with_style(style)
            .with_message(Self::pb_msg(&DownloadStatus::default()))
            .with_finish(PB_FINISH_MODE)
    }

    /// Download a single post, unless it already exists.
    ///
    /// A post already exists if its file does, with the same MD5 when the API reported one.
    async fn single_download(&self, post: &Post) -> anyhow::Result<SingleDownloadResult> {
        let filepath = self.download_dir.join(&post.filename);

        let existed = match &post.md5 {
            Some(md5) => md5_matches(&filepath, md5).await.with_context(|| {
                format!(
                    "Failed to check if file is already existed: {}",
                    filepath.display()
                )
            })?,
            None => tokio::fs::try_exists(&filepath).await.unwrap_or(false),
        };
        if existed {
            return Ok(SingleDownloadResult::Existed);
        }

        self.downloader
            .download_to(post.file_url.as_str(), &filepath)
            .await
            .with_context(|| format!("Failed to download: {}", filepath.display()))?;
        Ok(SingleDownloadResult::Done)
    }

    /// Download all posts to the download directory, one after another.
    /// A process bar will be displayed to show the download status.
    ///
    /// A failed download is reported and counted, and does not stop the others.
    /// Its partial file stays on disk, and [`Self::repair`] finishes it on the next run.
    pub async fn launch(&self, posts: impl IntoIterator<Item = Post>) -> DownloadStatus {
        let posts: Vec<Post> = posts.into_iter().collect();
        let process_bar = Self::build_process_bar(posts.len().try_into().unwrap_or(u64::MAX));
        process_bar.enable_steady_tick(Duration::from_secs(PB_TICK_SECS));

        let mut status = DownloadStatus::default();
        for post in &posts {
            match self.single_download(post).await {
                Ok(SingleDownloadResult::Done) => {
                    status.done += 1;
                }
                Ok(SingleDownloadResult::Existed) => {
                    status.existed += 1;
                }
                // why `suspend`: https://docs.rs/indicatif/0.17.8/indicatif/struct.ProgressBar.html#method.suspend
                // why `{:#}`: https://docs.rs/anyhow/1.0.86/anyhow/struct.Error.html#display-representations
                Err(err) => {
                    status.failed += 1;
                    process_bar.suspend(|| tracing::error!("{:#}", err));
                }
            }
            process_bar.set_message(Self::pb_msg(&status));
            process_bar.inc(1);
        }
        process_bar.finish();

        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::api::tests::{api_for, credentials, post_json};

    // md5 of `CONTENT`
    const MD5: &str = "9e107d9d372bb6826bd81d3542a419d6";
    const CONTENT: &str = "The quick brown fox jumps over the lazy dog";

    struct DefaultScheduler {
        inner: Scheduler,
        server: MockServer,
        temp_dir: TempDir,
    }

    impl DefaultScheduler {
        async fn new() -> Self {
            let server = MockServer::start().await;
            let temp_dir = TempDir::new().unwrap();
            let inner = Scheduler::build(api_for(&server), temp_dir.path(), credentials())
                .await
                .unwrap();
            Self {
                inner,
                server,
                temp_dir,
            }
        }

        fn post(&self, id: u64, md5: Option<&str>) -> Post {
            let mut post = post_json(id, &format!("{}/data/{id}.png", self.server.uri()));
            post["md5"] = json!(md5);
            serde_json::from_value(post).unwrap()
        }
    }

    #[tokio::test]
    async fn test_collect_pages() {
        let scheduler = DefaultScheduler::new().await;
        let full_page: Vec<_> = (0..MAX_RESULTS)
            .map(|i| post_json(10_000 - i, "https://example.com/a.png"))
            .collect();

        Mock::given(path("/post/index.json"))
            .and(body_string_contains("before_id=9681"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                post_json(9680, "https://example.com/b.png"),
            ])))
            .expect(1)
            .mount(&scheduler.server)
            .await;
        Mock::given(path("/post/index.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(full_page))
            .with_priority(10)
            .expect(1)
            .mount(&scheduler.server)
            .await;

        let query = SearchQuery::new("cats", 0, "2020-01-01");
        let posts = scheduler
            .inner
            .collect(query, NonZeroU64::new(5).unwrap())
            .await
            .unwrap();

        assert_eq!(posts.len(), usize::try_from(MAX_RESULTS).unwrap() + 1);
        assert_eq!(posts.last().unwrap().id, 9680);
    }

    #[tokio::test]
    async fn test_collect_stops_at_max_pages() {
        let scheduler = DefaultScheduler::new().await;
        let full_page: Vec<_> = (0..MAX_RESULTS)
            .map(|i| post_json(10_000 - i, "https://example.com/a.png"))
            .collect();
        Mock::given(path("/post/index.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(full_page))
            .expect(1)
            .mount(&scheduler.server)
            .await;

        let query = SearchQuery::new("cats", 0, "2020-01-01");
        let posts = scheduler
            .inner
            .collect(query, NonZeroU64::new(1).unwrap())
            .await
            .unwrap();
        assert_eq!(posts.len(), usize::try_from(MAX_RESULTS).unwrap());
    }

    #[tokio::test]
    async fn test_collect_empty() {
        let scheduler = DefaultScheduler::new().await;
        Mock::given(path("/post/index.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&scheduler.server)
            .await;

        let query = SearchQuery::new("cats", 0, "2020-01-01");
        let posts = scheduler
            .inner
            .collect(query, NonZeroU64::new(3).unwrap())
            .await
            .unwrap();
        assert!(posts.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_joins_tags() {
        let scheduler = DefaultScheduler::new().await;
        Mock::given(path("/tag/index.json"))
            .and(body_string_contains("name=cats"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{"id": 1, "name": "cats"}])),
            )
            .mount(&scheduler.server)
            .await;

        let tags = scheduler
            .inner
            .resolve(&["-cats", "rating:safe"])
            .await
            .unwrap();
        assert_eq!(tags, "-cats rating:safe");
    }

    #[tokio::test]
    async fn test_launch() {
        let scheduler = DefaultScheduler::new().await;
        let temp_dir_path = scheduler.temp_dir.path();
        std::fs::write(temp_dir_path.join("1.png"), CONTENT).unwrap();

        Mock::given(path("/data/2.png"))
            .respond_with(ResponseTemplate::new(200).set_body_string(CONTENT))
            .expect(1)
            .mount(&scheduler.server)
            .await;
        Mock::given(path("/data/3.png"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&scheduler.server)
            .await;

        let posts = [
            // already on disk with the same md5
            scheduler.post(1, Some(MD5)),
            scheduler.post(2, Some(MD5)),
            scheduler.post(3, None),
        ];
        let status = scheduler.inner.launch(posts).await;

        assert_eq!(
            status,
            DownloadStatus {
                done: 1,
                existed: 1,
                failed: 1,
            }
        );
        assert_eq!(
            std::fs::read_to_string(temp_dir_path.join("2.png")).unwrap(),
            CONTENT
        );
        assert!(temp_dir_path.join("3.png.parttmp").exists());
    }

    #[tokio::test]
    async fn test_repair_then_launch() {
        let scheduler = DefaultScheduler::new().await;
        let temp_dir_path = scheduler.temp_dir.path();
        std::fs::write(temp_dir_path.join("4.png.parttmp"), &CONTENT[..10]).unwrap();

        Mock::given(path("/post/show.json"))
            .and(body_string_contains("id=4"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(post_json(
                    4,
                    &format!("{}/data/4.png", scheduler.server.uri()),
                )),
            )
            .mount(&scheduler.server)
            .await;
        Mock::given(path("/data/4.png"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header(
                        "Content-Range",
                        format!("bytes 10-{}/{}", CONTENT.len() - 1, CONTENT.len()).as_str(),
                    )
                    .set_body_string(&CONTENT[10..]),
            )
            .expect(1)
            .mount(&scheduler.server)
            .await;

        let repaired = scheduler.inner.repair().await.unwrap();
        assert_eq!(repaired, [temp_dir_path.join("4.png")]);

        // now complete, with the md5 of `CONTENT`, so nothing is downloaded again
        let status = scheduler.inner.launch([scheduler.post(4, Some(MD5))]).await;
        assert_eq!(status.existed, 1);
    }
}
