//! A core module for interacting with the e621 API.
//!
//! Usually, you prefer to use [`ApiClient`] to search for [`data::Post`]s
//! and to resolve tags with [`ApiClient::resolve_tag_alias`].
//!
//! Every request goes through one shared [`RateLimiter`].

use std::fmt;
use std::path::PathBuf;

use reqwest::{Client, Response, Url};
use serde::Deserialize;
use thiserror::Error;

use crate::download::Downloader;
use crate::limiter::RateLimiter;

mod tag;

/// The URLs for the e621 API.
pub mod url {
    /// The base URL of e621.
    pub const BASE_URL: &str = "https://e621.net/";

    /// Search posts by tags, see [`super::ApiClient::search_posts`].
    pub const POST_INDEX: &str = "post/index.json";
    /// Show a single post by id.
    pub const POST_SHOW: &str = "post/show.json";
    /// Look up tags by name.
    pub const TAG_INDEX: &str = "tag/index.json";
    /// Show a single tag by id.
    pub const TAG_SHOW: &str = "tag/show.json";
    /// Look up tag aliases by their source name.
    pub const TAG_ALIAS_INDEX: &str = "tag_alias/index.json";
}

/// The maximum number of posts the API returns per page.
pub const MAX_RESULTS: u64 = 320;

/// The login used for every API call.
///
/// This is forwarded as is; no validation or storage happens here.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    /// The e621 username.
    pub username: String,
    /// The API key (password hash) of the user.
    pub password_hash: String,
}

impl Credentials {
    /// Create credentials from a username and an API key.
    pub fn new(username: impl Into<String>, password_hash: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password_hash: password_hash.into(),
        }
    }

    #[inline]
    fn form(&self) -> [(&'static str, &str); 2] {
        [
            ("login", &self.username),
            ("password_hash", &self.password_hash),
        ]
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password_hash", &"[REDACTED]")
            .finish()
    }
}

/// The parameters of one search page.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    /// Space separated tags, usually already resolved by [`ApiClient::resolve_tags`].
    pub tags: String,
    /// Only posts with at least this score are returned.
    pub min_score: i64,
    /// Only posts uploaded on or after this date (`YYYY-MM-DD`) are returned.
    pub earliest_date: String,
    /// Only posts with an id lower than this are returned.
    /// `None` starts from the newest post.
    pub before_id: Option<u64>,
}

impl SearchQuery {
    /// Create a query for the first page.
    pub fn new(tags: impl Into<String>, min_score: i64, earliest_date: impl Into<String>) -> Self {
        Self {
            tags: tags.into(),
            min_score,
            earliest_date: earliest_date.into(),
            before_id: None,
        }
    }

    /// The filter expression sent to the API.
    ///
    /// e.g. `score:>=10 date:>=2020-01-01 cat -dog`
    pub fn filter(&self) -> String {
        format!(
            "score:>={} date:>={} {}",
            self.min_score, self.earliest_date, self.tags
        )
    }
}

/// The upload time as returned by the API.
#[derive(Deserialize)]
pub(crate) struct CreatedAt {
    /// unix seconds
    pub(crate) s: i64,
}

/// This struct is used to auto initialize the `filename` field for the `Post` struct.
#[derive(Deserialize)]
pub(crate) struct PostInner {
    pub(crate) id: u64,
    pub(crate) score: i64,
    pub(crate) created_at: CreatedAt,
    pub(crate) file_url: String,
    #[serde(default)]
    pub(crate) file_ext: Option<String>,
    #[serde(default)]
    pub(crate) md5: Option<String>,
}

impl From<PostInner> for data::Post {
    /// `filename` equals to `id` with the extension of the file.
    /// e.g. `id = 12345`, `file_url = ".../d3/4f/abcdef.png"`, then `filename = "12345.png"`.
    fn from(value: PostInner) -> Self {
        use crate::tool::SetFileStem;

        let mut filename = match value.file_ext.as_deref() {
            Some(ext) if !ext.is_empty() => PathBuf::from(format!("_.{ext}")),
            _ => {
                // make sure only the last path segment without query is retained
                let path = value.file_url.split(['?', '#']).next().unwrap_or_default();
                PathBuf::from(path.rsplit('/').next().unwrap_or_default())
            }
        };
        filename.set_file_stem(value.id.to_string());

        Self {
            id: value.id,
            score: value.score,
            date: value.created_at.s,
            file_url: value.file_url,
            md5: value.md5,
            filename,
        }
    }
}

/// The data structures of the JSON responses from the e621 API.
pub mod data {
    use super::*;

    /// A post, which is one uploaded file and its metadata.
    #[non_exhaustive]
    #[derive(Debug, Clone, Deserialize)]
    #[serde(from = "PostInner")]
    pub struct Post {
        /// The ID of the post.
        pub id: u64,
        /// The score of the post.
        pub score: i64,
        /// The upload time of the post, in unix seconds.
        pub date: i64,
        /// The URL of the file, which can be used to download it.
        pub file_url: String,
        /// The MD5 hash of the file, if the API reported one.
        pub md5: Option<String>,
        /// The local filename: `id` with the extension of the file.
        /// The leading `.`-delimited segment is always the post id.
        pub filename: PathBuf,
    }

    /// A tag of the remote tag index.
    #[non_exhaustive]
    #[derive(Debug, Clone, Deserialize)]
    pub struct Tag {
        /// The ID of the tag.
        #[serde(default)]
        pub id: Option<u64>,
        /// The canonical name of the tag.
        pub name: String,
    }

    /// An approved alias from a deprecated tag name to a canonical tag.
    #[non_exhaustive]
    #[derive(Debug, Clone, Deserialize)]
    pub struct TagAlias {
        /// The deprecated (source) name.
        pub name: String,
        /// The ID of the canonical (target) tag.
        pub alias_id: u64,
    }
}

/// The result of one search page.
#[derive(Debug)]
pub enum SearchOutcome {
    /// The posts of this page, possibly empty.
    Posts(Vec<data::Post>),
    /// The API answered `403 Forbidden`.
    ///
    /// This is a signal to back off and retry the same page later, not a failure.
    RateLimited,
}

/// An error from the e621 API.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ApiError {
    /// The request failed, the API answered with a non-success status,
    /// or the response could not be decoded.
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    /// The tag has no exact match and no approved alias.
    #[error("The tag `{0}` is spelled incorrectly or does not exist")]
    UnknownTag(String),
}

/// The client for the e621 API.
///
/// It owns the transport and the [`RateLimiter`]; every call, including the file downloads of
/// [`Self::downloader`], is paced by that one limiter.
///
/// # Example
///
/// ```no_run
/// use reqwest::Client;
/// use e621_dl::api::{ApiClient, Credentials, SearchOutcome, SearchQuery};
///
/// #[tokio::main]
/// async fn main() -> Result<(), e621_dl::api::ApiError> {
///     let api = ApiClient::new(Client::new());
///     let credentials = Credentials::new("username", "api_key");
///
///     let tag = api.resolve_tag_alias("~cat", &credentials).await?;
///     let query = SearchQuery::new(tag, 10, "2020-01-01");
///
///     match api.search_posts(&query, &credentials).await? {
///         SearchOutcome::Posts(posts) => println!("found {} posts", posts.len()),
///         SearchOutcome::RateLimited => println!("try again later"),
///     }
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    limiter: RateLimiter,
    base_url: Url,
}

impl ApiClient {
    /// Create a client for <https://e621.net/>.
    pub fn new(client: Client) -> Self {
        // `BASE_URL` is a constant, it always parses.
        let base_url = Url::parse(url::BASE_URL).expect("invalid `BASE_URL`");
        Self::with_base_url(client, base_url)
    }

    /// Create a client for another host with the same API, e.g. a mirror or a mock server.
    pub fn with_base_url(client: Client, base_url: Url) -> Self {
        Self {
            client,
            limiter: RateLimiter::new(),
            base_url,
        }
    }

    /// Replace the rate limiter, e.g. with a slower one.
    pub fn with_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// The rate limiter shared by every request of this client.
    #[inline]
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// A [`Downloader`] that shares the transport and the rate limiter of this client.
    #[inline]
    pub fn downloader(&self) -> Downloader {
        Downloader::session(self.client.clone(), self.limiter.clone())
    }

    /// Send a paced `POST` with a form payload to `endpoint`.
    ///
    /// The status is not checked here.
    async fn post_form(&self, endpoint: &str, form: &[(&str, &str)]) -> Result<Response, ApiError> {
        // `endpoint` is always one of the relative paths of [`url`].
        let url = self
            .base_url
            .join(endpoint)
            .expect("endpoint must be a relative path");
        let request = self.client.post(url).form(form).send();
        Ok(self.limiter.send(request).await?)
    }

    /// Search one page of posts.
    ///
    /// # Errors
    ///
    /// `403 Forbidden` is not an error, it is returned as [`SearchOutcome::RateLimited`].
    /// Any other non-success status is returned as [`ApiError::Http`].
    pub async fn search_posts(
        &self,
        query: &SearchQuery,
        credentials: &Credentials,
    ) -> Result<SearchOutcome, ApiError> {
        let limit = MAX_RESULTS.to_string();
        let filter = query.filter();
        let before_id = query.before_id.map(|id| id.to_string());

        let mut form = Vec::from(credentials.form());
        form.push(("limit", limit.as_str()));
        if let Some(before_id) = &before_id {
            form.push(("before_id", before_id.as_str()));
        }
        form.push(("tags", filter.as_str()));

        let response = self.post_form(url::POST_INDEX, &form).await?;
        if response.status() == reqwest::StatusCode::FORBIDDEN {
            tracing::warn!(tags = %filter, "search was rate limited");
            return Ok(SearchOutcome::RateLimited);
        }
        let posts = response.error_for_status()?.json().await?;
        Ok(SearchOutcome::Posts(posts))
    }

    /// Look up a single post, usually to recover the `file_url` of an interrupted download.
    ///
    /// # Errors
    ///
    /// Any non-success status is returned as [`ApiError::Http`].
    pub async fn get_post_by_id(
        &self,
        id: u64,
        credentials: &Credentials,
    ) -> Result<data::Post, ApiError> {
        let id = id.to_string();
        let mut form = Vec::from(credentials.form());
        form.push(("id", id.as_str()));

        let response = self.post_form(url::POST_SHOW, &form).await?;
        Ok(response.error_for_status()?.json().await?)
    }
}
