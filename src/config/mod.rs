//! The configuration of a run, read from TOML.

use std::num::NonZeroU64;
use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use serde::Deserialize;
use validator::ValidationError;
pub use validator::Validate;

use crate::api::Credentials;

/// The template written to the editor when no config file is given.
pub const DEFAULT_CONFIG_STR: &str = include_str!("default.toml");

/// The settings of one run.
#[non_exhaustive]
#[derive(Debug, Deserialize, Clone, Validate)]
pub struct Config {
    /// Sent with every API call.
    pub credentials: Credentials,
    /// The user tags, resolved before searching.
    #[validate(
        length(min = 1, message = "tags must not be empty"),
        custom(function = "validate_tags")
    )]
    pub tags: Vec<String>,
    /// Only posts scored at least this much are searched.
    pub min_score: i64,
    /// Only posts created on or after this day (`YYYY-MM-DD`) are searched.
    #[validate(custom(function = "validate_date"))]
    pub earliest_date: String,
    /// Where the posts are downloaded, and where partial downloads are looked for.
    pub download_dir: PathBuf,
    /// Request timeout in seconds, `0` means no timeout.
    pub timeout: u64,
    /// The maximum number of search pages.
    pub max_pages: NonZeroU64,
    /// The least time between two requests, raised to 500ms if lower.
    #[serde(default = "default_request_interval_ms")]
    pub request_interval_ms: u64,
}

impl Config {
    /// [`Config::request_interval_ms`] as a [`Duration`].
    #[inline]
    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_interval_ms)
    }
}

#[inline]
fn default_request_interval_ms() -> u64 {
    500
}

fn validate_tags(tags: &[String]) -> Result<(), ValidationError> {
    if tags.iter().any(|tag| tag.trim().is_empty() || tag.contains(char::is_whitespace)) {
        return Err(ValidationError::new("tags")
            .with_message("each tag must be a single non-empty word".into()));
    }
    Ok(())
}

/// `YYYY-MM-DD`, and an actual calendar day.
fn validate_date(date: &str) -> Result<(), ValidationError> {
    // chrono also takes unpadded fields, e.g. `2020-1-31`
    let valid =
        date.len() == "YYYY-MM-DD".len() && NaiveDate::parse_from_str(date, "%Y-%m-%d").is_ok();
    if !valid {
        return Err(ValidationError::new("earliest_date")
            .with_message("earliest_date must be a valid date formatted as YYYY-MM-DD".into()));
    }
    Ok(())
}
