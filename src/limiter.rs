//! Pacing for every outbound request to e621.
//!
//! e621 has a hard rate limit of two requests per second, and hitting it repeatedly
//! gets the client blocked. See [`RateLimiter`].

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

/// The minimum spacing between the start of two requests.
pub const MIN_INTERVAL: Duration = Duration::from_millis(500);

/// Enforces a minimum spacing between the requests sent through it.
///
/// [`Self::send`] measures how long the request took; if it returned faster than the interval,
/// the remaining time is slept before control goes back to the caller. The gate is held for the
/// request *and* the residual sleep, so two requests through the same limiter never start
/// less than the interval apart, even when clones are used from several tasks.
///
/// Cloning is cheap, and all clones share the same gate.
///
/// # Example
///
/// ```no_run
/// use e621_dl::limiter::RateLimiter;
///
/// #[tokio::main]
/// async fn main() -> reqwest::Result<()> {
///     let client = reqwest::Client::new();
///     let limiter = RateLimiter::new();
///
///     let first = limiter.send(client.get("https://e621.net").send()).await?;
///     // at least 500ms after `first` was sent
///     let second = limiter.send(client.get("https://e621.net").send()).await?;
///
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct RateLimiter {
    gate: Arc<Mutex<()>>,
    interval: Duration,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    /// Create a limiter paced at [`MIN_INTERVAL`].
    pub fn new() -> Self {
        Self::with_interval(MIN_INTERVAL)
    }

    /// Create a limiter paced at `interval`.
    ///
    /// A slower pace is allowed, a faster one is not:
    /// anything below [`MIN_INTERVAL`] is raised to [`MIN_INTERVAL`].
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            gate: Arc::new(Mutex::new(())),
            interval: interval.max(MIN_INTERVAL),
        }
    }

    /// The effective spacing of this limiter.
    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Drive `request` to completion, then wait out the rest of the interval.
    ///
    /// The output of `request` is returned unchanged; the limiter never retries,
    /// cancels, or alters a request, it only paces.
    pub async fn send<F>(&self, request: F) -> F::Output
    where
        F: IntoFuture,
    {
        let _permit = self.gate.lock().await;

        let start = Instant::now();
        let output = request.await;
        let elapsed = start.elapsed();

        if let Some(remaining) = self.interval.checked_sub(elapsed) {
            tracing::debug!(?remaining, "pacing request");
            sleep(remaining).await;
        }
        output
    }
}
