//! Single-document downloader with constant-delay retry.
//!
//! Each attempt streams the whole response body into the destination file.
//! A failed attempt leaves nothing behind: the destination is truncated when
//! an attempt starts and removed when it fails, so a later attempt never
//! resumes from a partial file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::{Client, StatusCode};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};
use url::Url;

use aipbinder_shared::{AipBinderError, FetchConfig, Result};

/// User-Agent string for download requests.
const USER_AGENT: &str = concat!("aipbinder/", env!("CARGO_PKG_VERSION"));

/// Maximum number of redirects followed per attempt.
const MAX_REDIRECTS: usize = 5;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a single download attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    /// Connecting, sending, or a timeout before the response arrived.
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("HTTP {0}")]
    Status(StatusCode),

    /// The response body stream broke off.
    #[error("body read failed: {0}")]
    Body(#[source] reqwest::Error),

    /// The destination file could not be created or written.
    #[error("write to {path:?} failed: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A download that failed on every permitted attempt.
#[derive(Debug, thiserror::Error)]
#[error("{location}: gave up after {attempts} attempt(s): {last_cause}")]
pub struct FetchError {
    /// The location that could not be retrieved.
    pub location: Url,
    /// Attempts performed (always the policy's `max_attempts`).
    pub attempts: u32,
    /// The error of the final attempt.
    #[source]
    pub last_cause: AttemptError,
}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

/// Attempt count and constant delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl From<&FetchConfig> for RetryPolicy {
    fn from(config: &FetchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            retry_delay: config.retry_delay,
        }
    }
}

/// Outcome of a successful download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchReport {
    /// Attempts it took, including the successful one.
    pub attempts: u32,
    /// Bytes written to the destination.
    pub bytes: u64,
}

/// HTTP downloader bound to one retry policy.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
    policy: RetryPolicy,
}

impl Fetcher {
    /// Build a fetcher from runtime configuration.
    pub fn new(config: &FetchConfig) -> Result<Self> {
        config.validate()?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .connect_timeout(config.connect_timeout)
            .timeout(config.timeout)
            .build()
            .map_err(|e| AipBinderError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            policy: RetryPolicy::from(config),
        })
    }

    /// The retry policy this fetcher applies.
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Download `location` into `destination`, retrying on any failure.
    ///
    /// `on_failure` is invoked with the attempt number and cause after every
    /// failed attempt, including the last one.
    #[instrument(skip_all, fields(location = %location))]
    pub async fn fetch<F>(
        &self,
        location: &Url,
        destination: &Path,
        mut on_failure: F,
    ) -> std::result::Result<FetchReport, FetchError>
    where
        F: FnMut(u32, &AttemptError),
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.attempt(location, destination).await {
                Ok(bytes) => {
                    if attempt > 1 {
                        info!(attempts = attempt, bytes, "download succeeded after retry");
                    } else {
                        debug!(bytes, "download complete");
                    }
                    return Ok(FetchReport {
                        attempts: attempt,
                        bytes,
                    });
                }
                Err(cause) => {
                    discard_partial(destination).await;

                    warn!(
                        attempt,
                        max_attempts,
                        error = %cause,
                        "download attempt failed"
                    );
                    on_failure(attempt, &cause);

                    if attempt >= max_attempts {
                        return Err(FetchError {
                            location: location.clone(),
                            attempts: attempt,
                            last_cause: cause,
                        });
                    }

                    attempt += 1;
                    if !self.policy.retry_delay.is_zero() {
                        tokio::time::sleep(self.policy.retry_delay).await;
                    }
                }
            }
        }
    }

    /// One full download-to-destination attempt. Returns bytes written.
    async fn attempt(
        &self,
        location: &Url,
        destination: &Path,
    ) -> std::result::Result<u64, AttemptError> {
        let mut response = self
            .client
            .get(location.clone())
            .send()
            .await
            .map_err(AttemptError::Request)?;

        let status = response.status();
        if !status.is_success() {
            return Err(AttemptError::Status(status));
        }

        let write_err = |source: std::io::Error| AttemptError::Write {
            path: destination.to_path_buf(),
            source,
        };

        let mut file = File::create(destination).await.map_err(write_err)?;
        let mut written: u64 = 0;

        while let Some(chunk) = response.chunk().await.map_err(AttemptError::Body)? {
            file.write_all(&chunk).await.map_err(write_err)?;
            written += chunk.len() as u64;
        }

        file.flush().await.map_err(write_err)?;

        Ok(written)
    }
}

/// Remove whatever a failed attempt left at `destination`.
async fn discard_partial(destination: &Path) {
    match tokio::fs::remove_file(destination).await {
        Ok(()) => debug!(path = %destination.display(), "discarded partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %destination.display(), error = %e, "could not discard partial download"),
    }
}
