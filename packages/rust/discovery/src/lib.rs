//! AIP section discovery for a single aerodrome.
//!
//! The published AIP has one menu page that links every section PDF. Given
//! an ICAO location indicator, we fetch that page, pick out the links whose
//! path contains the aerodrome's directory, and turn them into
//! [`RetrievalTarget`]s in the order the menu lists them.

mod parser;

use std::time::Duration;

use aipbinder_shared::{AipBinderError, Result, RetrievalTarget, SourceConfig};
use reqwest::Client;
use tracing::{debug, info, instrument, warn};
use url::Url;

pub use parser::MenuLink;

/// Maximum number of redirects to follow when fetching the menu.
const MAX_REDIRECTS: usize = 5;

/// Maximum menu page size we accept (10 MB).
const MAX_RESPONSE_SIZE: u64 = 10 * 1024 * 1024;

/// User-Agent string for discovery requests.
const USER_AGENT: &str = concat!("aipbinder/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Discovery options
// ---------------------------------------------------------------------------

/// Configuration for the discovery process.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// AIP menu page to scan.
    pub index_url: Url,
    /// Timeout for the menu request in seconds.
    pub timeout_secs: u64,
}

impl DiscoveryOptions {
    /// Build options from the `[source]` config section.
    pub fn from_config(source: &SourceConfig) -> Result<Self> {
        let index_url = Url::parse(&source.index_url).map_err(|e| {
            AipBinderError::config(format!("invalid index_url {:?}: {e}", source.index_url))
        })?;
        Ok(Self {
            index_url,
            timeout_secs: source.timeout_secs,
        })
    }
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

/// Find every AIP section PDF published for `icao`.
///
/// Returns the sections in menu order. An aerodrome with no published
/// sections yields an empty list, not an error.
#[instrument(skip_all, fields(icao = %icao))]
pub async fn discover(icao: &str, opts: &DiscoveryOptions) -> Result<Vec<RetrievalTarget>> {
    let icao = normalize_icao(icao)?;

    info!(index_url = %opts.index_url, "fetching AIP menu");

    let client = build_client(opts)?;
    let html = fetch_menu(&client, &opts.index_url).await?;

    let mut targets = Vec::new();
    for link in parser::extract_links(&html, &icao)? {
        match opts.index_url.join(&link.href) {
            Ok(location) => targets.push(RetrievalTarget::new(location, link.label)),
            Err(e) => warn!(href = %link.href, error = %e, "skipping unresolvable link"),
        }
    }

    info!(found = targets.len(), "AIP sections discovered");
    Ok(targets)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Validate an ICAO location indicator and return it uppercased.
pub fn normalize_icao(icao: &str) -> Result<String> {
    let trimmed = icao.trim();
    if trimmed.len() != 4 || !trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(AipBinderError::validation(format!(
            "ICAO code must be 4 letters, got {icao:?}"
        )));
    }
    Ok(trimmed.to_ascii_uppercase())
}

/// Build a reqwest client with appropriate settings.
fn build_client(opts: &DiscoveryOptions) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .timeout(Duration::from_secs(opts.timeout_secs))
        .build()
        .map_err(|e| AipBinderError::Network(format!("failed to build HTTP client: {e}")))
}

/// Fetch the menu page body as text.
async fn fetch_menu(client: &Client, url: &Url) -> Result<String> {
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| AipBinderError::Network(format!("{url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(AipBinderError::Network(format!("{url}: HTTP {status}")));
    }

    if let Some(len) = response.content_length() {
        if len > MAX_RESPONSE_SIZE {
            return Err(AipBinderError::validation(format!(
                "{url}: response too large ({len} bytes, max {MAX_RESPONSE_SIZE})"
            )));
        }
    }

    let body = response
        .text()
        .await
        .map_err(|e| AipBinderError::Network(format!("{url}: failed to read body: {e}")))?;

    debug!(bytes = body.len(), "menu fetched");
    Ok(body)
}
