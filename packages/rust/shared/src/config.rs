//! Application configuration for aipbinder.
//!
//! User config lives at `~/.aipbinder/aipbinder.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AipBinderError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "aipbinder.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".aipbinder";

/// Default AIP menu page listing every published section.
pub const DEFAULT_INDEX_URL: &str = "http://www.caica.ru/ANI_Official/Aip/html/menurus.htm";

// ---------------------------------------------------------------------------
// Config structs (matching aipbinder.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Download and retry policy.
    #[serde(default)]
    pub fetch: FetchSection,

    /// Where section links are discovered.
    #[serde(default)]
    pub source: SourceConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Directory merged PDFs are written to.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Root directory for per-run staging areas. Empty means the system temp dir.
    #[serde(default)]
    pub staging_dir: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            staging_dir: String::new(),
        }
    }
}

fn default_output_dir() -> String {
    ".".into()
}

/// `[fetch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchSection {
    /// Attempts per document before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Constant delay between attempts, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Whole-request timeout per attempt, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Connect timeout per attempt, in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Documents downloaded at once. 1 keeps the run strictly sequential.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_max_attempts() -> u32 {
    10
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_connect_timeout_secs() -> u64 {
    15
}
fn default_concurrency() -> usize {
    1
}

/// `[source]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// AIP menu page scanned for section links.
    #[serde(default = "default_index_url")]
    pub index_url: String,

    /// Timeout for the menu page request, in seconds.
    #[serde(default = "default_discovery_timeout")]
    pub timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            index_url: default_index_url(),
            timeout_secs: default_discovery_timeout(),
        }
    }
}

fn default_index_url() -> String {
    DEFAULT_INDEX_URL.into()
}
fn default_discovery_timeout() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Fetch config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime fetch configuration, merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Attempts per document; must be at least 1.
    pub max_attempts: u32,
    /// Constant delay between consecutive attempts.
    pub retry_delay: Duration,
    /// Whole-request timeout per attempt.
    pub timeout: Duration,
    /// Connect timeout per attempt.
    pub connect_timeout: Duration,
    /// Maximum documents in flight; must be at least 1.
    pub concurrency: usize,
}

impl FetchConfig {
    /// Reject settings the fetcher cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(AipBinderError::config("max_attempts must be at least 1"));
        }
        if self.concurrency == 0 {
            return Err(AipBinderError::config("concurrency must be at least 1"));
        }
        Ok(())
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for FetchConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.fetch.max_attempts,
            retry_delay: Duration::from_millis(config.fetch.retry_delay_ms),
            timeout: Duration::from_secs(config.fetch.timeout_secs),
            connect_timeout: Duration::from_secs(config.fetch.connect_timeout_secs),
            concurrency: config.fetch.concurrency,
        }
    }
}

impl AppConfig {
    /// Resolve the staging root, falling back to the system temp dir.
    pub fn staging_root(&self) -> PathBuf {
        if self.defaults.staging_dir.is_empty() {
            std::env::temp_dir().join("aipbinder")
        } else {
            PathBuf::from(&self.defaults.staging_dir)
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.aipbinder/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| AipBinderError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.aipbinder/aipbinder.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| AipBinderError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        AipBinderError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| AipBinderError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| AipBinderError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| AipBinderError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
