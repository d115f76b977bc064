//! Error types for aipbinder.
//!
//! Library crates use [`AipBinderError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for run-level aipbinder operations.
///
/// Per-target failures (a download that exhausted its retries, a document
/// that could not be merged) never surface as this type; they are recorded
/// in the run's result instead.
#[derive(Debug, thiserror::Error)]
pub enum AipBinderError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error during discovery or client setup.
    #[error("network error: {0}")]
    Network(String),

    /// Content parsing error (discovery page, target list).
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad ICAO code, malformed URL, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// The per-run staging area could not be created.
    #[error("staging error at {path:?}: {source}")]
    Staging {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The combined output document could not be written.
    #[error("output error: {0}")]
    Output(String),

    /// The run was cancelled by the caller.
    #[error("run cancelled")]
    Cancelled,
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, AipBinderError>;

impl AipBinderError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap a staging-area creation failure.
    pub fn staging(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Staging {
            path: path.into(),
            source,
        }
    }

    /// Whether this error means the caller asked the run to stop.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
