//! Core domain types shared by every aipbinder crate.

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::{AipBinderError, Result};

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper identifying one pipeline run (time-sortable).
///
/// Staging areas are keyed by this value, so two concurrent runs never
/// share intermediate files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// RetrievalTarget
// ---------------------------------------------------------------------------

/// One remote document to retrieve.
///
/// Targets are identified by their position in the run's input, not by
/// their contents: the same location may appear more than once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalTarget {
    /// Where the document is downloaded from.
    pub location: Url,
    /// Human-readable name used in reports.
    pub label: String,
}

impl RetrievalTarget {
    pub fn new(location: Url, label: impl Into<String>) -> Self {
        Self {
            location,
            label: label.into(),
        }
    }

    /// Parse one line of a target list: `<url> & <label>`.
    ///
    /// The label is optional and defaults to the URL itself.
    pub fn parse_line(line: &str) -> Result<Self> {
        let (raw_url, label) = match line.split_once(" & ") {
            Some((url, label)) => (url.trim(), label.trim()),
            None => (line.trim(), ""),
        };

        let location = Url::parse(raw_url)
            .map_err(|e| AipBinderError::parse(format!("invalid URL '{raw_url}': {e}")))?;

        let label = if label.is_empty() {
            location.to_string()
        } else {
            label.to_string()
        };

        Ok(Self { location, label })
    }
}

/// Parse a whole target list, skipping blank lines and `#` comments.
pub fn parse_target_list(content: &str) -> Result<Vec<RetrievalTarget>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let trimmed = line.trim();
            !trimmed.is_empty() && !trimmed.starts_with('#')
        })
        .map(|(n, line)| {
            RetrievalTarget::parse_line(line)
                .map_err(|e| AipBinderError::parse(format!("line {}: {e}", n + 1)))
        })
        .collect()
}
