//! AIP menu page parser.
//!
//! The menu is a static HTML page whose navigation tree is built by inline
//! script calls of the form:
//!
//! ```text
//! ItemLink("../aip/ad/ad2/uhhh/1-ad2-uhhh-1.pdf","AD 2.1 Location indicator")
//! ```
//!
//! Only the first two string arguments matter: the relative href and the
//! human-readable label.

use aipbinder_shared::{AipBinderError, Result};
use regex::Regex;

/// One `ItemLink(...)` call found on the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuLink {
    /// Href exactly as written on the page (usually relative).
    pub href: String,
    /// Section title shown in the menu.
    pub label: String,
}

/// Build the link pattern for one aerodrome.
///
/// `icao` must already be validated; it is lowercased and escaped here.
fn link_pattern(icao: &str) -> Result<Regex> {
    let segment = regex::escape(&icao.to_ascii_lowercase());
    let pattern = format!(r#"ItemLink\("([^"]*/{segment}/[^"]*)","([^"]*)""#);
    Regex::new(&pattern).map_err(|e| AipBinderError::parse(format!("link pattern: {e}")))
}

/// Extract every link belonging to `icao`, in page order.
pub(crate) fn extract_links(html: &str, icao: &str) -> Result<Vec<MenuLink>> {
    let links = link_pattern(icao)?
        .captures_iter(html)
        .map(|caps| MenuLink {
            href: caps[1].to_string(),
            label: caps[2].trim().to_string(),
        })
        .collect();
    Ok(links)
}
