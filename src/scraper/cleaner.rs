//! Text and identifier normalisation for scraped rows.

use anyhow::Result;
use regex::Regex;
use url::Url;

/// Listing-id patterns found in detail-page links.
///
/// `/chintai/jnc_000104425407/?bc=100384727305` → `jnc_000104425407`
#[derive(Debug, Clone)]
pub struct IdPatterns {
    jnc: Regex,
    floor: Regex,
}

impl IdPatterns {
    pub fn new() -> Result<Self> {
        Ok(Self {
            jnc: Regex::new(r"jnc_\w+")?,
            floor: Regex::new(r"\d+階")?,
        })
    }

    /// Stable listing id for a detail link, relative or absolute.
    /// Falls back to the `bc` query parameter; `None` means the row is not a
    /// listing (ads, placeholders).
    pub fn listing_id(&self, href: &str, base: &Url) -> Option<String> {
        if let Some(m) = self.jnc.find(href) {
            return Some(m.as_str().to_string());
        }

        let url = base.join(href).ok()?;
        url.query_pairs()
            .find(|(k, v)| k == "bc" && !v.trim().is_empty())
            .map(|(_, v)| format!("bc_{}", v.trim()))
    }

    /// First "N階" token in a row's text.  "" when the row has none.
    pub fn unit_floor(&self, row_text: &str) -> String {
        self.floor
            .find(row_text)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default()
    }
}

/// Concatenate trimmed text nodes, skipping blanks.
/// `["\n 25.5m", "2", " "]` → `"25.5m2"`
pub fn squash_text<'a>(nodes: impl Iterator<Item = &'a str>) -> String {
    nodes.map(str::trim).filter(|s| !s.is_empty()).collect()
}

/// Trimmed text nodes joined by a single space.
pub fn spaced_text<'a>(nodes: impl Iterator<Item = &'a str>) -> String {
    nodes
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

// ── Tests ─────────────────────────────────────────────────────────────────────
