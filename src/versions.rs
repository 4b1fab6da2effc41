//! Upstream version-index resolution.
//!
//! The index is a JSON document of the form `{"offers": [{"version": ...}]}`
//! with the newest release first. It is fetched at most once per suite; on
//! fetch failure `{VERSION-...}` placeholders pass through unexpanded.

use crate::http::{self, HttpError};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct IndexDoc {
    #[serde(default)]
    offers: Vec<Offer>,
}

#[derive(Debug, Deserialize)]
struct Offer {
    version: String,
}

/// Ordered list of offered versions, newest first.
#[derive(Debug, Clone)]
pub struct VersionIndex {
    offers: Vec<String>,
}

impl VersionIndex {
    pub fn fetch(url: &str) -> Result<Self, HttpError> {
        let doc: IndexDoc = http::get_json(url)?;
        Ok(Self::from_offers(
            doc.offers.into_iter().map(|o| o.version).collect(),
        ))
    }

    pub fn from_offers(offers: Vec<String>) -> Self {
        VersionIndex { offers }
    }

    /// Resolve a version alias.
    ///
    /// `latest` is the first offer; `X-latest` and `X.Y-latest` pick the
    /// newest offer in that release line (component-wise prefix, so `6.1`
    /// never matches `6.10.x`).
    pub fn resolve(&self, alias: &str) -> Option<&str> {
        if alias == "latest" {
            return self.offers.first().map(String::as_str);
        }
        let prefix = alias.strip_suffix("-latest")?;
        self.offers
            .iter()
            .find(|v| v.as_str() == prefix || v.starts_with(&format!("{prefix}.")))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> VersionIndex {
        VersionIndex::from_offers(
            ["6.5.2", "6.5.1", "6.5", "6.4.3", "6.10", "5.9.9"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }

    #[test]
    fn latest_is_first_offer() {
        assert_eq!(index().resolve("latest"), Some("6.5.2"));
    }

    #[test]
    fn line_aliases_pick_newest_in_line() {
        assert_eq!(index().resolve("6.5-latest"), Some("6.5.2"));
        assert_eq!(index().resolve("6.4-latest"), Some("6.4.3"));
        assert_eq!(index().resolve("6-latest"), Some("6.5.2"));
        assert_eq!(index().resolve("5-latest"), Some("5.9.9"));
    }

    #[test]
    fn prefix_match_is_component_wise() {
        // "6.1" must not match "6.10".
        assert_eq!(index().resolve("6.1-latest"), None);
    }

    #[test]
    fn unknown_alias_is_none() {
        assert_eq!(index().resolve("7-latest"), None);
        assert_eq!(index().resolve("nonsense"), None);
    }

    #[test]
    fn offers_parse_from_index_document() {
        let doc: IndexDoc =
            serde_json::from_str(r#"{"offers":[{"version":"6.5.2"},{"version":"6.5.1"}]}"#)
                .unwrap();
        let index = VersionIndex::from_offers(doc.offers.into_iter().map(|o| o.version).collect());
        assert_eq!(index.resolve("latest"), Some("6.5.2"));
    }
}
