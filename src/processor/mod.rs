//! Feed-format detection and the per-format processor family.
//!
//! Each format implements the same four operations — fetch, parse,
//! extract, fingerprint — behind [`FeedProcessor`]. A stateless detector
//! maps URL and content signals to a [`FeedKind`]; the chosen variant
//! handles all subsequent polls for that feed until repeated parse
//! failures indicate misdetection, at which point the orchestrator
//! re-runs detection.

mod atom;
mod fetch;
mod html;
mod json;
mod rss;
mod syndication;

pub use atom::AtomProcessor;
pub use fetch::{FetchClient, FetchedDoc};
pub use html::{extract_links, HtmlProcessor};
pub use json::JsonProcessor;
pub use rss::RssProcessor;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::app::Result;
use crate::domain::{DiscoveredPost, FeedSource, Fingerprint};

/// Parse failures tolerated before the orchestrator re-runs detection.
pub const MISDETECTION_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    Rss,
    Atom,
    Json,
    /// Bare-HTML fallback: heuristic anchor extraction.
    Html,
}

impl std::fmt::Display for FeedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FeedKind::Rss => "rss",
            FeedKind::Atom => "atom",
            FeedKind::Json => "json",
            FeedKind::Html => "html",
        };
        f.write_str(name)
    }
}

/// A normalized feed entry, the intermediate between parse and extract.
#[derive(Debug, Clone, Default)]
pub struct Entry {
    /// Upstream identifier; may be empty when the feed omits one.
    pub id: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub tags: Vec<String>,
}

impl Entry {
    /// Most stable identifier available: id, else link, else title.
    pub fn identifier(&self) -> Option<&str> {
        if !self.id.is_empty() {
            return Some(&self.id);
        }
        self.url.as_deref().or(self.title.as_deref())
    }
}

/// One feed format's fetch/parse/extract/fingerprint pipeline.
#[async_trait]
pub trait FeedProcessor: Send + Sync {
    fn kind(&self) -> FeedKind;

    fn source(&self) -> &FeedSource;

    /// Fetch the raw feed document. Escalation (§ fetch) applies.
    async fn fetch(&self, client: &FetchClient) -> Result<Vec<u8>> {
        let source = self.source();
        let doc = client.fetch_detailed(&source.url, &source.headers).await?;
        Ok(doc.bytes)
    }

    fn parse(&self, body: &[u8]) -> Result<Vec<Entry>>;

    /// Turn parsed entries into posts. Entries without a resolvable URL
    /// are dropped; everything else becomes an immutable
    /// [`DiscoveredPost`] keyed by the entry's stable identifier.
    fn extract_posts(&self, entries: Vec<Entry>) -> Vec<DiscoveredPost> {
        let source = self.source();
        entries
            .into_iter()
            .filter_map(|entry| {
                let url = entry.url.clone()?;
                let identifier = entry.identifier()?.to_string();
                let title = entry
                    .title
                    .clone()
                    .unwrap_or_else(|| "(untitled)".to_string());
                let mut post = DiscoveredPost::new(&source.name, &identifier, url, title);
                post.author = entry.author;
                post.publish_date = entry.published;
                post.updated_date = entry.updated;
                post.summary = entry.summary;
                post.tags = entry.tags;
                Some(post)
            })
            .collect()
    }

    /// Cheap summary of the fetched document for change detection.
    fn fingerprint(&self, body: &[u8]) -> Fingerprint;
}

/// URL-pattern hints, the first detection stage.
pub fn detect_from_url(url: &str) -> Option<FeedKind> {
    let lower = url.to_ascii_lowercase();
    let path = lower.split('?').next().unwrap_or(&lower);

    // Only a .json path component counts; a bare "json" segment shows up in
    // too many non-feed URLs to be a usable signal.
    if path.ends_with(".json") || path.contains("/feed.json") {
        return Some(FeedKind::Json);
    }
    if path.contains("/atom") || path.ends_with(".atom") {
        return Some(FeedKind::Atom);
    }
    if path.contains("/rss") || path.ends_with(".rss") || path.contains("/feed") {
        return Some(FeedKind::Rss);
    }
    None
}

/// Declared content type, the second stage (probe fetch).
pub fn detect_from_content_type(content_type: &str) -> Option<FeedKind> {
    let ct = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase();
    match ct.as_str() {
        "application/rss+xml" => Some(FeedKind::Rss),
        "application/atom+xml" => Some(FeedKind::Atom),
        "application/json" | "application/feed+json" => Some(FeedKind::Json),
        "text/html" | "application/xhtml+xml" => Some(FeedKind::Html),
        // Generic XML stays inconclusive; sniffing decides rss vs atom.
        _ => None,
    }
}

/// Byte sniffing, the third stage.
pub fn sniff_bytes(bytes: &[u8]) -> Option<FeedKind> {
    let text = String::from_utf8_lossy(&bytes[..bytes.len().min(2048)]);
    let trimmed = text.trim_start_matches('\u{feff}').trim_start();

    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Some(FeedKind::Json);
    }
    if trimmed.starts_with('<') {
        let lower = trimmed.to_ascii_lowercase();
        if lower.contains("<feed") {
            return Some(FeedKind::Atom);
        }
        if lower.contains("<rss") || lower.contains("<rdf") {
            return Some(FeedKind::Rss);
        }
        if lower.contains("<html") || lower.starts_with("<!doctype html") {
            return Some(FeedKind::Html);
        }
    }
    None
}

/// Full detection: URL hints, then one probe fetch inspecting the
/// declared content type, then byte sniffing, defaulting to RSS.
pub async fn detect_kind(source: &FeedSource, client: &FetchClient) -> FeedKind {
    if let Some(kind) = detect_from_url(&source.url) {
        return kind;
    }

    match client.fetch_detailed(&source.url, &source.headers).await {
        Ok(doc) => {
            if let Some(kind) = doc.content_type.as_deref().and_then(detect_from_content_type) {
                return kind;
            }
            if let Some(kind) = sniff_bytes(&doc.bytes) {
                return kind;
            }
            FeedKind::Rss
        }
        Err(e) => {
            tracing::debug!(feed = %source.name, error = %e, "probe fetch failed; defaulting to rss");
            FeedKind::Rss
        }
    }
}

/// Construct the processor variant for a detected kind.
pub fn make_processor(kind: FeedKind, source: FeedSource) -> Arc<dyn FeedProcessor> {
    match kind {
        FeedKind::Rss => Arc::new(RssProcessor::new(source)),
        FeedKind::Atom => Arc::new(AtomProcessor::new(source)),
        FeedKind::Json => Arc::new(JsonProcessor::new(source)),
        FeedKind::Html => Arc::new(HtmlProcessor::new(source)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_hints() {
        assert_eq!(
            detect_from_url("https://example.com/rss.xml"),
            Some(FeedKind::Rss)
        );
        assert_eq!(
            detect_from_url("https://example.com/atom.xml"),
            Some(FeedKind::Atom)
        );
        assert_eq!(
            detect_from_url("https://example.com/feed.json"),
            Some(FeedKind::Json)
        );
        assert_eq!(
            detect_from_url("https://example.com/blog/feed"),
            Some(FeedKind::Rss)
        );
        assert_eq!(detect_from_url("https://example.com/articles"), None);
    }

    #[test]
    fn test_json_hint_requires_a_json_path_component() {
        // A "json" segment alone is not a feed signal.
        assert_eq!(detect_from_url("https://example.com/json-api/articles"), None);
        assert_eq!(
            detect_from_url("https://example.com/docs/json-schema"),
            None
        );
        assert_eq!(
            detect_from_url("https://example.com/exports/posts.json"),
            Some(FeedKind::Json)
        );
    }

    #[test]
    fn test_url_hints_ignore_query_string() {
        assert_eq!(
            detect_from_url("https://example.com/articles?format=.json"),
            None
        );
    }

    #[test]
    fn test_content_type_detection() {
        assert_eq!(
            detect_from_content_type("application/rss+xml; charset=utf-8"),
            Some(FeedKind::Rss)
        );
        assert_eq!(
            detect_from_content_type("application/atom+xml"),
            Some(FeedKind::Atom)
        );
        assert_eq!(
            detect_from_content_type("application/json"),
            Some(FeedKind::Json)
        );
        assert_eq!(detect_from_content_type("text/html"), Some(FeedKind::Html));
        // Generic XML is inconclusive.
        assert_eq!(detect_from_content_type("text/xml"), None);
    }

    #[test]
    fn test_sniffing() {
        assert_eq!(sniff_bytes(b"{\"items\": []}"), Some(FeedKind::Json));
        assert_eq!(
            sniff_bytes(b"<?xml version=\"1.0\"?><rss version=\"2.0\"></rss>"),
            Some(FeedKind::Rss)
        );
        assert_eq!(
            sniff_bytes(b"<feed xmlns=\"http://www.w3.org/2005/Atom\"></feed>"),
            Some(FeedKind::Atom)
        );
        assert_eq!(sniff_bytes(b"<!DOCTYPE html><html></html>"), Some(FeedKind::Html));
        assert_eq!(sniff_bytes(b"plain text"), None);
    }

    #[test]
    fn test_entry_identifier_fallback_chain() {
        let mut entry = Entry {
            id: "guid-1".into(),
            url: Some("https://example.com/a".into()),
            title: Some("Title".into()),
            ..Default::default()
        };
        assert_eq!(entry.identifier(), Some("guid-1"));

        entry.id.clear();
        assert_eq!(entry.identifier(), Some("https://example.com/a"));

        entry.url = None;
        assert_eq!(entry.identifier(), Some("Title"));

        entry.title = None;
        assert_eq!(entry.identifier(), None);
    }
}
