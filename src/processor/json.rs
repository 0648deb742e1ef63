//! JSON feed processor.
//!
//! JSON Feed 1.x documents go through feed-rs like the XML formats. API
//! responses that merely look feed-shaped (a top-level `items` array with
//! ad-hoc field names) get a lenient second parse that probes the common
//! aliases for each field.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::app::{EstuaryError, Result};
use crate::domain::{FeedSource, Fingerprint};
use crate::processor::{syndication, Entry, FeedKind, FeedProcessor};

pub struct JsonProcessor {
    source: FeedSource,
}

impl JsonProcessor {
    pub fn new(source: FeedSource) -> Self {
        Self { source }
    }
}

impl FeedProcessor for JsonProcessor {
    fn kind(&self) -> FeedKind {
        FeedKind::Json
    }

    fn source(&self) -> &FeedSource {
        &self.source
    }

    fn parse(&self, body: &[u8]) -> Result<Vec<Entry>> {
        // Proper JSON Feed first.
        if let Ok(feed) = feed_rs::parser::parse(body) {
            return Ok(syndication::map_entries(feed));
        }
        parse_generic_items(body)
    }

    fn fingerprint(&self, body: &[u8]) -> Fingerprint {
        let Ok(doc) = serde_json::from_slice::<Value>(body) else {
            return Fingerprint::digest(body);
        };
        if let Some(newest) = doc.get("items").and_then(|v| v.as_array()).and_then(|a| a.first()) {
            if let Some(id) = string_field(newest, &["id", "guid"]) {
                return Fingerprint::from_marker("entry", &id);
            }
            if let Some(url) = string_field(newest, &["url", "link", "external_url"]) {
                return Fingerprint::from_marker("link", &url);
            }
            if let Some(title) = string_field(newest, &["title"]) {
                return Fingerprint::from_marker("title", &title);
            }
        }
        if let Some(updated) = string_field(&doc, &["updated", "last_updated"]) {
            return Fingerprint::from_marker("updated", &updated);
        }
        Fingerprint::digest(body)
    }
}

/// Lenient parse of `{"items": [...]}` documents that are not JSON Feed.
fn parse_generic_items(body: &[u8]) -> Result<Vec<Entry>> {
    let doc: Value =
        serde_json::from_slice(body).map_err(|e| EstuaryError::Parse(e.to_string()))?;
    let items = doc
        .get("items")
        .and_then(|v| v.as_array())
        .ok_or_else(|| EstuaryError::Parse("json document has no items array".to_string()))?;

    Ok(items.iter().map(map_generic_item).collect())
}

fn map_generic_item(item: &Value) -> Entry {
    let tags = item
        .get("tags")
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|t| t.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Entry {
        id: string_field(item, &["id", "guid"]).unwrap_or_default(),
        url: string_field(item, &["url", "link", "external_url"]),
        title: string_field(item, &["title"]),
        author: author_field(item),
        published: date_field(item, &["date_published", "published", "pubDate", "created_at"]),
        updated: date_field(item, &["date_modified", "updated"]),
        summary: string_field(item, &["summary", "description", "content_text"]),
        tags,
    }
}

fn string_field(value: &Value, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| value.get(name).and_then(|v| v.as_str()))
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

/// Author as either a JSON Feed object (`{"name": ...}`) or a bare string.
fn author_field(item: &Value) -> Option<String> {
    let author = item.get("author").or_else(|| {
        item.get("authors")
            .and_then(|v| v.as_array())
            .and_then(|a| a.first())
    })?;
    match author {
        Value::String(name) => Some(name.clone()),
        Value::Object(_) => author
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        _ => None,
    }
}

fn date_field(item: &Value, names: &[&str]) -> Option<DateTime<Utc>> {
    let raw = string_field(item, names)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .or_else(|_| DateTime::parse_from_rfc2822(&raw).map(|d| d.with_timezone(&Utc)))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor() -> JsonProcessor {
        JsonProcessor::new(FeedSource::new("json", "https://example.com/feed.json"))
    }

    const JSON_FEED: &[u8] = br#"{
        "version": "https://jsonfeed.org/version/1.1",
        "title": "Example JSON Feed",
        "items": [
            {
                "id": "jf-1",
                "url": "https://example.com/jf/1",
                "title": "JSON Feed Post",
                "date_published": "2025-01-15T10:00:00Z",
                "authors": [{"name": "Grace"}]
            }
        ]
    }"#;

    const GENERIC_ITEMS: &[u8] = br#"{
        "updated": "2025-01-15T12:00:00Z",
        "items": [
            {
                "guid": "api-7",
                "link": "https://example.com/api/7",
                "title": "From an API",
                "published": "2025-01-15T09:30:00Z",
                "author": "Brian",
                "description": "Not a JSON Feed",
                "tags": ["infra", "rust"]
            }
        ]
    }"#;

    #[test]
    fn test_parses_json_feed() {
        let entries = processor().parse(JSON_FEED).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].url.as_deref(), Some("https://example.com/jf/1"));
    }

    #[test]
    fn test_parses_generic_items_document() {
        let entries = processor().parse(GENERIC_ITEMS).unwrap();
        assert_eq!(entries.len(), 1);
        let e = &entries[0];
        assert_eq!(e.id, "api-7");
        assert_eq!(e.url.as_deref(), Some("https://example.com/api/7"));
        assert_eq!(e.author.as_deref(), Some("Brian"));
        assert_eq!(e.summary.as_deref(), Some("Not a JSON Feed"));
        assert_eq!(e.tags, vec!["infra", "rust"]);
        assert!(e.published.is_some());
    }

    #[test]
    fn test_json_without_items_is_a_parse_error() {
        let err = processor().parse(br#"{"data": []}"#).unwrap_err();
        assert!(matches!(err, EstuaryError::Parse(_)));
    }

    #[test]
    fn test_fingerprint_uses_first_item_id() {
        assert_eq!(
            processor().fingerprint(GENERIC_ITEMS),
            Fingerprint::from_marker("entry", "api-7")
        );
    }

    #[test]
    fn test_fingerprint_falls_back_to_updated_then_digest() {
        let no_items = br#"{"updated": "2025-01-15T12:00:00Z", "items": []}"#;
        assert_eq!(
            processor().fingerprint(no_items),
            Fingerprint::from_marker("updated", "2025-01-15T12:00:00Z")
        );
        assert_eq!(
            processor().fingerprint(b"not json"),
            Fingerprint::digest(b"not json")
        );
    }
}
