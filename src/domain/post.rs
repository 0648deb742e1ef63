use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A newly published item extracted from a feed.
///
/// Immutable once created; later pipeline stages only attach `metadata`.
/// The `id` is a deterministic digest of `(feed_name, entry_identifier)` so
/// the same upstream entry always maps to the same id across polls and
/// process restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredPost {
    pub id: String,
    pub url: String,
    pub title: String,
    /// Name of the feed this post came from.
    pub source: String,
    pub author: Option<String>,
    pub publish_date: Option<DateTime<Utc>>,
    pub updated_date: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub tags: Vec<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl DiscoveredPost {
    pub fn new(
        source: &str,
        entry_identifier: &str,
        url: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: Self::generate_id(source, entry_identifier),
            url: url.into(),
            title: title.into(),
            source: source.to_string(),
            author: None,
            publish_date: None,
            updated_date: None,
            summary: None,
            tags: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Deterministic post id from feed name and the entry's own identifier.
    pub fn generate_id(feed_name: &str, entry_identifier: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(feed_name.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(entry_identifier.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Cache key for this post's dedup marker.
    pub fn dedup_key(&self) -> String {
        format!("post:{}", self.id)
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_generation_deterministic() {
        let id1 = DiscoveredPost::generate_id("hn", "entry-123");
        let id2 = DiscoveredPost::generate_id("hn", "entry-123");
        assert_eq!(id1, id2);
    }

    #[test]
    fn test_id_generation_different_inputs() {
        let id1 = DiscoveredPost::generate_id("hn", "entry-123");
        let id2 = DiscoveredPost::generate_id("hn", "entry-456");
        let id3 = DiscoveredPost::generate_id("lobsters", "entry-123");
        assert_ne!(id1, id2);
        assert_ne!(id1, id3);
    }

    #[test]
    fn test_id_is_hex_sha256() {
        let id = DiscoveredPost::generate_id("hn", "entry-123");
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_dedup_key_uses_id() {
        let post = DiscoveredPost::new("hn", "e1", "https://example.com/1", "First");
        assert_eq!(post.dedup_key(), format!("post:{}", post.id));
    }

    #[test]
    fn test_metadata_attachment() {
        let post = DiscoveredPost::new("hn", "e1", "https://example.com/1", "First")
            .with_metadata("content", serde_json::json!("full text"));
        assert_eq!(post.metadata["content"], "full text");
    }
}
