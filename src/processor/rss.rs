use crate::app::Result;
use crate::domain::{FeedSource, Fingerprint};
use crate::processor::{syndication, Entry, FeedKind, FeedProcessor};

/// RSS 2.0 / RDF processor.
pub struct RssProcessor {
    source: FeedSource,
}

impl RssProcessor {
    pub fn new(source: FeedSource) -> Self {
        Self { source }
    }
}

impl FeedProcessor for RssProcessor {
    fn kind(&self) -> FeedKind {
        FeedKind::Rss
    }

    fn source(&self) -> &FeedSource {
        &self.source
    }

    fn parse(&self, body: &[u8]) -> Result<Vec<Entry>> {
        let feed = syndication::parse_feed(body)?;
        Ok(syndication::map_entries(feed))
    }

    fn fingerprint(&self, body: &[u8]) -> Fingerprint {
        match syndication::parse_feed(body) {
            Ok(feed) => syndication::fingerprint_feed(&feed, body),
            Err(_) => Fingerprint::digest(body),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> FeedSource {
        FeedSource::new("example", "https://example.com/rss.xml")
    }

    const SAMPLE: &[u8] = br#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Example</title>
    <item>
      <guid>a-1</guid>
      <title>Hello</title>
      <link>https://example.com/a-1</link>
      <pubDate>Wed, 15 Jan 2025 10:00:00 GMT</pubDate>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn test_parse_and_extract() {
        let processor = RssProcessor::new(source());
        let entries = processor.parse(SAMPLE).unwrap();
        let posts = processor.extract_posts(entries);
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].url, "https://example.com/a-1");
        assert_eq!(posts[0].source, "example");
        // The id is derived from feed name and guid, so it is stable
        // across polls.
        let again = processor.extract_posts(processor.parse(SAMPLE).unwrap());
        assert_eq!(posts[0].id, again[0].id);
    }

    #[test]
    fn test_parse_failure_is_reported() {
        let processor = RssProcessor::new(source());
        assert!(processor.parse(b"not a feed at all").is_err());
    }

    #[test]
    fn test_fingerprint_of_unparsable_body_falls_back_to_digest() {
        let processor = RssProcessor::new(source());
        assert_eq!(
            processor.fingerprint(b"garbage"),
            Fingerprint::digest(b"garbage")
        );
    }
}
