//! Shared mapping from feed-rs models to normalized entries, used by the
//! RSS, Atom and JSON Feed processors.

use crate::app::{EstuaryError, Result};
use crate::domain::Fingerprint;
use crate::processor::Entry;

pub(crate) fn parse_feed(body: &[u8]) -> Result<feed_rs::model::Feed> {
    feed_rs::parser::parse(body).map_err(|e| EstuaryError::Parse(e.to_string()))
}

pub(crate) fn map_entries(feed: feed_rs::model::Feed) -> Vec<Entry> {
    feed.entries.into_iter().map(map_entry).collect()
}

fn map_entry(entry: feed_rs::model::Entry) -> Entry {
    let url = pick_link(&entry.links);
    let title = entry
        .title
        .map(|t| html_escape::decode_html_entities(&t.content).trim().to_string())
        .filter(|t| !t.is_empty());
    let author = entry
        .authors
        .first()
        .map(|p| p.name.clone())
        .filter(|n| !n.is_empty());
    // Prefer the explicit summary; fall back to content for feeds that
    // only ship a body.
    let summary = entry
        .summary
        .map(|t| t.content)
        .or_else(|| entry.content.and_then(|c| c.body))
        .map(|s| html_escape::decode_html_entities(&s).trim().to_string())
        .filter(|s| !s.is_empty());
    let tags = entry
        .categories
        .into_iter()
        .map(|c| c.label.unwrap_or(c.term))
        .filter(|t| !t.is_empty())
        .collect();

    Entry {
        id: entry.id,
        url,
        title,
        author,
        published: entry.published,
        updated: entry.updated,
        summary,
        tags,
    }
}

/// The canonical entry link: `rel="alternate"` wins, then a link with no
/// rel, then whatever came first.
fn pick_link(links: &[feed_rs::model::Link]) -> Option<String> {
    links
        .iter()
        .find(|l| l.rel.as_deref() == Some("alternate"))
        .or_else(|| links.iter().find(|l| l.rel.is_none()))
        .or_else(|| links.first())
        .map(|l| l.href.clone())
}

/// Feed-level fingerprint without hashing the whole document: the newest
/// entry's id, then its link, then its title, then the feed's updated
/// timestamp. Only when all of those are absent does the raw document get
/// digested.
pub(crate) fn fingerprint_feed(feed: &feed_rs::model::Feed, raw: &[u8]) -> Fingerprint {
    if let Some(newest) = feed.entries.first() {
        if !newest.id.is_empty() {
            return Fingerprint::from_marker("entry", &newest.id);
        }
        if let Some(link) = pick_link(&newest.links) {
            return Fingerprint::from_marker("link", &link);
        }
        if let Some(title) = &newest.title {
            return Fingerprint::from_marker("title", &title.content);
        }
    }
    if let Some(updated) = feed.updated {
        return Fingerprint::from_marker("updated", &updated.to_rfc3339());
    }
    Fingerprint::digest(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS_SAMPLE: &[u8] = br#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Example Blog</title>
    <link>https://example.com</link>
    <item>
      <guid>post-2</guid>
      <title>Second &amp; Final</title>
      <link>https://example.com/posts/2</link>
      <pubDate>Wed, 15 Jan 2025 10:00:00 GMT</pubDate>
      <description>Newer post</description>
      <category>rust</category>
    </item>
    <item>
      <guid>post-1</guid>
      <title>First</title>
      <link>https://example.com/posts/1</link>
      <pubDate>Tue, 14 Jan 2025 10:00:00 GMT</pubDate>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn test_map_entries_normalizes_fields() {
        let feed = parse_feed(RSS_SAMPLE).unwrap();
        let entries = map_entries(feed);
        assert_eq!(entries.len(), 2);

        let newest = &entries[0];
        assert_eq!(newest.id, "post-2");
        assert_eq!(newest.title.as_deref(), Some("Second & Final"));
        assert_eq!(newest.url.as_deref(), Some("https://example.com/posts/2"));
        assert_eq!(newest.summary.as_deref(), Some("Newer post"));
        assert_eq!(newest.tags, vec!["rust"]);
        assert!(newest.published.is_some());
    }

    #[test]
    fn test_fingerprint_prefers_newest_entry_id() {
        let feed = parse_feed(RSS_SAMPLE).unwrap();
        let fp = fingerprint_feed(&feed, RSS_SAMPLE);
        assert_eq!(fp, Fingerprint::from_marker("entry", "post-2"));
    }

    #[test]
    fn test_fingerprint_digests_raw_bytes_when_feed_is_bare() {
        let bare = br#"<?xml version="1.0"?><rss version="2.0"><channel><title>Empty</title></channel></rss>"#;
        let feed = parse_feed(bare).unwrap();
        let fp = fingerprint_feed(&feed, bare);
        assert_eq!(fp, Fingerprint::digest(bare));
    }

    #[test]
    fn test_pick_link_prefers_alternate() {
        use feed_rs::model::Link;
        let empty_link = || Link {
            href: String::new(),
            rel: None,
            media_type: None,
            href_lang: None,
            title: None,
            length: None,
        };
        let mut a = empty_link();
        a.href = "https://example.com/comments".into();
        a.rel = Some("replies".into());
        let mut b = empty_link();
        b.href = "https://example.com/post".into();
        b.rel = Some("alternate".into());
        assert_eq!(
            pick_link(&[a, b]),
            Some("https://example.com/post".to_string())
        );
    }
}
