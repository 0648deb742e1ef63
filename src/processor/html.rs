//! Heuristic post extraction from plain HTML pages, for sources that
//! publish no machine-readable feed. Also serves as the one-shot fallback
//! when a detected feed stops parsing as its declared format.

use scraper::{Html, Selector};
use url::Url;

use crate::app::{EstuaryError, Result};
use crate::domain::{FeedSource, Fingerprint};
use crate::processor::{Entry, FeedKind, FeedProcessor};

/// Selectors tried in order; the first one that yields anchors wins. The
/// ordering goes from strong article signals to a bare heading scan.
const CANDIDATE_SELECTORS: &[&str] = &[
    "article a[href]",
    "main h1 a[href], main h2 a[href], main h3 a[href]",
    ".post a[href], .entry a[href], .article a[href]",
    "h1 a[href], h2 a[href], h3 a[href]",
];

/// Anchors with shorter visible text than this are assumed to be
/// navigation, not article titles.
const MIN_TITLE_LEN: usize = 8;

const MAX_LINKS: usize = 100;

pub struct HtmlProcessor {
    source: FeedSource,
}

impl HtmlProcessor {
    pub fn new(source: FeedSource) -> Self {
        Self { source }
    }
}

impl FeedProcessor for HtmlProcessor {
    fn kind(&self) -> FeedKind {
        FeedKind::Html
    }

    fn source(&self) -> &FeedSource {
        &self.source
    }

    fn parse(&self, body: &[u8]) -> Result<Vec<Entry>> {
        let html = String::from_utf8_lossy(body);
        let entries = extract_links(&html, &self.source.url)?;
        if entries.is_empty() {
            return Err(EstuaryError::Parse(format!(
                "no article-like links found at {}",
                self.source.url
            )));
        }
        Ok(entries)
    }

    /// HTML has no entry markers to key on, so changes are detected by
    /// digesting the whole document.
    fn fingerprint(&self, body: &[u8]) -> Fingerprint {
        Fingerprint::digest(body)
    }
}

/// Extract article-like anchors from an HTML document, resolving relative
/// hrefs against `base_url`. Public so misdetected XML/JSON feeds can fall
/// back to it without constructing a processor.
pub fn extract_links(html: &str, base_url: &str) -> Result<Vec<Entry>> {
    let base = Url::parse(base_url)?;
    let doc = Html::parse_document(html);

    for selector_text in CANDIDATE_SELECTORS {
        let selector = Selector::parse(selector_text)
            .map_err(|e| EstuaryError::Parse(format!("bad selector {selector_text:?}: {e}")))?;

        let mut entries = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for element in doc.select(&selector) {
            let Some(href) = element.value().attr("href") else {
                continue;
            };
            if href.starts_with('#')
                || href.starts_with("javascript:")
                || href.starts_with("mailto:")
            {
                continue;
            }
            let Ok(resolved) = base.join(href) else {
                continue;
            };
            let title = element.text().collect::<String>().trim().to_string();
            if title.len() < MIN_TITLE_LEN {
                continue;
            }
            let url = resolved.to_string();
            if !seen.insert(url.clone()) {
                continue;
            }
            entries.push(Entry {
                url: Some(url),
                title: Some(title),
                ..Default::default()
            });
            if entries.len() >= MAX_LINKS {
                break;
            }
        }

        if !entries.is_empty() {
            return Ok(entries);
        }
    }

    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    // The fixture contains `"#` (a fragment href), so the raw string needs
    // double-hash delimiters.
    const PAGE: &str = r##"<!DOCTYPE html>
<html>
<body>
  <nav><a href="/about">About</a></nav>
  <article>
    <h2><a href="/posts/first-post">An Interesting First Post</a></h2>
    <h2><a href="/posts/second-post">The Second Post Arrives</a></h2>
    <h2><a href="/posts/first-post">An Interesting First Post</a></h2>
    <a href="#top">Top</a>
    <a href="/tag/rust">rust</a>
  </article>
</body>
</html>"##;

    #[test]
    fn test_extracts_article_links_and_resolves_relative_hrefs() {
        let entries = extract_links(PAGE, "https://example.com/blog").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0].url.as_deref(),
            Some("https://example.com/posts/first-post")
        );
        assert_eq!(
            entries[0].title.as_deref(),
            Some("An Interesting First Post")
        );
    }

    #[test]
    fn test_skips_fragments_and_short_nav_text() {
        let entries = extract_links(PAGE, "https://example.com/blog").unwrap();
        assert!(entries
            .iter()
            .all(|e| !e.url.as_deref().unwrap_or("").contains('#')));
        assert!(entries.iter().all(|e| !e
            .url
            .as_deref()
            .unwrap_or("")
            .ends_with("/tag/rust")));
    }

    #[test]
    fn test_page_without_article_links_is_a_parse_error() {
        let processor = HtmlProcessor::new(FeedSource::new("html", "https://example.com"));
        let err = processor
            .parse(b"<html><body><p>nothing here</p></body></html>")
            .unwrap_err();
        assert!(matches!(err, EstuaryError::Parse(_)));
    }

    #[test]
    fn test_falls_through_to_heading_scan() {
        let page = r#"<html><body>
            <h2><a href="/p/standalone-heading-post">A Standalone Heading Post</a></h2>
        </body></html>"#;
        let entries = extract_links(page, "https://example.com").unwrap();
        assert_eq!(entries.len(), 1);
    }
}
