//! Change detection and new-post discovery.
//!
//! One discovery pass fetches a feed, short-circuits on an unchanged
//! fingerprint, parses off the async runtime, and filters out posts whose
//! dedup marker is already cached. A pass never raises: every failure is
//! logged and degrades to an empty result so one bad feed cannot take the
//! scheduler down with it.
//!
//! Dedup is at-least-once, not exactly-once: the marker check and the
//! marker write are separate cache operations, so two concurrent passes
//! over the same feed can both surface a post. Downstream consumers key on
//! the deterministic post id.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::cache::{Cache, CacheValue};
use crate::domain::{DiscoveredPost, Fingerprint};
use crate::processor::{extract_links, FeedProcessor, FetchClient};

/// Lifetime of a post's dedup marker. Feeds that resurface entries older
/// than this will re-discover them.
pub const DEDUP_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Result of one discovery pass over a feed.
#[derive(Debug, Default)]
pub struct DiscoveryOutcome {
    pub posts: Vec<DiscoveredPost>,
    /// The declared format failed to parse (even if the HTML fallback
    /// salvaged the pass). Feeds repeatedly failing get re-detected.
    pub parse_failed: bool,
    /// The fetch never produced a body.
    pub fetch_failed: bool,
}

/// Discovery over an optional cache. With no cache every pass parses the
/// full document and every post counts as new.
pub struct Discovery {
    cache: Option<Arc<dyn Cache>>,
}

impl Discovery {
    pub fn new(cache: Option<Arc<dyn Cache>>) -> Self {
        Self { cache }
    }

    /// One full pass: fetch, change-detect, parse, extract, dedup.
    pub async fn discover(
        &self,
        processor: &Arc<dyn FeedProcessor>,
        client: &FetchClient,
    ) -> DiscoveryOutcome {
        let source = processor.source();
        let body = match processor.fetch(client).await {
            Ok(body) => body,
            Err(e) => {
                // Fingerprint and markers stay untouched so the next pass
                // re-evaluates from the same baseline.
                tracing::warn!(feed = %source.name, error = %e, "fetch failed");
                return DiscoveryOutcome {
                    fetch_failed: true,
                    ..Default::default()
                };
            }
        };

        self.process_body(processor, body).await
    }

    /// The post-fetch half of a pass, split out so it can run on bodies
    /// obtained elsewhere.
    pub async fn process_body(
        &self,
        processor: &Arc<dyn FeedProcessor>,
        body: Vec<u8>,
    ) -> DiscoveryOutcome {
        let source = processor.source();
        let fingerprint = processor.fingerprint(&body);

        if let Some(previous) = self.cached_fingerprint(&source.fingerprint_key()).await {
            if previous == fingerprint {
                tracing::debug!(feed = %source.name, "fingerprint unchanged, skipping parse");
                self.touch_last_checked(&source.last_checked_key()).await;
                return DiscoveryOutcome::default();
            }
        }

        let (entries, parse_failed) = self.parse_entries(processor, &body).await;
        let Some(entries) = entries else {
            return DiscoveryOutcome {
                parse_failed,
                ..Default::default()
            };
        };

        let mut posts = processor.extract_posts(entries);
        sort_newest_first(&mut posts);
        posts.truncate(source.max_posts_per_check);

        let posts = self.filter_new(posts).await;

        self.store_fingerprint(&source.fingerprint_key(), &fingerprint)
            .await;
        self.touch_last_checked(&source.last_checked_key()).await;

        tracing::info!(
            feed = %source.name,
            kind = %processor.kind(),
            new_posts = posts.len(),
            "discovery pass complete"
        );

        DiscoveryOutcome {
            posts,
            parse_failed,
            fetch_failed: false,
        }
    }

    /// Parse off the runtime; on failure of the declared format, try one
    /// heuristic HTML extraction before giving up.
    async fn parse_entries(
        &self,
        processor: &Arc<dyn FeedProcessor>,
        body: &[u8],
    ) -> (Option<Vec<crate::processor::Entry>>, bool) {
        let source = processor.source();
        let parse_processor = Arc::clone(processor);
        let parse_body = body.to_vec();
        let parsed =
            tokio::task::spawn_blocking(move || parse_processor.parse(&parse_body)).await;

        match parsed {
            Ok(Ok(entries)) => (Some(entries), false),
            Ok(Err(e)) => {
                tracing::warn!(feed = %source.name, kind = %processor.kind(), error = %e, "parse failed, trying html fallback");
                let html = String::from_utf8_lossy(body);
                match extract_links(&html, &source.url) {
                    Ok(entries) if !entries.is_empty() => (Some(entries), true),
                    _ => (None, true),
                }
            }
            Err(e) => {
                tracing::error!(feed = %source.name, error = %e, "parse task panicked");
                (None, true)
            }
        }
    }

    /// Keep only posts with no dedup marker, writing markers for the kept
    /// ones.
    async fn filter_new(&self, posts: Vec<DiscoveredPost>) -> Vec<DiscoveredPost> {
        let Some(cache) = &self.cache else {
            return posts;
        };

        let mut new_posts = Vec::with_capacity(posts.len());
        for post in posts {
            let key = post.dedup_key();
            let seen = match cache.exists(&key).await {
                Ok(seen) => seen,
                Err(e) => {
                    // A cache failure is a transparent miss; the post is
                    // surfaced rather than silently dropped.
                    tracing::warn!(error = %e, key = %key, "dedup lookup failed, treating as new");
                    false
                }
            };
            if seen {
                continue;
            }
            if let Err(e) = cache
                .set(&key, CacheValue::Text("1".into()), Some(DEDUP_TTL))
                .await
            {
                tracing::warn!(error = %e, key = %key, "failed to write dedup marker");
            }
            new_posts.push(post);
        }
        new_posts
    }

    async fn cached_fingerprint(&self, key: &str) -> Option<Fingerprint> {
        let cache = self.cache.as_ref()?;
        match cache.get(key).await {
            Ok(Some(value)) => value.as_text().map(Fingerprint::new),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, key = %key, "fingerprint lookup failed, treating as changed");
                None
            }
        }
    }

    async fn store_fingerprint(&self, key: &str, fingerprint: &Fingerprint) {
        let Some(cache) = &self.cache else { return };
        // No TTL: the baseline survives until the feed actually changes.
        if let Err(e) = cache
            .set(key, CacheValue::Text(fingerprint.to_string()), Some(Duration::ZERO))
            .await
        {
            tracing::warn!(error = %e, key = %key, "failed to store fingerprint");
        }
    }

    async fn touch_last_checked(&self, key: &str) {
        let Some(cache) = &self.cache else { return };
        let now = Utc::now().to_rfc3339();
        if let Err(e) = cache
            .set(key, CacheValue::Text(now), Some(Duration::ZERO))
            .await
        {
            tracing::warn!(error = %e, key = %key, "failed to store last-checked timestamp");
        }
    }
}

/// Newest first; posts without a publish date sort last in stable order.
fn sort_newest_first(posts: &mut [DiscoveredPost]) {
    posts.sort_by(|a, b| match (&a.publish_date, &b.publish_date) {
        (Some(x), Some(y)) => y.cmp(x),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
}
