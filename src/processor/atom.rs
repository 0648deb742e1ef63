use crate::app::Result;
use crate::domain::{FeedSource, Fingerprint};
use crate::processor::{syndication, Entry, FeedKind, FeedProcessor};

/// Atom 1.0 processor. Parsing is shared with RSS through feed-rs; the
/// variant exists so detection results stay sticky and observable.
pub struct AtomProcessor {
    source: FeedSource,
}

impl AtomProcessor {
    pub fn new(source: FeedSource) -> Self {
        Self { source }
    }
}

impl FeedProcessor for AtomProcessor {
    fn kind(&self) -> FeedKind {
        FeedKind::Atom
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
