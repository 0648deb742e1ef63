use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Static configuration for one polled feed. Loaded once at startup and
/// read-only at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedSource {
    /// Unique name, used as the cache key prefix for this feed.
    pub name: String,
    /// Feed URL.
    pub url: String,
    /// Extra request headers sent with every fetch.
    pub headers: HashMap<String, String>,
    /// Minutes between scheduled polls.
    pub check_interval_minutes: u64,
    /// Maximum posts surfaced per poll cycle.
    pub max_posts_per_check: usize,
    /// Disabled feeds are skipped entirely by the orchestrator.
    pub enabled: bool,
}

impl Default for FeedSource {
    fn default() -> Self {
        Self {
            name: String::new(),
            url: String::new(),
            headers: HashMap::new(),
            check_interval_minutes: 60,
            max_posts_per_check: 10,
            enabled: true,
        }
    }
}

impl FeedSource {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    /// Cache key holding this feed's last-seen fingerprint.
    pub fn fingerprint_key(&self) -> String {
        format!("feed:{}:fingerprint", self.name)
    }

    /// Cache key holding this feed's last-checked timestamp.
    pub fn last_checked_key(&self) -> String {
        format!("feed:{}:last_checked", self.name)
    }
}
