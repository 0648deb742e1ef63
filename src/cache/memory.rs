use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::app::Result;
use crate::cache::{now_ms, resolve_expiry, Cache, CacheValue, RemainingTtl};

struct StoredEntry {
    value: CacheValue,
    expires_at: Option<i64>,
}

impl StoredEntry {
    fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// In-process map backend.
///
/// Increment/decrement are atomic within this process (they hold the write
/// lock for the whole read-modify-write) but offer no cross-process
/// guarantee.
pub struct MemoryCache {
    entries: RwLock<HashMap<String, StoredEntry>>,
    default_ttl: Option<Duration>,
}

impl MemoryCache {
    pub fn new(default_ttl: Option<Duration>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<CacheValue>> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return Ok(None),
                Some(e) if !e.is_expired(now_ms()) => return Ok(Some(e.value.clone())),
                Some(_) => {}
            }
        }
        // Expired: reclaim at read time. Re-check under the write lock so a
        // set() that slipped in between the two acquisitions is not evicted.
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| e.is_expired(now_ms())) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: CacheValue, ttl: Option<Duration>) -> Result<()> {
        let expires_at = resolve_expiry(ttl, self.default_ttl);
        self.entries
            .write()
            .await
            .insert(key.to_string(), StoredEntry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.write().await;
        match entries.remove(key) {
            Some(e) => Ok(!e.is_expired(now_ms())),
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().await.clear();
        Ok(())
    }

    async fn increment(&self, key: &str, amount: i64) -> Result<i64> {
        let mut entries = self.entries.write().await;
        let now = now_ms();
        let current = entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .and_then(|e| e.value.as_i64())
            .unwrap_or(0);
        let next = current + amount;
        let expires_at = entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.expires_at)
            .unwrap_or_else(|| resolve_expiry(None, self.default_ttl));
        entries.insert(
            key.to_string(),
            StoredEntry {
                value: CacheValue::Text(next.to_string()),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn get_ttl(&self, key: &str) -> Result<Option<RemainingTtl>> {
        let entries = self.entries.read().await;
        let now = now_ms();
        Ok(entries.get(key).filter(|e| !e.is_expired(now)).map(|e| {
            e.expires_at
                .map(|at| Duration::from_millis(at.saturating_sub(now).max(0) as u64))
        }))
    }

    async fn set_ttl(&self, key: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut entries = self.entries.write().await;
        let now = now_ms();
        match entries.get_mut(key) {
            Some(e) if !e.is_expired(now) => {
                e.expires_at = ttl.map(|d| now + d.as_millis() as i64);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn sweep_expired(&self) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let now = now_ms();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        Ok(before - entries.len())
    }
}
