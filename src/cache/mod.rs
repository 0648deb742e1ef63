//! Generic TTL-aware key/value cache.
//!
//! Several interchangeable backends satisfy one contract: an in-process
//! map ([`MemoryCache`]), on-disk files ([`FilesystemCache`], the reference
//! backend), a remote key-value store ([`RedisCache`]) and a relational
//! table ([`SqliteCache`]).
//!
//! TTL semantics: a `set` with `ttl = None` applies the backend's
//! configured default; an explicit `Some(Duration::ZERO)`, or no default,
//! means the entry never expires. An entry whose expiry has passed is
//! invisible to every read operation even before it is physically
//! reclaimed; reads opportunistically reclaim such entries in addition to
//! the background sweep.
//!
//! Consistency note: `increment`/`decrement` are read-modify-write under
//! the backend's own locking unless the backend exposes a native atomic
//! counter (redis `INCRBY`, a single SQL `UPDATE`). Callers must not rely
//! on cross-process atomicity from the memory or filesystem backends.

mod filesystem;
mod memory;
mod redis;
mod sqlite;

pub use filesystem::FilesystemCache;
pub use memory::MemoryCache;
pub use redis::RedisCache;
pub use sqlite::SqliteCache;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::app::Result;

/// Remaining lifetime of an entry: `Some(d)` counts down, `None` never
/// expires.
pub type RemainingTtl = Option<Duration>;

/// A typed cache payload.
///
/// The `value_type` discriminator stored alongside the payload selects how
/// bytes are decoded on read. Values whose structured serialization fails
/// fall back to the opaque-binary encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Text(String),
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl CacheValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            CacheValue::Text(_) => "text",
            CacheValue::Json(_) => "json",
            CacheValue::Bytes(_) => "bytes",
        }
    }

    /// Encode into `(payload, value_type)`.
    pub fn encode(&self) -> (Vec<u8>, &'static str) {
        match self {
            CacheValue::Text(s) => (s.clone().into_bytes(), "text"),
            CacheValue::Json(v) => match serde_json::to_vec(v) {
                Ok(bytes) => (bytes, "json"),
                Err(_) => (format!("{}", v).into_bytes(), "bytes"),
            },
            CacheValue::Bytes(b) => (b.clone(), "bytes"),
        }
    }

    /// Decode a payload according to its stored discriminator. Payloads
    /// that no longer decode as their declared type degrade to `Bytes`.
    pub fn decode(value_type: &str, bytes: Vec<u8>) -> CacheValue {
        match value_type {
            "text" => match String::from_utf8(bytes) {
                Ok(s) => CacheValue::Text(s),
                Err(e) => CacheValue::Bytes(e.into_bytes()),
            },
            "json" => match serde_json::from_slice(&bytes) {
                Ok(v) => CacheValue::Json(v),
                Err(_) => CacheValue::Bytes(bytes),
            },
            _ => CacheValue::Bytes(bytes),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CacheValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Counter view of a value, for increment/decrement.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CacheValue::Text(s) => s.trim().parse().ok(),
            CacheValue::Json(v) => v.as_i64(),
            CacheValue::Bytes(b) => std::str::from_utf8(b).ok()?.trim().parse().ok(),
        }
    }
}

impl From<&str> for CacheValue {
    fn from(s: &str) -> Self {
        CacheValue::Text(s.to_string())
    }
}

impl From<String> for CacheValue {
    fn from(s: String) -> Self {
        CacheValue::Text(s)
    }
}

/// Per-entry metadata persisted next to the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMeta {
    pub key: String,
    pub value_type: String,
    /// Unix milliseconds.
    pub created_at: i64,
    /// Unix milliseconds; absent means the entry never expires.
    pub expires_at: Option<i64>,
}

impl EntryMeta {
    pub fn new(key: &str, value_type: &str, expires_at: Option<i64>) -> Self {
        Self {
            key: key.to_string(),
            value_type: value_type.to_string(),
            created_at: Utc::now().timestamp_millis(),
            expires_at,
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now_ms)
    }

    pub fn remaining(&self, now_ms: i64) -> RemainingTtl {
        self.expires_at
            .map(|at| Duration::from_millis(at.saturating_sub(now_ms).max(0) as u64))
    }
}

/// Resolve the effective expiry instant for a write.
///
/// `None` ttl takes the default; `Some(ZERO)` (or a missing default) pins
/// the entry forever.
pub(crate) fn resolve_expiry(ttl: Option<Duration>, default_ttl: Option<Duration>) -> Option<i64> {
    let effective = match ttl {
        Some(d) if d.is_zero() => None,
        Some(d) => Some(d),
        None => default_ttl,
    };
    effective.map(|d| Utc::now().timestamp_millis() + d.as_millis() as i64)
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// The cache contract shared by all backends.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheValue>>;

    async fn set(&self, key: &str, value: CacheValue, ttl: Option<Duration>) -> Result<()>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn clear(&self) -> Result<()>;

    /// Add `amount` to a counter stored under `key`, creating it at
    /// `amount` when absent, and return the new value. See the module
    /// docs for the consistency contract.
    async fn increment(&self, key: &str, amount: i64) -> Result<i64>;

    async fn decrement(&self, key: &str, amount: i64) -> Result<i64> {
        self.increment(key, -amount).await
    }

    /// Remaining TTL: `None` when the key is missing, `Some(None)` when it
    /// never expires.
    async fn get_ttl(&self, key: &str) -> Result<Option<RemainingTtl>>;

    /// Replace an existing entry's TTL (`None` removes the expiry).
    /// Returns whether the key existed.
    async fn set_ttl(&self, key: &str, ttl: Option<Duration>) -> Result<bool>;

    /// One pass of expired-entry reclamation; returns the number removed.
    /// Backends whose store self-expires may leave this a no-op.
    async fn sweep_expired(&self) -> Result<usize> {
        Ok(0)
    }

    /// Release backend resources. Idempotent.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Spawn the periodic expiry sweep for a backend. The loop logs and
/// continues on sweep errors; it never aborts partway.
pub fn spawn_sweeper(cache: Arc<dyn Cache>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(every);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        timer.tick().await; // skip the immediate first tick
        loop {
            timer.tick().await;
            match cache.sweep_expired().await {
                Ok(0) => {}
                Ok(n) => tracing::debug!(removed = n, "cache sweep reclaimed expired entries"),
                Err(e) => tracing::warn!(error = %e, "cache sweep failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_text() {
        let value = CacheValue::Text("hello".into());
        let (bytes, value_type) = value.encode();
        assert_eq!(value_type, "text");
        assert_eq!(CacheValue::decode(value_type, bytes), value);
    }

    #[test]
    fn test_encode_decode_json() {
        let value = CacheValue::Json(serde_json::json!({"a": 1, "b": [true, null]}));
        let (bytes, value_type) = value.encode();
        assert_eq!(value_type, "json");
        assert_eq!(CacheValue::decode(value_type, bytes), value);
    }

    #[test]
    fn test_decode_corrupt_json_degrades_to_bytes() {
        let decoded = CacheValue::decode("json", b"{not json".to_vec());
        assert_eq!(decoded, CacheValue::Bytes(b"{not json".to_vec()));
    }

    #[test]
    fn test_counter_view() {
        assert_eq!(CacheValue::Text("41".into()).as_i64(), Some(41));
        assert_eq!(CacheValue::Json(serde_json::json!(7)).as_i64(), Some(7));
        assert_eq!(CacheValue::Bytes(b"-3".to_vec()).as_i64(), Some(-3));
        assert_eq!(CacheValue::Text("nope".into()).as_i64(), None);
    }

    #[test]
    fn test_resolve_expiry_zero_ttl_never_expires() {
        assert_eq!(
            resolve_expiry(Some(Duration::ZERO), Some(Duration::from_secs(60))),
            None
        );
    }

    #[test]
    fn test_resolve_expiry_none_uses_default() {
        let expiry = resolve_expiry(None, Some(Duration::from_secs(60)));
        let expected = now_ms() + 60_000;
        let got = expiry.expect("default should apply");
        assert!((got - expected).abs() < 2_000);
    }

    #[test]
    fn test_resolve_expiry_no_default_never_expires() {
        assert_eq!(resolve_expiry(None, None), None);
    }

    #[test]
    fn test_meta_expiry() {
        let meta = EntryMeta::new("k", "text", Some(now_ms() - 1));
        assert!(meta.is_expired(now_ms()));
        let meta = EntryMeta::new("k", "text", Some(now_ms() + 60_000));
        assert!(!meta.is_expired(now_ms()));
        let meta = EntryMeta::new("k", "text", None);
        assert!(!meta.is_expired(now_ms()));
        assert!(meta.remaining(now_ms()).is_none());
    }
}
