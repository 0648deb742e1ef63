use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, MutexGuard};

use crate::app::{EstuaryError, Result};
use crate::cache::{now_ms, resolve_expiry, Cache, CacheValue, EntryMeta, RemainingTtl};

/// Number of lock stripes. Keys hash onto a fixed table instead of an
/// unbounded per-key lock map, bounding memory under high key cardinality.
const LOCK_STRIPES: usize = 64;

/// Reference on-disk backend.
///
/// Each key is hashed to a fixed-width digest used as the filename for two
/// sibling files: `<base>/data/<digest>` holds the raw payload and
/// `<base>/meta/<digest>` holds JSON metadata (`key`, `value_type`,
/// `created_at`, `expires_at`). Every read/write/delete for a key holds
/// that key's stripe lock for the duration of the operation so interleaved
/// writers can never produce a payload/metadata pair that don't match.
pub struct FilesystemCache {
    data_dir: PathBuf,
    meta_dir: PathBuf,
    default_ttl: Option<Duration>,
    locks: Vec<Mutex<()>>,
}

impl FilesystemCache {
    pub fn new(base: impl AsRef<Path>, default_ttl: Option<Duration>) -> Result<Self> {
        let base = base.as_ref();
        let data_dir = base.join("data");
        let meta_dir = base.join("meta");
        std::fs::create_dir_all(&data_dir)?;
        std::fs::create_dir_all(&meta_dir)?;

        Ok(Self {
            data_dir,
            meta_dir,
            default_ttl,
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        })
    }

    fn digest(key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn stripe(&self, digest: &str) -> &Mutex<()> {
        // First digest byte spreads keys evenly across the table.
        let idx = usize::from_str_radix(&digest[..2], 16).unwrap_or(0) % LOCK_STRIPES;
        &self.locks[idx]
    }

    fn data_path(&self, digest: &str) -> PathBuf {
        self.data_dir.join(digest)
    }

    fn meta_path(&self, digest: &str) -> PathBuf {
        self.meta_dir.join(digest)
    }

    async fn read_meta(&self, digest: &str) -> Result<Option<EntryMeta>> {
        match tokio::fs::read(self.meta_path(digest)).await {
            Ok(bytes) => {
                let meta = serde_json::from_slice(&bytes)
                    .map_err(|e| EstuaryError::Cache(format!("corrupt metadata: {}", e)))?;
                Ok(Some(meta))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_pair(&self, digest: &str, payload: &[u8], meta: &EntryMeta) -> Result<()> {
        // Payload first: a reader that sees metadata must find its payload.
        tokio::fs::write(self.data_path(digest), payload).await?;
        let meta_bytes = serde_json::to_vec(meta)
            .map_err(|e| EstuaryError::Cache(format!("metadata serialization: {}", e)))?;
        tokio::fs::write(self.meta_path(digest), meta_bytes).await?;
        Ok(())
    }

    async fn remove_pair(&self, digest: &str) {
        let _ = tokio::fs::remove_file(self.data_path(digest)).await;
        let _ = tokio::fs::remove_file(self.meta_path(digest)).await;
    }

    /// Live (non-expired) metadata for a key; expired entries are
    /// reclaimed on the spot. Caller must hold the stripe lock.
    async fn live_meta(&self, digest: &str) -> Result<Option<EntryMeta>> {
        match self.read_meta(digest).await? {
            Some(meta) if meta.is_expired(now_ms()) => {
                self.remove_pair(digest).await;
                Ok(None)
            }
            other => Ok(other),
        }
    }
}

#[async_trait]
impl Cache for FilesystemCache {
    async fn get(&self, key: &str) -> Result<Option<CacheValue>> {
        let digest = Self::digest(key);
        let _guard = self.stripe(&digest).lock().await;

        let Some(meta) = self.live_meta(&digest).await? else {
            return Ok(None);
        };

        match tokio::fs::read(self.data_path(&digest)).await {
            Ok(payload) => Ok(Some(CacheValue::decode(&meta.value_type, payload))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Orphaned metadata; drop it and report a miss.
                self.remove_pair(&digest).await;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: CacheValue, ttl: Option<Duration>) -> Result<()> {
        let digest = Self::digest(key);
        let _guard = self.stripe(&digest).lock().await;

        let (payload, value_type) = value.encode();
        let expires_at = resolve_expiry(ttl, self.default_ttl);
        let meta = EntryMeta::new(key, value_type, expires_at);
        self.write_pair(&digest, &payload, &meta).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let digest = Self::digest(key);
        let _guard = self.stripe(&digest).lock().await;

        let existed = self.live_meta(&digest).await?.is_some();
        self.remove_pair(&digest).await;
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let digest = Self::digest(key);
        let _guard = self.stripe(&digest).lock().await;
        Ok(self.live_meta(&digest).await?.is_some())
    }

    async fn clear(&self) -> Result<()> {
        // Take every stripe so no in-flight write races the truncation.
        let mut guards: Vec<MutexGuard<'_, ()>> = Vec::with_capacity(LOCK_STRIPES);
        for lock in &self.locks {
            guards.push(lock.lock().await);
        }

        for dir in [&self.data_dir, &self.meta_dir] {
            tokio::fs::remove_dir_all(dir).await?;
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }

    async fn increment(&self, key: &str, amount: i64) -> Result<i64> {
        let digest = Self::digest(key);
        let _guard = self.stripe(&digest).lock().await;

        // Read-modify-write under the stripe lock. Atomic within this
        // process only; see the module-level consistency note.
        let existing = self.live_meta(&digest).await?;
        let current = match &existing {
            Some(meta) => tokio::fs::read(self.data_path(&digest))
                .await
                .ok()
                .map(|payload| CacheValue::decode(&meta.value_type, payload))
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
            None => 0,
        };

        let next = current + amount;
        let expires_at = match existing {
            Some(meta) => meta.expires_at,
            None => resolve_expiry(None, self.default_ttl),
        };
        let meta = EntryMeta::new(key, "text", expires_at);
        self.write_pair(&digest, next.to_string().as_bytes(), &meta)
            .await?;
        Ok(next)
    }

    async fn get_ttl(&self, key: &str) -> Result<Option<RemainingTtl>> {
        let digest = Self::digest(key);
        let _guard = self.stripe(&digest).lock().await;
        Ok(self
            .live_meta(&digest)
            .await?
            .map(|meta| meta.remaining(now_ms())))
    }

    async fn set_ttl(&self, key: &str, ttl: Option<Duration>) -> Result<bool> {
        let digest = Self::digest(key);
        let _guard = self.stripe(&digest).lock().await;

        let Some(mut meta) = self.live_meta(&digest).await? else {
            return Ok(false);
        };
        meta.expires_at = ttl.map(|d| now_ms() + d.as_millis() as i64);
        let meta_bytes = serde_json::to_vec(&meta)
            .map_err(|e| EstuaryError::Cache(format!("metadata serialization: {}", e)))?;
        tokio::fs::write(self.meta_path(&digest), meta_bytes).await?;
        Ok(true)
    }

    async fn sweep_expired(&self) -> Result<usize> {
        let mut removed = 0;
        let mut dir = tokio::fs::read_dir(&self.meta_dir).await?;

        // A failure on one metadata file is logged and skipped; the sweep
        // never aborts partway.
        while let Some(entry) = dir.next_entry().await? {
            let digest = entry.file_name().to_string_lossy().into_owned();
            let meta = match self.read_meta(&digest).await {
                Ok(Some(meta)) => meta,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(file = %digest, error = %e, "skipping unreadable cache metadata");
                    continue;
                }
            };

            if meta.is_expired(now_ms()) {
                let _guard = self.stripe(&digest).lock().await;
                // Re-check under the lock; a writer may have refreshed it.
                match self.read_meta(&digest).await {
                    Ok(Some(meta)) if meta.is_expired(now_ms()) => {
                        self.remove_pair(&digest).await;
                        removed += 1;
                    }
                    _ => {}
                }
            }
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cache(dir: &TempDir) -> FilesystemCache {
        FilesystemCache::new(dir.path(), None).unwrap()
    }

    #[tokio::test]
    async fn test_set_get_roundtrip_all_types() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);

        cache.set("t", "text".into(), None).await.unwrap();
        cache
            .set("j", CacheValue::Json(serde_json::json!({"n": 1})), None)
            .await
            .unwrap();
        cache
            .set("b", CacheValue::Bytes(vec![0, 159, 146, 150]), None)
            .await
            .unwrap();

        assert_eq!(cache.get("t").await.unwrap(), Some(CacheValue::Text("text".into())));
        assert_eq!(
            cache.get("j").await.unwrap(),
            Some(CacheValue::Json(serde_json::json!({"n": 1})))
        );
        assert_eq!(
            cache.get("b").await.unwrap(),
            Some(CacheValue::Bytes(vec![0, 159, 146, 150]))
        );
    }

    #[tokio::test]
    async fn test_on_disk_layout() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        cache.set("layout-key", "v".into(), None).await.unwrap();

        let digest = FilesystemCache::digest("layout-key");
        assert!(dir.path().join("data").join(&digest).exists());
        let meta_path = dir.path().join("meta").join(&digest);
        assert!(meta_path.exists());

        let meta: EntryMeta =
            serde_json::from_slice(&std::fs::read(meta_path).unwrap()).unwrap();
        assert_eq!(meta.key, "layout-key");
        assert_eq!(meta.value_type, "text");
        assert!(meta.expires_at.is_none());
    }

    #[tokio::test]
    async fn test_expiry_at_read_and_sweep() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        cache
            .set("k", "v".into(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(!cache.exists("k").await.unwrap());

        // Read-time GC already removed the pair; a sweep finds nothing.
        let digest = FilesystemCache::digest("k");
        assert!(!dir.path().join("meta").join(&digest).exists());
        assert_eq!(cache.sweep_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_physically_removes_pair() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        cache
            .set("k", "v".into(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        cache.set("kept", "v".into(), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(cache.sweep_expired().await.unwrap(), 1);
        let digest = FilesystemCache::digest("k");
        assert!(!dir.path().join("data").join(&digest).exists());
        assert!(!dir.path().join("meta").join(&digest).exists());
        assert!(cache.exists("kept").await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_skips_unreadable_metadata() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        cache
            .set("expired", "v".into(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        std::fs::write(dir.path().join("meta").join("garbage"), b"not json").unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The corrupt file is skipped, the expired pair still reclaimed.
        assert_eq!(cache.sweep_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_writers_leave_consistent_pair() {
        let dir = TempDir::new().unwrap();
        let cache = std::sync::Arc::new(cache(&dir));

        let mut handles = Vec::new();
        for i in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let value = CacheValue::Json(serde_json::json!({"writer": i}));
                cache.set("contested", value, None).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Whichever writer won, payload and metadata must agree.
        let value = cache.get("contested").await.unwrap().unwrap();
        let CacheValue::Json(v) = value else {
            panic!("payload decoded under the wrong type");
        };
        let winner = v["writer"].as_i64().unwrap();
        assert!((0..16).contains(&winner));
    }

    #[tokio::test]
    async fn test_clear_truncates_storage() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        for i in 0..10 {
            cache.set(&format!("k{}", i), "v".into(), None).await.unwrap();
        }
        cache.clear().await.unwrap();
        assert_eq!(cache.get("k0").await.unwrap(), None);
        assert_eq!(std::fs::read_dir(dir.path().join("data")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_increment_counter_on_disk() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        assert_eq!(cache.increment("hits", 1).await.unwrap(), 1);
        assert_eq!(cache.increment("hits", 4).await.unwrap(), 5);
        assert_eq!(cache.decrement("hits", 2).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_ttl_roundtrip() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        cache.set("k", "v".into(), None).await.unwrap();
        assert_eq!(cache.get_ttl("k").await.unwrap(), Some(None));

        assert!(cache.set_ttl("k", Some(Duration::from_secs(60))).await.unwrap());
        let remaining = cache.get_ttl("k").await.unwrap().flatten().unwrap();
        assert!(remaining <= Duration::from_secs(60));

        assert!(cache.set_ttl("k", None).await.unwrap());
        assert_eq!(cache.get_ttl("k").await.unwrap(), Some(None));
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let cache = cache(&dir);
            cache.set("persistent", "v".into(), None).await.unwrap();
        }
        let reopened = FilesystemCache::new(dir.path(), None).unwrap();
        assert!(reopened.exists("persistent").await.unwrap());
    }
}
