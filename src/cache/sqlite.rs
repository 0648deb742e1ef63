use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use rusqlite_migration::{Migrations, M};

use crate::app::{EstuaryError, Result};
use crate::cache::{now_ms, resolve_expiry, Cache, CacheValue, RemainingTtl};

/// Relational backend: one `cache_entries` table.
///
/// Increment/decrement run as a single `INSERT .. ON CONFLICT .. RETURNING`
/// statement, so unlike the memory and filesystem backends they are atomic
/// even across processes sharing the database file.
pub struct SqliteCache {
    conn: Mutex<Connection>,
    default_ttl: Option<Duration>,
}

impl SqliteCache {
    pub fn new<P: AsRef<Path>>(path: P, default_ttl: Option<Duration>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let cache = Self {
            conn: Mutex::new(conn),
            default_ttl,
        };
        cache.run_migrations()?;
        Ok(cache)
    }

    pub fn in_memory(default_ttl: Option<Duration>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let cache = Self {
            conn: Mutex::new(conn),
            default_ttl,
        };
        cache.run_migrations()?;
        Ok(cache)
    }

    fn run_migrations(&self) -> Result<()> {
        let migrations = Migrations::new(vec![M::up(include_str!(
            "../../migrations/001-initial/up.sql"
        ))]);

        let mut conn = self.lock()?;
        migrations
            .to_latest(&mut conn)
            .map_err(|e| EstuaryError::Cache(format!("migration failed: {}", e)))?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| EstuaryError::Cache(format!("connection lock poisoned: {}", e)))
    }
}

#[async_trait]
impl Cache for SqliteCache {
    async fn get(&self, key: &str) -> Result<Option<CacheValue>> {
        let conn = self.lock()?;
        let now = now_ms();

        let row: Option<(Vec<u8>, String, Option<i64>)> = conn
            .query_row(
                "SELECT payload, value_type, expires_at FROM cache_entries WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match row {
            Some((_, _, Some(at))) if at <= now => {
                // Read-time GC.
                conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
                Ok(None)
            }
            Some((payload, value_type, _)) => Ok(Some(CacheValue::decode(&value_type, payload))),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: CacheValue, ttl: Option<Duration>) -> Result<()> {
        let (payload, value_type) = value.encode();
        let expires_at = resolve_expiry(ttl, self.default_ttl);

        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO cache_entries (key, payload, value_type, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![key, payload, value_type, now_ms(), expires_at],
        )?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let conn = self.lock()?;
        let now = now_ms();
        let was_live: Option<bool> = conn
            .query_row(
                "SELECT expires_at IS NULL OR expires_at > ?2 FROM cache_entries WHERE key = ?1",
                params![key, now],
                |row| row.get(0),
            )
            .optional()?;
        conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
        Ok(was_live.unwrap_or(false))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let conn = self.lock()?;
        let live: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM cache_entries
                 WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, now_ms()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(live.is_some())
    }

    async fn clear(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM cache_entries", [])?;
        Ok(())
    }

    async fn increment(&self, key: &str, amount: i64) -> Result<i64> {
        let now = now_ms();
        let default_expiry = resolve_expiry(None, self.default_ttl);
        let seed = amount.to_string();

        let conn = self.lock()?;
        // An expired row is reseeded as if absent; a live row is bumped in
        // place. Single statement, so concurrent writers serialize inside
        // SQLite rather than racing a read-modify-write.
        let next: i64 = conn.query_row(
            "INSERT INTO cache_entries (key, payload, value_type, created_at, expires_at)
             VALUES (?1, ?2, 'text', ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET
                 payload = CASE
                     WHEN expires_at IS NOT NULL AND expires_at <= ?3 THEN ?2
                     ELSE CAST(CAST(payload AS INTEGER) + ?5 AS TEXT)
                 END,
                 value_type = 'text',
                 created_at = CASE
                     WHEN expires_at IS NOT NULL AND expires_at <= ?3 THEN ?3
                     ELSE created_at
                 END,
                 expires_at = CASE
                     WHEN expires_at IS NOT NULL AND expires_at <= ?3 THEN ?4
                     ELSE expires_at
                 END
             RETURNING CAST(payload AS INTEGER)",
            params![key, seed, now, default_expiry, amount],
            |row| row.get(0),
        )?;
        Ok(next)
    }

    async fn get_ttl(&self, key: &str) -> Result<Option<RemainingTtl>> {
        let conn = self.lock()?;
        let now = now_ms();
        let expires_at: Option<Option<i64>> = conn
            .query_row(
                "SELECT expires_at FROM cache_entries
                 WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, now],
                |row| row.get(0),
            )
            .optional()?;
        Ok(expires_at.map(|at| {
            at.map(|at| Duration::from_millis(at.saturating_sub(now).max(0) as u64))
        }))
    }

    async fn set_ttl(&self, key: &str, ttl: Option<Duration>) -> Result<bool> {
        let conn = self.lock()?;
        let now = now_ms();
        let expires_at = ttl.map(|d| now + d.as_millis() as i64);
        let changed = conn.execute(
            "UPDATE cache_entries SET expires_at = ?2
             WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?3)",
            params![key, expires_at, now],
        )?;
        Ok(changed > 0)
    }

    async fn sweep_expired(&self) -> Result<usize> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM cache_entries WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now_ms()],
        )?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> SqliteCache {
        SqliteCache::in_memory(None).unwrap()
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let cache = cache();
        cache
            .set("j", CacheValue::Json(serde_json::json!([1, 2, 3])), None)
            .await
            .unwrap();
        assert_eq!(
            cache.get("j").await.unwrap(),
            Some(CacheValue::Json(serde_json::json!([1, 2, 3])))
        );
    }

    #[tokio::test]
    async fn test_expired_row_is_a_miss_and_reclaimed() {
        let cache = cache();
        cache
            .set("k", "v".into(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(cache.get("k").await.unwrap(), None);
        // Row was deleted by the read, not just hidden.
        let conn = cache.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_atomic_increment_reseeds_expired_counter() {
        let cache = cache();
        cache
            .set("n", "100".into(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Expired counter restarts at the increment amount.
        assert_eq!(cache.increment("n", 5).await.unwrap(), 5);
        assert_eq!(cache.increment("n", 5).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_concurrent_increments_do_not_lose_updates() {
        let cache = std::sync::Arc::new(cache());
        let mut handles = Vec::new();
        for _ in 0..20 {
            let cache = cache.clone();
            handles.push(tokio::spawn(
                async move { cache.increment("n", 1).await.unwrap() },
            ));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(cache.increment("n", 0).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_delete_and_exists() {
        let cache = cache();
        cache.set("k", "v".into(), None).await.unwrap();
        assert!(cache.exists("k").await.unwrap());
        assert!(cache.delete("k").await.unwrap());
        assert!(!cache.exists("k").await.unwrap());
        assert!(!cache.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_rows() {
        let cache = cache();
        cache
            .set("old", "v".into(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        cache.set("new", "v".into(), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(cache.sweep_expired().await.unwrap(), 1);
        assert!(cache.exists("new").await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_queries() {
        let cache = cache();
        cache.set("k", "v".into(), None).await.unwrap();
        assert_eq!(cache.get_ttl("k").await.unwrap(), Some(None));

        assert!(cache.set_ttl("k", Some(Duration::from_secs(30))).await.unwrap());
        let remaining = cache.get_ttl("k").await.unwrap().flatten().unwrap();
        assert!(remaining <= Duration::from_secs(30));

        assert_eq!(cache.get_ttl("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = cache();
        cache.set("a", "1".into(), None).await.unwrap();
        cache.set("b", "2".into(), None).await.unwrap();
        cache.clear().await.unwrap();
        assert!(!cache.exists("a").await.unwrap());
        assert!(!cache.exists("b").await.unwrap());
    }
}
