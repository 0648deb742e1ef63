//! The cache contract, run against every embeddable backend. The redis
//! backend needs a live server and is covered by its own unit tests.

use std::sync::Arc;
use std::time::Duration;

use estuary::cache::{Cache, CacheValue, FilesystemCache, MemoryCache, SqliteCache};
use tempfile::TempDir;

struct Backend {
    name: &'static str,
    cache: Arc<dyn Cache>,
    // Keeps the backing directory alive for the test's duration.
    _dir: Option<TempDir>,
}

fn backends() -> Vec<Backend> {
    let fs_dir = TempDir::new().unwrap();
    let sqlite_dir = TempDir::new().unwrap();
    vec![
        Backend {
            name: "memory",
            cache: Arc::new(MemoryCache::new(None)),
            _dir: None,
        },
        Backend {
            name: "filesystem",
            cache: Arc::new(FilesystemCache::new(fs_dir.path(), None).unwrap()),
            _dir: Some(fs_dir),
        },
        Backend {
            name: "sqlite",
            cache: Arc::new(SqliteCache::new(sqlite_dir.path().join("cache.db"), None).unwrap()),
            _dir: Some(sqlite_dir),
        },
    ]
}

#[tokio::test]
async fn roundtrip_and_delete() {
    for backend in backends() {
        let cache = &backend.cache;
        cache
            .set("k1", CacheValue::Text("hello".into()), None)
            .await
            .unwrap();
        assert_eq!(
            cache.get("k1").await.unwrap(),
            Some(CacheValue::Text("hello".into())),
            "{}",
            backend.name
        );
        assert!(cache.exists("k1").await.unwrap());
        assert!(cache.delete("k1").await.unwrap());
        assert!(!cache.delete("k1").await.unwrap());
        assert!(cache.get("k1").await.unwrap().is_none());
    }
}

#[tokio::test]
async fn json_values_survive_the_roundtrip() {
    let value = CacheValue::Json(serde_json::json!({"id": "p1", "tags": ["a", "b"]}));
    for backend in backends() {
        backend.cache.set("j", value.clone(), None).await.unwrap();
        assert_eq!(
            backend.cache.get("j").await.unwrap(),
            Some(value.clone()),
            "{}",
            backend.name
        );
    }
}

#[tokio::test]
async fn expired_entries_are_invisible_then_swept() {
    for backend in backends() {
        let cache = &backend.cache;
        cache
            .set(
                "short",
                CacheValue::Text("x".into()),
                Some(Duration::from_millis(30)),
            )
            .await
            .unwrap();
        cache
            .set("long", CacheValue::Text("y".into()), Some(Duration::ZERO))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(
            cache.get("short").await.unwrap().is_none(),
            "{}: expired entry must be invisible",
            backend.name
        );
        assert!(!cache.exists("short").await.unwrap());

        let removed = cache.sweep_expired().await.unwrap();
        // `get` may already have reclaimed it; either way nothing expired
        // remains and the live entry is untouched.
        assert!(removed <= 1, "{}", backend.name);
        assert!(cache.exists("long").await.unwrap(), "{}", backend.name);
    }
}

#[tokio::test]
async fn counters_increment_and_decrement() {
    for backend in backends() {
        let cache = &backend.cache;
        assert_eq!(cache.increment("n", 5).await.unwrap(), 5, "{}", backend.name);
        assert_eq!(cache.increment("n", 2).await.unwrap(), 7);
        assert_eq!(cache.decrement("n", 10).await.unwrap(), -3);
    }
}

#[tokio::test]
async fn ttl_is_inspectable_and_replaceable() {
    for backend in backends() {
        let cache = &backend.cache;
        assert!(cache.get_ttl("missing").await.unwrap().is_none());

        cache
            .set("k", CacheValue::Text("v".into()), Some(Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(cache.get_ttl("k").await.unwrap(), Some(None), "{}", backend.name);

        assert!(cache
            .set_ttl("k", Some(Duration::from_secs(120)))
            .await
            .unwrap());
        let remaining = cache.get_ttl("k").await.unwrap().unwrap().unwrap();
        assert!(remaining <= Duration::from_secs(120));
        assert!(remaining > Duration::from_secs(60));

        assert!(cache.set_ttl("k", None).await.unwrap());
        assert_eq!(cache.get_ttl("k").await.unwrap(), Some(None));

        assert!(!cache.set_ttl("missing", Some(Duration::from_secs(1))).await.unwrap());
    }
}

#[tokio::test]
async fn clear_truncates_everything() {
    for backend in backends() {
        let cache = &backend.cache;
        for i in 0..10 {
            cache
                .set(&format!("k{i}"), CacheValue::Text(i.to_string()), None)
                .await
                .unwrap();
        }
        cache.clear().await.unwrap();
        for i in 0..10 {
            assert!(!cache.exists(&format!("k{i}")).await.unwrap(), "{}", backend.name);
        }
        // The cache stays usable after a clear.
        cache.set("after", CacheValue::Text("1".into()), None).await.unwrap();
        assert!(cache.exists("after").await.unwrap());
    }
}
