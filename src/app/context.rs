use std::sync::Arc;

use crate::app::{EstuaryError, Result};
use crate::browser::BrowserPool;
use crate::cache::{
    spawn_sweeper, Cache, FilesystemCache, MemoryCache, RedisCache, SqliteCache,
};
use crate::config::{CacheBackend, CacheConfig, Config};
use crate::processor::FetchClient;
use crate::sink::{EmbeddingClient, LogSink, VectorStore};

/// Long-lived handles shared by everything the process runs: the selected
/// cache backend, the browser pool when rendering is enabled, the
/// escalating fetch client and the delivery sinks.
pub struct AppContext {
    pub config: Config,
    pub cache: Option<Arc<dyn Cache>>,
    pub browser: Option<Arc<BrowserPool>>,
    pub fetch: Arc<FetchClient>,
    pub embeddings: Arc<dyn EmbeddingClient>,
    pub store: Arc<dyn VectorStore>,
    sweeper: Option<tokio::task::JoinHandle<()>>,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AppContext {
    pub async fn from_config(config: Config) -> Result<Self> {
        let cache = if config.cache.enabled {
            Some(build_cache(&config.cache).await?)
        } else {
            None
        };

        let sweeper = cache
            .as_ref()
            .map(|cache| spawn_sweeper(Arc::clone(cache), config.cache.sweep_interval()));

        let browser = if config.browser.enabled {
            let pool = BrowserPool::launch(config.browser.clone()).await?;
            Some(Arc::new(pool))
        } else {
            None
        };

        let fetch = Arc::new(FetchClient::new(&config.fetch, browser.clone())?);
        let sink = Arc::new(LogSink);

        Ok(Self {
            config,
            cache,
            browser,
            fetch,
            embeddings: sink.clone(),
            store: sink,
            sweeper,
        })
    }

    /// Release everything in dependency order: background tasks first,
    /// then the browser, then the cache backend. Safe to call more than
    /// once.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(sweeper) = &self.sweeper {
            sweeper.abort();
        }
        if let Some(browser) = &self.browser {
            if let Err(e) = browser.shutdown().await {
                tracing::warn!(error = %e, "browser pool shutdown failed");
            }
        }
        if let Some(cache) = &self.cache {
            cache.close().await?;
        }
        Ok(())
    }
}

async fn build_cache(config: &CacheConfig) -> Result<Arc<dyn Cache>> {
    let default_ttl = config.default_ttl();
    let cache: Arc<dyn Cache> = match config.backend {
        CacheBackend::Memory => Arc::new(MemoryCache::new(default_ttl)),
        CacheBackend::Filesystem => {
            let path = config.storage_path.as_ref().ok_or_else(|| {
                EstuaryError::Config("filesystem cache requires storage_path".into())
            })?;
            Arc::new(FilesystemCache::new(path, default_ttl)?)
        }
        CacheBackend::Relational => {
            let path = config.storage_path.as_ref().ok_or_else(|| {
                EstuaryError::Config("relational cache requires storage_path".into())
            })?;
            Arc::new(SqliteCache::new(path, default_ttl)?)
        }
        CacheBackend::RemoteKv => {
            let url = config.connection_string.as_ref().ok_or_else(|| {
                EstuaryError::Config("remote-kv cache requires connection_string".into())
            })?;
            Arc::new(RedisCache::connect(url, default_ttl).await?)
        }
    };
    tracing::info!(backend = ?config.backend, "cache backend ready");
    Ok(cache)
}
