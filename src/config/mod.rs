//! Configuration management.
//!
//! Configuration is read from `~/.config/estuary/config.toml` at startup,
//! or from an explicit path passed on the command line. If the default
//! file doesn't exist, one is created with commented defaults. Invalid
//! configuration is fatal: the process refuses to serve any feed.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::domain::FeedSource;

/// Main configuration struct.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub feeds: Vec<FeedSource>,
    pub cache: CacheConfig,
    pub browser: BrowserConfig,
    pub fetch: FetchConfig,
    pub scheduler: SchedulerConfig,
}

/// Cache backend selection and TTL defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub backend: CacheBackend,
    /// Default TTL applied when a `set` omits one. Zero means no expiry.
    pub ttl_hours: u64,
    /// Base directory for the filesystem backend, database path for the
    /// relational backend.
    pub storage_path: Option<PathBuf>,
    /// Connection string for the remote-kv backend.
    pub connection_string: Option<String>,
    /// Seconds between background expiry sweeps.
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: CacheBackend::Memory,
            ttl_hours: 24,
            storage_path: None,
            connection_string: None,
            sweep_interval_secs: 300,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Option<Duration> {
        if self.ttl_hours == 0 {
            None
        } else {
            Some(Duration::from_secs(self.ttl_hours * 3600))
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CacheBackend {
    #[default]
    Memory,
    Filesystem,
    /// Remote key-value store (redis).
    RemoteKv,
    /// Relational table (SQLite).
    Relational,
}

/// Headless browser pool settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// When false, no pool is constructed and fetch escalation is
    /// unavailable; bot-detected feeds simply fail for the cycle.
    pub enabled: bool,
    pub headless: bool,
    /// Rendering engine. Only "chromium" is supported.
    pub engine: String,
    pub timeout_seconds: u64,
    pub viewport: ViewportConfig,
    pub wait_until: WaitUntil,
    pub screenshot: ScreenshotConfig,
    /// Apply anti-automation-detection overrides to new contexts.
    pub stealth_enabled: bool,
    /// Install request blocking for known advertising domains.
    pub ad_block_enabled: bool,
    pub max_concurrent_renders: usize,
    /// Contexts free for longer than this are closed by the idle sweep.
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Render each discovered post and attach the captured article.
    pub capture_articles: bool,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            headless: true,
            engine: "chromium".to_string(),
            timeout_seconds: 30,
            viewport: ViewportConfig::default(),
            wait_until: WaitUntil::Load,
            screenshot: ScreenshotConfig::default(),
            stealth_enabled: true,
            ad_block_enabled: true,
            max_concurrent_renders: 5,
            idle_timeout_secs: 300,
            sweep_interval_secs: 60,
            capture_articles: false,
        }
    }
}

impl BrowserConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ViewportConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 800,
        }
    }
}

/// Page readiness condition for renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WaitUntil {
    #[default]
    Load,
    Dom,
    NetworkIdle,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScreenshotConfig {
    /// "png" or "jpeg".
    pub format: String,
    pub full_page: bool,
}

impl Default for ScreenshotConfig {
    fn default() -> Self {
        Self {
            format: "png".to_string(),
            full_page: true,
        }
    }
}

/// Plain-HTTP fetch settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    /// Retry attempts for transient errors and 429 responses.
    pub max_retries: u32,
    /// Response bodies larger than this are rejected.
    pub max_body_bytes: usize,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 3,
            max_body_bytes: 10 * 1024 * 1024,
            user_agent: format!("estuary/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Orchestrator-level concurrency bounds. These are independent dials from
/// the render pool's own semaphore.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Global bound on concurrent feed-poll tasks.
    pub max_concurrent_polls: usize,
    /// Per-feed bound on concurrent article-capture tasks.
    pub max_concurrent_captures: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_polls: 8,
            max_concurrent_captures: 3,
        }
    }
}

impl Config {
    /// Load configuration from the default path, creating a commented
    /// default file if none exists.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::default_config_path()?;

        if !config_path.exists() {
            Self::create_default_config(&config_path)?;
            return Ok(Self::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the default config file path: `~/.config/estuary/config.toml`
    pub fn default_config_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join("estuary").join("config.toml"))
    }

    /// Startup validation. Any failure here is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = std::collections::HashSet::new();
        for feed in &self.feeds {
            if feed.name.is_empty() {
                return Err(ConfigError::Invalid("feed with empty name".into()));
            }
            if !names.insert(feed.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate feed name: {}",
                    feed.name
                )));
            }
            Url::parse(&feed.url)
                .map_err(|e| ConfigError::Invalid(format!("feed {}: bad url: {}", feed.name, e)))?;
            if feed.check_interval_minutes == 0 {
                return Err(ConfigError::Invalid(format!(
                    "feed {}: check_interval_minutes must be at least 1",
                    feed.name
                )));
            }
        }

        match self.cache.backend {
            CacheBackend::Filesystem | CacheBackend::Relational => {
                if self.cache.enabled && self.cache.storage_path.is_none() {
                    return Err(ConfigError::Invalid(
                        "cache backend requires storage_path".into(),
                    ));
                }
            }
            CacheBackend::RemoteKv => {
                if self.cache.enabled && self.cache.connection_string.is_none() {
                    return Err(ConfigError::Invalid(
                        "remote-kv cache backend requires connection_string".into(),
                    ));
                }
            }
            CacheBackend::Memory => {}
        }

        if self.browser.enabled {
            if self.browser.engine != "chromium" {
                return Err(ConfigError::Invalid(format!(
                    "unsupported browser engine: {}",
                    self.browser.engine
                )));
            }
            if self.browser.max_concurrent_renders == 0 {
                return Err(ConfigError::Invalid(
                    "max_concurrent_renders must be at least 1".into(),
                ));
            }
            match self.browser.screenshot.format.as_str() {
                "png" | "jpeg" => {}
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "unsupported screenshot format: {}",
                        other
                    )));
                }
            }
        }

        if self.scheduler.max_concurrent_polls == 0 || self.scheduler.max_concurrent_captures == 0 {
            return Err(ConfigError::Invalid(
                "scheduler concurrency bounds must be at least 1".into(),
            ));
        }

        Ok(())
    }

    fn create_default_config(path: &PathBuf) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let mut file = fs::File::create(path).map_err(|e| ConfigError::Io {
            path: path.clone(),
            source: e,
        })?;

        file.write_all(Self::default_config_content().as_bytes())
            .map_err(|e| ConfigError::Io {
                path: path.clone(),
                source: e,
            })?;

        Ok(())
    }

    /// Generate the default config file content with comments.
    fn default_config_content() -> String {
        r##"# Estuary configuration
#
# Each [[feeds]] block declares one polled source. Feeds are polled on
# independent schedules; disable one with `enabled = false`.

# [[feeds]]
# name = "rust-blog"
# url = "https://blog.rust-lang.org/feed.xml"
# check_interval_minutes = 60
# max_posts_per_check = 10
# enabled = true
# [feeds.headers]
# "X-Requested-With" = "estuary"

[cache]
enabled = true
# One of: memory, filesystem, remote-kv, relational
backend = "memory"
# Default TTL for entries written without one (0 = never expire)
ttl_hours = 24
# Required for filesystem and relational backends
# storage_path = "/var/lib/estuary/cache"
# Required for the remote-kv backend
# connection_string = "redis://127.0.0.1/"
# Seconds between background expiry sweeps
sweep_interval_secs = 300

[browser]
# Enable the headless rendering pool (fetch escalation + article capture)
enabled = false
headless = true
engine = "chromium"
timeout_seconds = 30
# One of: load, dom, network-idle
wait_until = "load"
stealth_enabled = true
ad_block_enabled = true
max_concurrent_renders = 5
# Contexts idle longer than this are closed by the background sweep
idle_timeout_secs = 300
sweep_interval_secs = 60
# Render each discovered post and attach the captured article content
capture_articles = false

[browser.viewport]
width = 1280
height = 800

[browser.screenshot]
format = "png"
full_page = true

[fetch]
timeout_secs = 30
max_retries = 3
max_body_bytes = 10485760

[scheduler]
max_concurrent_polls = 8
max_concurrent_captures = 3
"##
        .to_string()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Failed to read/write config file at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for crate::app::EstuaryError {
    fn from(e: ConfigError) -> Self {
        crate::app::EstuaryError::Config(e.to_string())
    }
}
