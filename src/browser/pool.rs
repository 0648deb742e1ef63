use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chromiumoxide::browser::{Browser, BrowserConfig as ChromeConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams as NetworkEnableParams, EventResponseReceived, ResourceType, SetBlockedUrLsParams,
};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, EventDomContentEventFired,
};
use chromiumoxide::page::{Page, ScreenshotParams};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use futures::StreamExt;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::app::{EstuaryError, Result};
use crate::browser::stealth::{blocked_url_patterns, STEALTH_SCRIPT};
use crate::browser::PageInfo;
use crate::config::{BrowserConfig, WaitUntil};

/// A pooled rendering context.
struct PooledContext {
    id: u64,
    page: Page,
    in_use: bool,
    last_used_at: Instant,
}

struct PoolInner {
    browser: Mutex<Option<Browser>>,
    contexts: Mutex<Vec<PooledContext>>,
    semaphore: Arc<Semaphore>,
    config: BrowserConfig,
    next_id: AtomicU64,
    shut_down: AtomicBool,
    handler_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    sweep_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Bounded pool of headless rendering contexts over one Chrome instance.
#[derive(Clone)]
pub struct BrowserPool {
    inner: Arc<PoolInner>,
}

/// A checked-out rendering context. Owned exclusively by the caller; the
/// context returns to the pool's free set when the lease drops. A failed
/// navigation discards the context instead, so no broken page is reused.
pub struct RenderLease {
    id: u64,
    page: Page,
    pool: Weak<PoolInner>,
    discarded: bool,
    _permit: OwnedSemaphorePermit,
}

impl RenderLease {
    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Tear down this context entirely: remove it from the pool and close
    /// the underlying page.
    pub async fn discard(mut self) {
        self.discarded = true;
        if let Some(inner) = self.pool.upgrade() {
            let mut contexts = inner.contexts.lock().await;
            if let Some(pos) = contexts.iter().position(|c| c.id == self.id) {
                let ctx = contexts.remove(pos);
                drop(contexts);
                if let Err(e) = ctx.page.close().await {
                    tracing::debug!(error = %e, "failed to close discarded page");
                }
            }
        }
    }
}

impl Drop for RenderLease {
    fn drop(&mut self) {
        if self.discarded {
            return;
        }
        let Some(inner) = self.pool.upgrade() else {
            return;
        };
        let id = self.id;
        // Return the context to the free set. The permit releases with the
        // lease; marking free happens shortly after on the runtime.
        tokio::spawn(async move {
            let mut contexts = inner.contexts.lock().await;
            if let Some(ctx) = contexts.iter_mut().find(|c| c.id == id) {
                ctx.in_use = false;
                ctx.last_used_at = Instant::now();
            }
        });
    }
}

impl BrowserPool {
    /// Launch the underlying browser and start the idle sweep.
    pub async fn launch(config: BrowserConfig) -> Result<Self> {
        let mut builder = ChromeConfig::builder()
            .window_size(config.viewport.width, config.viewport.height)
            .request_timeout(config.timeout())
            .arg("--no-sandbox")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-software-rasterizer");

        if !config.headless {
            builder = builder.with_head();
        }

        let chrome_config = builder
            .build()
            .map_err(|e| EstuaryError::Render(format!("failed to build browser config: {}", e)))?;

        let (browser, mut handler) = Browser::launch(chrome_config).await.map_err(|e| {
            EstuaryError::Render(format!(
                "failed to launch browser: {}. Is Chrome or Chromium installed and in PATH?",
                e
            ))
        })?;

        let handler_task = tokio::spawn(async move {
            while let Some(_event) = handler.next().await {
                // Drive the browser websocket.
            }
        });

        let max_renders = config.max_concurrent_renders;
        let inner = Arc::new(PoolInner {
            browser: Mutex::new(Some(browser)),
            contexts: Mutex::new(Vec::new()),
            semaphore: Arc::new(Semaphore::new(max_renders)),
            config,
            next_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
            handler_task: std::sync::Mutex::new(Some(handler_task)),
            sweep_task: std::sync::Mutex::new(None),
        });

        let sweep = Self::spawn_idle_sweep(Arc::downgrade(&inner));
        *inner.sweep_task.lock().expect("sweep handle lock") = Some(sweep);

        Ok(Self { inner })
    }

    /// Check out a rendering context, suspending until a slot frees. An
    /// existing free context is reused in preference to creating one.
    pub async fn acquire(&self) -> Result<RenderLease> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(EstuaryError::Render("browser pool is shut down".into()));
        }

        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EstuaryError::Render("browser pool is shut down".into()))?;

        {
            let mut contexts = self.inner.contexts.lock().await;
            if let Some(ctx) = contexts.iter_mut().find(|c| !c.in_use) {
                ctx.in_use = true;
                ctx.last_used_at = Instant::now();
                return Ok(RenderLease {
                    id: ctx.id,
                    page: ctx.page.clone(),
                    pool: Arc::downgrade(&self.inner),
                    discarded: false,
                    _permit: permit,
                });
            }
        }

        let page = self.create_context_page().await?;
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.contexts.lock().await.push(PooledContext {
            id,
            page: page.clone(),
            in_use: true,
            last_used_at: Instant::now(),
        });

        Ok(RenderLease {
            id,
            page,
            pool: Arc::downgrade(&self.inner),
            discarded: false,
            _permit: permit,
        })
    }

    /// Navigate a fresh lease to `url` with the pool's configured
    /// readiness condition and timeout.
    pub async fn render(&self, url: &str) -> Result<(RenderLease, PageInfo)> {
        let wait_until = self.inner.config.wait_until;
        let timeout = self.inner.config.timeout();
        self.render_with(url, wait_until, timeout).await
    }

    /// Navigate with explicit readiness condition and timeout. On failure
    /// the context is torn down before the error propagates; no page
    /// leaks.
    pub async fn render_with(
        &self,
        url: &str,
        wait_until: WaitUntil,
        timeout: Duration,
    ) -> Result<(RenderLease, PageInfo)> {
        let lease = self.acquire().await?;
        match self.navigate(&lease, url, wait_until, timeout).await {
            Ok(info) => Ok((lease, info)),
            Err(e) => {
                lease.discard().await;
                Err(e)
            }
        }
    }

    /// Render a URL and return its serialized DOM. Used by fetch
    /// escalation when plain HTTP hit bot detection.
    pub async fn fetch_html(&self, url: &str) -> Result<String> {
        let (lease, info) = self.render(url).await?;
        tracing::debug!(
            url = %url,
            final_url = %info.final_url,
            status = ?info.http_status,
            "rendered page for escalated fetch"
        );
        match lease.page().content().await {
            Ok(html) => Ok(html),
            Err(e) => {
                lease.discard().await;
                Err(EstuaryError::Render(format!(
                    "failed to read rendered document: {}",
                    e
                )))
            }
        }
    }

    /// Capture the leased page to `path`. The pool closes the owning
    /// context's pages at shutdown even if the caller forgets the lease.
    pub async fn screenshot(
        &self,
        lease: &RenderLease,
        path: impl AsRef<Path>,
        full_page: bool,
    ) -> Result<PathBuf> {
        let format = match self.inner.config.screenshot.format.as_str() {
            "jpeg" => CaptureScreenshotFormat::Jpeg,
            _ => CaptureScreenshotFormat::Png,
        };
        let params = ScreenshotParams::builder()
            .format(format)
            .full_page(full_page)
            .build();

        let path = path.as_ref();
        lease
            .page()
            .save_screenshot(params, path)
            .await
            .map_err(|e| EstuaryError::Render(format!("screenshot failed: {}", e)))?;
        Ok(path.to_path_buf())
    }

    /// Number of contexts currently held by the pool (free or leased).
    pub async fn context_count(&self) -> usize {
        self.inner.contexts.lock().await.len()
    }

    /// Cancel the sweep, close every context (all their pages first), then
    /// the underlying browser. Idempotent: the second call is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(task) = self.inner.sweep_task.lock().expect("sweep handle lock").take() {
            task.abort();
        }

        self.inner.semaphore.close();

        let contexts: Vec<PooledContext> = {
            let mut guard = self.inner.contexts.lock().await;
            guard.drain(..).collect()
        };
        for ctx in contexts {
            if let Err(e) = ctx.page.close().await {
                tracing::debug!(error = %e, "failed to close pooled page during shutdown");
            }
        }

        if let Some(mut browser) = self.inner.browser.lock().await.take() {
            if let Err(e) = browser.close().await {
                tracing::warn!(error = %e, "browser close failed");
            }
            if let Err(e) = browser.wait().await {
                tracing::debug!(error = %e, "browser process wait failed");
            }
        }

        if let Some(task) = self
            .inner
            .handler_task
            .lock()
            .expect("handler handle lock")
            .take()
        {
            task.abort();
        }

        Ok(())
    }

    async fn navigate(
        &self,
        lease: &RenderLease,
        url: &str,
        wait_until: WaitUntil,
        timeout: Duration,
    ) -> Result<PageInfo> {
        let page = lease.page();
        let started = Instant::now();

        let mut responses = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(|e| EstuaryError::Render(format!("event subscription failed: {}", e)))?;

        // Subscribed before goto so the event cannot slip past between
        // navigation start and the wait below.
        let dom_events = if wait_until == WaitUntil::Dom {
            Some(
                page.event_listener::<EventDomContentEventFired>()
                    .await
                    .map_err(|e| {
                        EstuaryError::Render(format!("event subscription failed: {}", e))
                    })?,
            )
        } else {
            None
        };

        tokio::time::timeout(timeout, page.goto(url))
            .await
            .map_err(|_| EstuaryError::Render(format!("navigation timed out: {}", url)))?
            .map_err(|e| EstuaryError::Render(format!("navigation failed: {}", e)))?;

        match dom_events {
            // Dom readiness: DOMContentLoaded is enough, subresources may
            // still be loading.
            Some(mut events) => {
                tokio::time::timeout(timeout, events.next())
                    .await
                    .map_err(|_| EstuaryError::Render(format!("navigation timed out: {}", url)))?
                    .ok_or_else(|| {
                        EstuaryError::Render(format!("navigation failed: {}", url))
                    })?;
            }
            // Load and NetworkIdle both wait for the load event first.
            None => {
                tokio::time::timeout(timeout, page.wait_for_navigation())
                    .await
                    .map_err(|_| EstuaryError::Render(format!("navigation timed out: {}", url)))?
                    .map_err(|e| EstuaryError::Render(format!("navigation failed: {}", e)))?;
            }
        }

        if wait_until == WaitUntil::NetworkIdle {
            // The load event fired; give straggling requests a beat.
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        // Best-effort: the main document response usually arrived while we
        // waited for the load event.
        let mut http_status = None;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(250), responses.next()).await
        {
            if event.r#type == ResourceType::Document {
                http_status = Some(event.response.status as u16);
                break;
            }
        }

        let title = page
            .get_title()
            .await
            .map_err(|e| EstuaryError::Render(format!("failed to read title: {}", e)))?;
        let final_url = page
            .url()
            .await
            .map_err(|e| EstuaryError::Render(format!("failed to read url: {}", e)))?
            .unwrap_or_else(|| url.to_string());

        Ok(PageInfo {
            title,
            final_url,
            http_status,
            load_time: started.elapsed(),
        })
    }

    /// Create and prepare a new context page.
    async fn create_context_page(&self) -> Result<Page> {
        let browser_guard = self.inner.browser.lock().await;
        let browser = browser_guard
            .as_ref()
            .ok_or_else(|| EstuaryError::Render("browser pool is shut down".into()))?;

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| EstuaryError::Render(format!("failed to create page: {}", e)))?;
        drop(browser_guard);

        if self.inner.config.stealth_enabled {
            let params = AddScriptToEvaluateOnNewDocumentParams::builder()
                .source(STEALTH_SCRIPT)
                .build()
                .map_err(|e| EstuaryError::Render(format!("stealth script params: {}", e)))?;
            page.execute(params)
                .await
                .map_err(|e| EstuaryError::Render(format!("failed to install stealth: {}", e)))?;
        }

        if self.inner.config.ad_block_enabled {
            page.execute(NetworkEnableParams::default())
                .await
                .map_err(|e| EstuaryError::Render(format!("failed to enable network: {}", e)))?;
            let params = SetBlockedUrLsParams::builder()
                .urls(blocked_url_patterns())
                .build()
                .map_err(|e| EstuaryError::Render(format!("blocked url params: {}", e)))?;
            page.execute(params)
                .await
                .map_err(|e| EstuaryError::Render(format!("failed to install ad block: {}", e)))?;
        }

        Ok(page)
    }

    fn spawn_idle_sweep(inner: Weak<PoolInner>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (interval, idle_after) = match inner.upgrade() {
                Some(strong) => (strong.config.sweep_interval(), strong.config.idle_timeout()),
                None => return,
            };

            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            timer.tick().await;

            loop {
                timer.tick().await;
                let Some(strong) = inner.upgrade() else {
                    return;
                };
                if strong.shut_down.load(Ordering::SeqCst) {
                    return;
                }

                let now = Instant::now();
                let stale: Vec<PooledContext> = {
                    let mut contexts = strong.contexts.lock().await;
                    let mut stale = Vec::new();
                    let mut i = 0;
                    while i < contexts.len() {
                        let ctx = &contexts[i];
                        if should_reap(ctx.in_use, now.duration_since(ctx.last_used_at), idle_after)
                        {
                            stale.push(contexts.remove(i));
                        } else {
                            i += 1;
                        }
                    }
                    stale
                };

                for ctx in stale {
                    tracing::debug!(context_id = ctx.id, "closing idle rendering context");
                    if let Err(e) = ctx.page.close().await {
                        tracing::debug!(error = %e, "failed to close idle page");
                    }
                }
            }
        })
    }
}

/// Whether the idle sweep should close a context.
fn should_reap(in_use: bool, idle_for: Duration, threshold: Duration) -> bool {
    !in_use && idle_for >= threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leased_contexts_are_never_reaped() {
        assert!(!should_reap(true, Duration::from_secs(3600), Duration::from_secs(300)));
    }

    #[test]
    fn test_fresh_free_contexts_survive() {
        assert!(!should_reap(false, Duration::from_secs(10), Duration::from_secs(300)));
    }

    #[test]
    fn test_stale_free_contexts_are_reaped() {
        assert!(should_reap(false, Duration::from_secs(301), Duration::from_secs(300)));
    }
}
