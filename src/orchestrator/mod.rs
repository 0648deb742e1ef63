//! Recurring per-feed jobs and the delivery pipeline.
//!
//! Each enabled feed runs its own interval loop: `Idle → Discovering →
//! (CapturingArticles) → Dispatching → Idle`. A tick arriving while the
//! previous run is still in flight is skipped, not queued. A global
//! semaphore bounds concurrent feed polls; article capture has its own
//! independent bound. Shutdown is cooperative: a watch channel cancels the
//! feed loops, then the browser pool closes, then the cache.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{watch, RwLock, Semaphore};
use tokio::time::MissedTickBehavior;

use crate::app::{AppContext, EstuaryError, Result};
use crate::discovery::Discovery;
use crate::domain::DiscoveredPost;
use crate::processor::{detect_kind, make_processor, FeedProcessor, MISDETECTION_THRESHOLD};

/// Counts for one completed poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleMetrics {
    /// New posts surfaced by discovery.
    pub discovered: usize,
    /// Posts delivered downstream.
    pub succeeded: usize,
    /// Posts dropped by capture or dispatch failures.
    pub failed: usize,
}

/// Mutable per-feed scheduling state.
struct FeedJob {
    source: crate::domain::FeedSource,
    /// Swapped out when repeated parse failures trigger re-detection.
    processor: RwLock<Arc<dyn FeedProcessor>>,
    in_flight: AtomicBool,
    parse_failures: AtomicU32,
}

impl FeedJob {
    /// Record a pass's parse result; returns true when the consecutive
    /// failure count has reached the re-detection threshold.
    fn note_parse_result(&self, parse_failed: bool) -> bool {
        if parse_failed {
            let failures = self.parse_failures.fetch_add(1, Ordering::SeqCst) + 1;
            failures >= MISDETECTION_THRESHOLD
        } else {
            self.parse_failures.store(0, Ordering::SeqCst);
            false
        }
    }
}

pub struct Orchestrator {
    ctx: Arc<AppContext>,
    discovery: Arc<Discovery>,
}

impl Orchestrator {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        let discovery = Arc::new(Discovery::new(ctx.cache.clone()));
        Self { ctx, discovery }
    }

    /// Run every enabled feed on its schedule until SIGINT/SIGTERM, then
    /// shut the runtime down in order.
    pub async fn run(&self) -> Result<()> {
        let jobs = self.build_jobs().await;
        if jobs.is_empty() {
            return Err(EstuaryError::Config(
                "no enabled feeds configured".to_string(),
            ));
        }

        let poll_sem = Arc::new(Semaphore::new(
            self.ctx.config.scheduler.max_concurrent_polls.max(1),
        ));
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            let ctx = Arc::clone(&self.ctx);
            let discovery = Arc::clone(&self.discovery);
            let poll_sem = Arc::clone(&poll_sem);
            let stop_rx = stop_rx.clone();
            handles.push(tokio::spawn(feed_loop(ctx, job, discovery, poll_sem, stop_rx)));
        }

        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received, stopping feed loops");
        let _ = stop_tx.send(true);
        join_all(handles).await;

        self.ctx.shutdown().await
    }

    /// Single-shot discovery for one named feed.
    pub async fn run_once(&self, feed_name: &str) -> Result<CycleMetrics> {
        let source = self
            .ctx
            .config
            .feeds
            .iter()
            .find(|f| f.name == feed_name)
            .cloned()
            .ok_or_else(|| {
                EstuaryError::Config(format!("no feed named {:?} configured", feed_name))
            })?;

        let kind = detect_kind(&source, &self.ctx.fetch).await;
        let job = Arc::new(FeedJob {
            processor: RwLock::new(make_processor(kind, source.clone())),
            source,
            in_flight: AtomicBool::new(false),
            parse_failures: AtomicU32::new(0),
        });

        Ok(poll_once(&self.ctx, &job, &self.discovery).await)
    }

    async fn build_jobs(&self) -> Vec<Arc<FeedJob>> {
        let mut jobs = Vec::new();
        for source in &self.ctx.config.feeds {
            if !source.enabled {
                tracing::debug!(feed = %source.name, "feed disabled, skipping");
                continue;
            }
            let kind = detect_kind(source, &self.ctx.fetch).await;
            tracing::info!(feed = %source.name, %kind, interval_min = source.check_interval_minutes, "scheduling feed");
            jobs.push(Arc::new(FeedJob {
                processor: RwLock::new(make_processor(kind, source.clone())),
                source: source.clone(),
                in_flight: AtomicBool::new(false),
                parse_failures: AtomicU32::new(0),
            }));
        }
        jobs
    }
}

async fn feed_loop(
    ctx: Arc<AppContext>,
    job: Arc<FeedJob>,
    discovery: Arc<Discovery>,
    poll_sem: Arc<Semaphore>,
    mut stop: watch::Receiver<bool>,
) {
    let period = Duration::from_secs(job.source.check_interval_minutes.max(1) * 60);
    let mut timer = tokio::time::interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = timer.tick() => {}
            _ = stop.changed() => break,
        }
        if *stop.borrow() {
            break;
        }

        if job.in_flight.swap(true, Ordering::SeqCst) {
            tracing::debug!(feed = %job.source.name, "previous poll still running, skipping tick");
            continue;
        }

        let permit = tokio::select! {
            permit = poll_sem.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    job.in_flight.store(false, Ordering::SeqCst);
                    break;
                }
            },
            _ = stop.changed() => {
                job.in_flight.store(false, Ordering::SeqCst);
                break;
            }
        };

        let metrics = poll_once(&ctx, &job, &discovery).await;
        drop(permit);
        job.in_flight.store(false, Ordering::SeqCst);

        tracing::info!(
            feed = %job.source.name,
            discovered = metrics.discovered,
            succeeded = metrics.succeeded,
            failed = metrics.failed,
            parse_failures = job.parse_failures.load(Ordering::SeqCst),
            "poll cycle finished"
        );
    }
    tracing::debug!(feed = %job.source.name, "feed loop stopped");
}

async fn poll_once(ctx: &Arc<AppContext>, job: &Arc<FeedJob>, discovery: &Discovery) -> CycleMetrics {
    let processor = Arc::clone(&*job.processor.read().await);
    let outcome = discovery.discover(&processor, &ctx.fetch).await;

    if !outcome.fetch_failed && job.note_parse_result(outcome.parse_failed) {
        redetect(ctx, job).await;
    }

    let discovered = outcome.posts.len();
    let posts = if ctx.config.browser.capture_articles && ctx.browser.is_some() {
        capture_posts(ctx, outcome.posts).await
    } else {
        outcome.posts
    };
    let captured = posts.len();

    let results = join_all(posts.into_iter().map(|post| deliver(ctx, post))).await;
    let succeeded = results.iter().filter(|r| r.is_ok()).count();

    CycleMetrics {
        discovered,
        succeeded,
        failed: (discovered - captured) + (captured - succeeded),
    }
}

/// Re-run format detection after repeated parse failures and swap the
/// feed's processor.
async fn redetect(ctx: &Arc<AppContext>, job: &Arc<FeedJob>) {
    let old_kind = job.processor.read().await.kind();
    let new_kind = detect_kind(&job.source, &ctx.fetch).await;
    tracing::warn!(
        feed = %job.source.name,
        %old_kind,
        %new_kind,
        "repeated parse failures, re-detected feed format"
    );
    *job.processor.write().await = make_processor(new_kind, job.source.clone());
    job.parse_failures.store(0, Ordering::SeqCst);
}

/// Render each post through the browser pool, bounded by the capture
/// semaphore. A post whose capture fails is dropped from the cycle.
async fn capture_posts(ctx: &Arc<AppContext>, posts: Vec<DiscoveredPost>) -> Vec<DiscoveredPost> {
    let sem = Arc::new(Semaphore::new(
        ctx.config.scheduler.max_concurrent_captures.max(1),
    ));

    let handles: Vec<_> = posts
        .into_iter()
        .map(|post| {
            let ctx = Arc::clone(ctx);
            let sem = Arc::clone(&sem);
            tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok()?;
                match capture_one(&ctx, post).await {
                    Ok(post) => Some(post),
                    Err((post, e)) => {
                        tracing::warn!(url = %post.url, error = %e, "article capture failed, dropping post");
                        None
                    }
                }
            })
        })
        .collect();

    join_all(handles)
        .await
        .into_iter()
        .filter_map(|joined| joined.ok().flatten())
        .collect()
}

async fn capture_one(
    ctx: &Arc<AppContext>,
    post: DiscoveredPost,
) -> std::result::Result<DiscoveredPost, (DiscoveredPost, EstuaryError)> {
    let Some(pool) = &ctx.browser else {
        return Err((post, EstuaryError::Render("no browser pool".to_string())));
    };

    let (lease, info) = match pool.render(&post.url).await {
        Ok(rendered) => rendered,
        Err(e) => return Err((post, e)),
    };
    let content = match lease.page().content().await {
        Ok(content) => content,
        Err(e) => return Err((post, EstuaryError::Render(e.to_string()))),
    };
    drop(lease);

    Ok(post
        .with_metadata("rendered_url", serde_json::json!(info.final_url))
        .with_metadata("http_status", serde_json::json!(info.http_status))
        .with_metadata(
            "load_time_ms",
            serde_json::json!(info.load_time.as_millis() as u64),
        )
        .with_metadata("content_html", serde_json::json!(content)))
}

/// Embed and upsert one post. An embedding failure degrades to an
/// unembedded upsert; only a store failure fails the post.
async fn deliver(ctx: &Arc<AppContext>, post: DiscoveredPost) -> Result<()> {
    let text = post
        .metadata
        .get("content_html")
        .and_then(|v| v.as_str())
        .or(post.summary.as_deref())
        .unwrap_or(&post.title);

    let embedding = match ctx.embeddings.embed_text(text).await {
        Ok(v) if !v.is_empty() => Some(v),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(id = %post.id, error = %e, "embedding failed, storing without vector");
            None
        }
    };

    ctx.store
        .upsert(&post, embedding.as_deref())
        .await
        .map_err(|e| {
            tracing::error!(id = %post.id, error = %e, "store upsert failed");
            e
        })
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
