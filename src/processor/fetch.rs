//! Escalating HTTP fetch.
//!
//! Every fetch starts as a plain GET. Transient failures retry on an
//! exponential backoff schedule; 429 responses honor `Retry-After` when
//! present. Responses that look like bot mitigation (403, persistent 429,
//! challenge headers) escalate to a full browser render when a pool is
//! available, otherwise the fetch fails for the cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;

use crate::app::{EstuaryError, Result};
use crate::browser::BrowserPool;
use crate::config::FetchConfig;

/// Backoff never sleeps longer than this between attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Cap on how far in the future a `Retry-After` may push the next attempt.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

/// A fetched document plus how it was obtained.
#[derive(Debug, Clone)]
pub struct FetchedDoc {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    /// True when the body came from a browser render rather than a
    /// direct GET.
    pub via_render: bool,
}

/// Outcome of a single request attempt, classified for the retry loop.
enum AttemptOutcome {
    /// Worth retrying on the backoff schedule.
    Transient(EstuaryError),
    /// 429; carries the parsed `Retry-After` delay when the server sent one.
    RateLimited(Option<Duration>),
    /// Bot mitigation suspected; retrying over plain HTTP is pointless.
    BotDetected(String),
    /// Permanent for this cycle.
    Fatal(EstuaryError),
}

/// HTTP client with retry, rate-limit handling and browser escalation.
pub struct FetchClient {
    client: reqwest::Client,
    browser: Option<Arc<BrowserPool>>,
    max_retries: u32,
    max_body_bytes: usize,
}

impl FetchClient {
    pub fn new(config: &FetchConfig, browser: Option<Arc<BrowserPool>>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(&config.user_agent)
            .gzip(true)
            .brotli(true)
            .build()?;

        Ok(Self {
            client,
            browser,
            max_retries: config.max_retries,
            max_body_bytes: config.max_body_bytes,
        })
    }

    /// Client with no escalation path; bot-detected fetches fail outright.
    pub fn without_browser(config: &FetchConfig) -> Result<Self> {
        Self::new(config, None)
    }

    pub async fn fetch(&self, url: &str, headers: &HashMap<String, String>) -> Result<Vec<u8>> {
        Ok(self.fetch_detailed(url, headers).await?.bytes)
    }

    /// Fetch with escalation: direct GET first, browser render when the
    /// response looks like bot mitigation and a pool is available.
    pub async fn fetch_detailed(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<FetchedDoc> {
        match self.fetch_direct(url, headers).await {
            Ok(doc) => Ok(doc),
            Err(EstuaryError::BotDetection(reason)) => match &self.browser {
                Some(pool) => {
                    tracing::info!(%url, %reason, "escalating fetch to browser render");
                    let html = pool.fetch_html(url).await?;
                    Ok(FetchedDoc {
                        bytes: html.into_bytes(),
                        content_type: Some("text/html".to_string()),
                        via_render: true,
                    })
                }
                None => Err(EstuaryError::BotDetection(reason)),
            },
            Err(e) => Err(e),
        }
    }

    /// Direct GET with retry. Does not escalate.
    async fn fetch_direct(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<FetchedDoc> {
        let mut attempt: u32 = 0;
        loop {
            match self.send_once(url, headers).await {
                Ok(doc) => return Ok(doc),
                Err(AttemptOutcome::BotDetected(reason)) => {
                    return Err(EstuaryError::BotDetection(reason));
                }
                Err(AttemptOutcome::Fatal(e)) => return Err(e),
                Err(AttemptOutcome::RateLimited(retry_after)) => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        // Persistent throttling is treated the same as an
                        // explicit block.
                        return Err(EstuaryError::BotDetection(format!(
                            "rate limiting persisted after {} retries: {}",
                            self.max_retries, url
                        )));
                    }
                    let delay = retry_after.unwrap_or_else(|| backoff_delay(attempt));
                    tracing::debug!(%url, attempt, delay_ms = delay.as_millis() as u64, "rate limited, waiting");
                    tokio::time::sleep(delay).await;
                }
                Err(AttemptOutcome::Transient(e)) => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        return Err(e);
                    }
                    let delay = backoff_delay(attempt);
                    tracing::debug!(%url, attempt, error = %e, delay_ms = delay.as_millis() as u64, "transient fetch error, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn send_once(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> std::result::Result<FetchedDoc, AttemptOutcome> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| {
            let err = EstuaryError::Network(e);
            if err.is_transient() {
                AttemptOutcome::Transient(err)
            } else {
                AttemptOutcome::Fatal(err)
            }
        })?;

        let status = response.status();

        if let Some(signature) = challenge_signature(status, response.headers()) {
            return Err(AttemptOutcome::BotDetected(format!(
                "{} ({})",
                signature, url
            )));
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| parse_retry_after(v, Utc::now()));
            return Err(AttemptOutcome::RateLimited(retry_after));
        }

        if status == StatusCode::FORBIDDEN {
            return Err(AttemptOutcome::BotDetected(format!("403 from {}", url)));
        }

        if !status.is_success() {
            let err = EstuaryError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            };
            return Err(if err.is_transient() {
                AttemptOutcome::Transient(err)
            } else {
                AttemptOutcome::Fatal(err)
            });
        }

        if let Some(declared) = response.content_length() {
            if declared as usize > self.max_body_bytes {
                return Err(AttemptOutcome::Fatal(EstuaryError::Other(format!(
                    "response too large ({} bytes declared) from {}",
                    declared, url
                ))));
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = response.bytes().await.map_err(|e| {
            let err = EstuaryError::Network(e);
            if err.is_transient() {
                AttemptOutcome::Transient(err)
            } else {
                AttemptOutcome::Fatal(err)
            }
        })?;

        if bytes.len() > self.max_body_bytes {
            return Err(AttemptOutcome::Fatal(EstuaryError::Other(format!(
                "response too large ({} bytes) from {}",
                bytes.len(),
                url
            ))));
        }

        Ok(FetchedDoc {
            bytes: bytes.to_vec(),
            content_type,
            via_render: false,
        })
    }
}

/// Exponential backoff: 1s, 2s, 4s, ... capped at [`MAX_BACKOFF`].
fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(10);
    Duration::from_secs(1u64 << exp).min(MAX_BACKOFF)
}

/// Parse a `Retry-After` header: delta-seconds or an HTTP date. The result
/// is clamped to [`MAX_RETRY_AFTER`]; dates in the past yield zero.
fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs).min(MAX_RETRY_AFTER));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&Utc) - now;
    let secs = delta.num_seconds().max(0) as u64;
    Some(Duration::from_secs(secs).min(MAX_RETRY_AFTER))
}

/// Header-based bot-mitigation signatures, checked regardless of status.
fn challenge_signature(status: StatusCode, headers: &HeaderMap) -> Option<String> {
    if headers.contains_key("cf-mitigated") || headers.contains_key("cf-chl-bypass") {
        return Some("cloudflare challenge".to_string());
    }
    if headers.contains_key("x-datadome") || headers.contains_key("x-datadome-cid") {
        return Some("datadome challenge".to_string());
    }
    // A Cloudflare 503 interstitial identifies itself only via the Server
    // header.
    if status == StatusCode::SERVICE_UNAVAILABLE {
        let server = headers
            .get(reqwest::header::SERVER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if server.eq_ignore_ascii_case("cloudflare") {
            return Some("cloudflare 503 interstitial".to_string());
        }
    }
    None
}
