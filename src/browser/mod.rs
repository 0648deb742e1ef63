//! Bounded pool of headless rendering contexts.
//!
//! One underlying Chrome instance (via chromiumoxide) serves a growable
//! set of reusable pages. A counting semaphore sized to
//! `max_concurrent_renders` mediates checkout; `acquire` suspends the
//! calling task until a slot frees. New contexts get anti-automation
//! overrides and advertising-domain request blocking before first use. A
//! background sweep closes contexts that sit free past the idle threshold,
//! bounding memory under bursty-then-quiet load.

mod pool;
mod stealth;

pub use pool::{BrowserPool, RenderLease};

use std::time::Duration;

/// Result of a navigation, alongside the lease holding the rendered page.
#[derive(Debug, Clone)]
pub struct PageInfo {
    pub title: Option<String>,
    pub final_url: String,
    /// Status of the main document response, when the browser reported
    /// one before navigation settled.
    pub http_status: Option<u16>,
    pub load_time: Duration,
}
