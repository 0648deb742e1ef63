//! Anti-automation fingerprinting and ad-domain blocking applied to every
//! new rendering context.

/// Script evaluated on every new document before page scripts run.
/// Overrides the flags bot-detection vendors probe first: the webdriver
/// marker, an empty plugin list and a missing language set.
pub(crate) const STEALTH_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
Object.defineProperty(navigator, 'plugins', {
    get: () => [
        { name: 'Chrome PDF Plugin' },
        { name: 'Chrome PDF Viewer' },
        { name: 'Native Client' },
    ],
});
window.chrome = window.chrome || { runtime: {} };
"#;

/// URL patterns blocked on every context when ad blocking is enabled.
pub(crate) fn blocked_url_patterns() -> Vec<String> {
    [
        "doubleclick.net",
        "googlesyndication.com",
        "googletagmanager.com",
        "google-analytics.com",
        "adservice.google.com",
        "amazon-adsystem.com",
        "adsystem.amazon.com",
        "taboola.com",
        "outbrain.com",
        "scorecardresearch.com",
        "quantserve.com",
        "adnxs.com",
        "criteo.com",
        "pubmatic.com",
        "rubiconproject.com",
    ]
    .iter()
    .map(|domain| format!("*{}*", domain))
    .collect()
}
