use sha2::{Digest, Sha256};

/// A cheap, non-cryptographic summary of a feed's current state, used to
/// skip redundant parsing when the upstream content has not changed.
///
/// Computed from the most stable identifier the feed offers: newest entry
/// id, else its link, else its title, else the feed-level updated
/// timestamp, else a digest of the raw bytes. Best-effort change detection
/// only; collisions are an accepted risk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Fingerprint built from a stable feed marker, tagged with where the
    /// marker came from so values from different sources never collide.
    pub fn from_marker(kind: &str, value: &str) -> Self {
        Self(format!("{}:{}", kind, value))
    }

    /// Last-resort fingerprint: digest of the raw fetched bytes.
    pub fn digest(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(format!("digest:{}", hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for Fingerprint {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
