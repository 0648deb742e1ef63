use thiserror::Error;

/// Error taxonomy for the ingestion engine.
///
/// The variants map onto distinct propagation policies: `Network` and
/// `BotDetection` drive the fetch escalation state machine, `Parse` allows
/// one heuristic fallback parse, `Render` aborts only the render in
/// progress, `Cache` degrades to a transparent miss, and `Config` is fatal
/// at startup.
#[derive(Error, Debug)]
pub enum EstuaryError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP status {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Bot detection suspected: {0}")]
    BotDetection(String),

    #[error("Feed parsing error: {0}")]
    Parse(String),

    #[error("Render error: {0}")]
    Render(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<rusqlite::Error> for EstuaryError {
    fn from(e: rusqlite::Error) -> Self {
        EstuaryError::Cache(e.to_string())
    }
}

impl From<redis::RedisError> for EstuaryError {
    fn from(e: redis::RedisError) -> Self {
        EstuaryError::Cache(e.to_string())
    }
}

impl EstuaryError {
    /// Whether a fetch failure should be retried on the exponential
    /// backoff schedule (connection failures, timeouts, 5xx).
    pub fn is_transient(&self) -> bool {
        match self {
            EstuaryError::Network(e) => e.is_timeout() || e.is_connect(),
            EstuaryError::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, EstuaryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_errors_are_transient() {
        let err = EstuaryError::HttpStatus {
            status: 503,
            url: "https://example.com/feed".into(),
        };
        assert!(err.is_transient());
    }

    #[test]
    fn test_client_errors_are_not_transient() {
        let err = EstuaryError::HttpStatus {
            status: 404,
            url: "https://example.com/feed".into(),
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn test_bot_detection_is_not_transient() {
        assert!(!EstuaryError::BotDetection("403 from upstream".into()).is_transient());
    }
}
