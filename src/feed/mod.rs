pub mod itunes;
pub mod retry;

pub use itunes::ItunesFeed;
pub use retry::{FeedFetcher, RetryPolicy};

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Review, Target};

/// Failure of a single page fetch
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http {status} {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        /// First bytes of the response body, for diagnostics
        body: String,
    },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("request failed: {0}")]
    Network(String),

    #[error("failed to decode feed: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("page deadline exceeded")]
    DeadlineExceeded,

    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Classification sent to the alerting webhook
    pub fn error_type(&self) -> String {
        match self {
            FetchError::HttpStatus { status, .. } => format!("http_status_{}", status),
            FetchError::Timeout(_) | FetchError::DeadlineExceeded => "network_timeout".to_string(),
            _ => "network_error".to_string(),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(err.to_string())
        } else if err.is_decode() {
            FetchError::Network(format!("failed to read body: {}", err))
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

/// One page of a paginated review feed.
///
/// Implementations perform exactly one attempt; retries live in [`FeedFetcher`].
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch_page(&self, target: &Target, page: u32) -> Result<Vec<Review>, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let http = FetchError::HttpStatus {
            status: 503,
            url: "https://example.com".to_string(),
            body: String::new(),
        };
        assert_eq!(http.error_type(), "http_status_503");
        assert_eq!(FetchError::Timeout("slow".into()).error_type(), "network_timeout");
        assert_eq!(FetchError::DeadlineExceeded.error_type(), "network_timeout");
        assert_eq!(FetchError::Network("dns".into()).error_type(), "network_error");

        let decode = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(FetchError::from(decode).error_type(), "network_error");
    }
}
