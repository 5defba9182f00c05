//! clusterapi client errors

use thiserror::Error;

/// Errors that can occur when talking to clusterapi
#[derive(Debug, Error)]
pub enum ClusterApiError {
    /// HTTP request/response error not covered by a more specific variant
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The request did not complete within the configured timeout
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The connection could not be established or was reset
    #[error("Connection error: {0}")]
    Connection(String),

    /// clusterapi answered with a non-success status
    #[error("clusterapi returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, truncated
        body: String,
    },

    /// Authentication failed (invalid or missing API key)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid request (e.g. malformed base URL)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ClusterApiError {
    /// Whether a retry of the same request can reasonably succeed.
    ///
    /// Timeouts, connection failures, 408, 429 and 5xx are retryable.
    /// Everything else, including other 4xx answers, is permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connection(_) => true,
            Self::Status { status, .. } => is_retryable_status(*status),
            Self::Http(e) => match e.status() {
                Some(status) => is_retryable_status(status.as_u16()),
                None => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            },
            Self::Authentication(_) | Self::Serialization(_) | Self::InvalidRequest(_) => false,
        }
    }
}

/// Status codes worth retrying.
pub fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..=599).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_errors_are_retryable() {
        for status in [500, 502, 503, 504] {
            let err = ClusterApiError::Status { status, body: String::new() };
            assert!(err.is_retryable(), "{status} should be retryable");
        }
    }

    #[test]
    fn test_throttling_is_retryable() {
        let err = ClusterApiError::Status { status: 429, body: "slow down".to_string() };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_client_errors_are_permanent() {
        for status in [400, 404, 409, 422] {
            let err = ClusterApiError::Status { status, body: String::new() };
            assert!(!err.is_retryable(), "{status} should be permanent");
        }
        assert!(!ClusterApiError::Authentication("401".to_string()).is_retryable());
    }

    #[test]
    fn test_transport_failures_are_retryable() {
        assert!(ClusterApiError::Timeout("30s".to_string()).is_retryable());
        assert!(ClusterApiError::Connection("connection reset by peer".to_string()).is_retryable());
    }
}
