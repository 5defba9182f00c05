//! Controller-specific error types.
//!
//! `ControllerError` is what leaves the process; the narrower enums below it
//! classify failures inside the watch pipeline and decide whether the watch
//! loop retries, resyncs, skips or gives up.

use clusterapi_client::ClusterApiError;
use kube::Error as KubeError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors that terminate the Pod Phase Watcher.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error while building clients
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Kubeconfig could not be loaded for a cluster
    #[error("Kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    /// clusterapi client could not be created
    #[error("clusterapi error: {0}")]
    ClusterApi(#[from] ClusterApiError),

    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A watch loop gave up
    #[error("Watch for cluster {cluster} failed after {attempts} attempt(s): {source}")]
    Fatal {
        /// Cluster the watch loop was serving
        cluster: String,
        /// Consecutive failed attempts before giving up
        attempts: u32,
        /// Last error seen
        #[source]
        source: WatchError,
    },

    /// A watch task panicked or was aborted
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Probe server failed
    #[error("Probe server error: {0}")]
    Probe(#[from] std::io::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Failures of the cluster collaborator (LIST and WATCH).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WatchError {
    /// The checkpoint is too old for the server to resume from (HTTP 410)
    #[error("resourceVersion too old: {0}")]
    Gone(String),

    /// The API server rejected our credentials
    #[error("Kubernetes API rejected the request ({code}): {message}")]
    Unauthorized {
        /// HTTP status code
        code: u16,
        /// Server message
        message: String,
    },

    /// Connection, stream or server-side failure
    #[error("transport error: {0}")]
    Transport(String),
}

impl WatchError {
    /// Maps a kube client error onto the watch taxonomy.
    pub fn from_kube(err: KubeError) -> Self {
        match err {
            KubeError::Api(resp) if resp.code == 410 => Self::Gone(resp.message.clone()),
            KubeError::Api(resp) if resp.code == 401 || resp.code == 403 => Self::Unauthorized {
                code: resp.code,
                message: resp.message.clone(),
            },
            other => Self::Transport(other.to_string()),
        }
    }

    /// Maps an in-stream `ERROR` watch event onto the watch taxonomy.
    pub fn from_status(code: u16, message: String) -> Self {
        match code {
            410 => Self::Gone(message),
            401 | 403 => Self::Unauthorized { code, message },
            _ => Self::Transport(format!("watch error event ({code}): {message}")),
        }
    }

    /// Whether the watch loop should back off and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// A raw notification that cannot be turned into a pod observation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// `metadata.uid` is missing or empty
    #[error("pod {0} has no metadata.uid")]
    MissingUid(String),

    /// `status.phase` is missing or empty
    #[error("pod {0} has no status.phase")]
    MissingPhase(String),
}

/// Permanent failure to deliver a pod event.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// clusterapi rejected the event
    #[error("delivery of {key} rejected on attempt {attempts}: {source}")]
    Permanent {
        /// Idempotency key of the event
        key: String,
        /// Attempt on which the event was rejected
        attempts: u32,
        /// Last transport error
        #[source]
        source: ClusterApiError,
    },

    /// Every retry failed
    #[error("delivery of {key} gave up after {attempts} attempt(s): {source}")]
    Exhausted {
        /// Idempotency key of the event
        key: String,
        /// Attempts made
        attempts: u32,
        /// Last transport error
        #[source]
        source: ClusterApiError,
    },
}

/// The notification queue no longer accepts events (shutdown in progress).
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("notification queue is closed")]
pub struct QueueClosed;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_error_classification() {
        assert_eq!(
            WatchError::from_status(410, "too old resource version".to_string()),
            WatchError::Gone("too old resource version".to_string())
        );
        assert!(!WatchError::from_status(403, "forbidden".to_string()).is_retryable());
        assert!(WatchError::from_status(500, "etcd timeout".to_string()).is_retryable());
        assert!(WatchError::Transport("connection reset".to_string()).is_retryable());
        assert!(!WatchError::Gone(String::new()).is_retryable());
    }
}
