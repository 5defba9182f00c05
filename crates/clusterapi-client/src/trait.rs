//! ClusterApiClient trait for mocking
//!
//! The pod watcher only depends on this trait, so the notifier can be driven
//! by [`crate::ClusterApiClient`] in production and by a mock in tests.

use crate::error::ClusterApiError;
use crate::models::PodEvent;

/// Notification transport to clusterapi.
///
/// Implementations own the endpoint URL, authentication, TLS and request
/// timeout, and classify their own failures via
/// [`ClusterApiError::is_retryable`].
#[async_trait::async_trait]
pub trait ClusterApiClientTrait: Send + Sync {
    /// Get the base URL
    fn base_url(&self) -> &str;

    /// Check that clusterapi is reachable
    async fn health_check(&self) -> Result<(), ClusterApiError>;

    /// Deliver a single pod event
    async fn send_pod_event(&self, event: &PodEvent) -> Result<(), ClusterApiError>;
}
