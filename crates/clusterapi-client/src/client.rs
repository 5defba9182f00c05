//! clusterapi HTTP client
//!
//! Implements the clusterapi REST calls used by the watcher:
//! `POST {base_url}{event_path}` for pod events and `GET {base_url}/health`.

use crate::clusterapi_trait::ClusterApiClientTrait;
use crate::error::ClusterApiError;
use crate::models::PodEvent;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

/// Default path of the pod event endpoint.
pub const DEFAULT_EVENT_PATH: &str = "/api/pods/update";

/// Header carrying [`PodEvent::idempotency_key`].
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

const MAX_ERROR_BODY: usize = 500;

/// clusterapi client
#[derive(Debug, Clone)]
pub struct ClusterApiClient {
    client: Client,
    base_url: String,
    event_path: String,
    token: Option<String>,
}

impl ClusterApiClient {
    /// Create a new clusterapi client
    ///
    /// # Arguments
    /// * `base_url` - clusterapi base URL (e.g., "http://clusterapi:3000")
    /// * `token` - Optional API key, sent as a bearer token
    /// * `timeout` - Per-request timeout
    pub fn new(base_url: String, token: Option<String>, timeout: Duration) -> Result<Self, ClusterApiError> {
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ClusterApiError::InvalidRequest(format!(
                "base URL must start with http:// or https://, got {base_url}"
            )));
        }

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            event_path: DEFAULT_EVENT_PATH.to_string(),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    /// Override the pod event endpoint path
    #[must_use]
    pub fn with_event_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.event_path = if path.starts_with('/') { path } else { format!("/{path}") };
        self
    }

    /// Full URL of the pod event endpoint
    pub fn event_url(&self) -> String {
        format!("{}{}", self.base_url, self.event_path)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Maps transport-level reqwest failures onto the retry taxonomy.
fn classify_transport(err: reqwest::Error) -> ClusterApiError {
    if err.is_timeout() {
        ClusterApiError::Timeout(err.to_string())
    } else if err.is_connect() {
        ClusterApiError::Connection(err.to_string())
    } else {
        ClusterApiError::Http(err)
    }
}

/// Maps a clusterapi response status onto success or an error.
fn classify_response(status: StatusCode, body: &str) -> Result<(), ClusterApiError> {
    if status.is_success() {
        return Ok(());
    }

    let body: String = body.chars().take(MAX_ERROR_BODY).collect();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ClusterApiError::Authentication(format!("{status} - {body}")));
    }

    Err(ClusterApiError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait::async_trait]
impl ClusterApiClientTrait for ClusterApiClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn health_check(&self) -> Result<(), ClusterApiError> {
        let url = format!("{}/health", self.base_url);
        debug!("Checking clusterapi health at {}", url);

        let response = self
            .authorized(self.client.get(&url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        classify_response(status, &body)
    }

    async fn send_pod_event(&self, event: &PodEvent) -> Result<(), ClusterApiError> {
        let url = self.event_url();
        debug!(
            "Calling clusterapi {} for pod {}/{} ({} -> {})",
            url,
            event.namespace,
            event.name,
            event.previous_phase.map_or("None", |p| p.as_str()),
            event.new_phase
        );

        let body = serde_json::to_vec(event)?;
        let response = self
            .authorized(self.client.post(&url))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, "application/json")
            .header(IDEMPOTENCY_HEADER, event.idempotency_key())
            .body(body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        classify_response(status, &body)
    }
}
