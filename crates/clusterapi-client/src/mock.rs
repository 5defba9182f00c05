//! Mock ClusterApiClient for unit testing
//!
//! Records every delivery attempt in memory and can be scripted to fail,
//! to fail forever with a fixed status, or to stall until released.

use crate::clusterapi_trait::ClusterApiClientTrait;
use crate::error::ClusterApiError;
use crate::models::PodEvent;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Semaphore;

/// Scripted failure returned by the mock.
#[derive(Debug, Clone)]
pub enum MockFailure {
    /// Non-success HTTP status
    Status(u16),
    /// Request timeout
    Timeout,
    /// Connection reset
    ConnectionReset,
}

impl MockFailure {
    fn to_error(&self) -> ClusterApiError {
        match self {
            Self::Status(401 | 403) => ClusterApiError::Authentication("mock".to_string()),
            Self::Status(status) => ClusterApiError::Status {
                status: *status,
                body: "mock failure".to_string(),
            },
            Self::Timeout => ClusterApiError::Timeout("mock timeout".to_string()),
            Self::ConnectionReset => ClusterApiError::Connection("connection reset by peer".to_string()),
        }
    }
}

/// Mock ClusterApiClient for testing
#[derive(Debug, Clone)]
pub struct MockClusterApiClient {
    base_url: String,
    delivered: Arc<Mutex<Vec<PodEvent>>>,
    attempts: Arc<AtomicUsize>,
    scripted: Arc<Mutex<VecDeque<MockFailure>>>,
    always: Arc<Mutex<Option<MockFailure>>>,
    stalled: Arc<AtomicBool>,
    gate: Arc<Semaphore>,
    healthy: Arc<AtomicBool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockClusterApiClient {
    /// Create a new mock client that accepts every event
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            delivered: Arc::new(Mutex::new(Vec::new())),
            attempts: Arc::new(AtomicUsize::new(0)),
            scripted: Arc::new(Mutex::new(VecDeque::new())),
            always: Arc::new(Mutex::new(None)),
            stalled: Arc::new(AtomicBool::new(false)),
            gate: Arc::new(Semaphore::new(0)),
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Queue a failure for the next attempt (failures are consumed in order)
    pub fn fail_next(&self, failure: MockFailure) {
        lock(&self.scripted).push_back(failure);
    }

    /// Fail every attempt with the given failure until cleared
    pub fn fail_always(&self, failure: Option<MockFailure>) {
        *lock(&self.always) = failure;
    }

    /// Block every delivery attempt until [`MockClusterApiClient::release`] is called
    pub fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    /// Let `n` stalled attempts proceed
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Stop stalling and let every waiting attempt proceed
    pub fn unstall(&self) {
        self.stalled.store(false, Ordering::SeqCst);
        self.gate.add_permits(1 << 16);
    }

    /// Control the health check result
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Events accepted so far, in delivery order
    pub fn delivered(&self) -> Vec<PodEvent> {
        lock(&self.delivered).clone()
    }

    /// Number of delivery attempts, successful or not
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ClusterApiClientTrait for MockClusterApiClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn health_check(&self) -> Result<(), ClusterApiError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ClusterApiError::Connection("mock unhealthy".to_string()))
        }
    }

    async fn send_pod_event(&self, event: &PodEvent) -> Result<(), ClusterApiError> {
        if self.stalled.load(Ordering::SeqCst) {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }

        self.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(failure) = lock(&self.scripted).pop_front() {
            return Err(failure.to_error());
        }
        if let Some(failure) = lock(&self.always).as_ref() {
            return Err(failure.to_error());
        }

        lock(&self.delivered).push(event.clone());
        Ok(())
    }
}
