//! Event delivery to clusterapi.
//!
//! [`Notifier`] performs one logical delivery with retries. [`Dispatcher`]
//! decouples delivery from stream consumption: watch loops enqueue events
//! through a [`DispatchHandle`] and a fixed set of worker tasks deliver them.
//!
//! Events are sharded across workers by pod UID, so transitions of the same
//! pod are delivered in the order they were observed. At most `queue_bound`
//! events are queued or in flight at any time; once that many are
//! outstanding, [`DispatchHandle::dispatch`] waits for a slot instead of
//! dropping the event.

use clusterapi_client::{ClusterApiClientTrait, ClusterApiError, PodEvent};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::backoff::{RetryError, RetryPolicy};
use crate::error::{DeliveryError, QueueClosed};
use crate::metrics::Metrics;

/// Delivers pod events through the clusterapi transport.
pub struct Notifier {
    transport: Arc<dyn ClusterApiClientTrait>,
    policy: RetryPolicy,
    metrics: Metrics,
}

impl Notifier {
    /// Creates a notifier with the given transport and retry policy
    pub fn new(transport: Arc<dyn ClusterApiClientTrait>, policy: RetryPolicy, metrics: Metrics) -> Self {
        Self {
            transport,
            policy,
            metrics,
        }
    }

    /// Delivers `event`, retrying timeouts, connection failures, 429 and 5xx.
    ///
    /// Failures are logged and counted here; callers only need the result
    /// for tests and diagnostics.
    pub async fn notify(&self, event: &PodEvent) -> Result<(), DeliveryError> {
        let transport = &*self.transport;
        let retries = &self.metrics.delivery_retries;

        let result = self
            .policy
            .retry(
                move |attempt| {
                    if attempt > 0 {
                        retries.inc();
                    }
                    transport.send_pod_event(event)
                },
                ClusterApiError::is_retryable,
            )
            .await;

        match result {
            Ok(()) => {
                self.metrics.deliveries.with_label_values(&["delivered"]).inc();
                debug!(
                    "Delivered {} {}/{} {} to clusterapi",
                    event.kind, event.namespace, event.name, event.new_phase
                );
                Ok(())
            }
            Err(RetryError::Permanent { error, attempts }) => {
                self.metrics.deliveries.with_label_values(&["rejected"]).inc();
                error!(
                    "clusterapi rejected event for pod {}/{} ({}) on attempt {}: {}",
                    event.namespace,
                    event.name,
                    event.idempotency_key(),
                    attempts,
                    error
                );
                Err(DeliveryError::Permanent {
                    key: event.idempotency_key(),
                    attempts,
                    source: error,
                })
            }
            Err(RetryError::Exhausted { error, attempts }) => {
                self.metrics.deliveries.with_label_values(&["exhausted"]).inc();
                error!(
                    "Giving up on event for pod {}/{} ({}) after {} attempts: {}",
                    event.namespace,
                    event.name,
                    event.idempotency_key(),
                    attempts,
                    error
                );
                Err(DeliveryError::Exhausted {
                    key: event.idempotency_key(),
                    attempts,
                    source: error,
                })
            }
        }
    }
}

struct Queued {
    event: PodEvent,
    // Released once delivery finishes, freeing a queue slot
    _permit: OwnedSemaphorePermit,
}

/// Cloneable enqueue side of the [`Dispatcher`].
#[derive(Clone)]
pub struct DispatchHandle {
    shards: Arc<[mpsc::Sender<Queued>]>,
    permits: Arc<Semaphore>,
    bound: usize,
}

impl DispatchHandle {
    /// Enqueues `event`, waiting while `queue_bound` events are outstanding.
    pub async fn dispatch(&self, event: PodEvent) -> Result<(), QueueClosed> {
        let permit = self.permits.clone().acquire_owned().await.map_err(|_| QueueClosed)?;
        let shard = &self.shards[shard_for(&event.uid, self.shards.len())];

        shard
            .send(Queued { event, _permit: permit })
            .await
            .map_err(|_| QueueClosed)
    }

    /// Events queued or being delivered
    pub fn outstanding(&self) -> usize {
        self.bound.saturating_sub(self.permits.available_permits())
    }
}

fn shard_for(uid: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    uid.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

/// Fixed pool of delivery workers.
pub struct Dispatcher {
    handle: DispatchHandle,
    workers: JoinSet<()>,
}

impl Dispatcher {
    /// Spawns `workers` delivery tasks sharing a bound of `queue_bound` outstanding events.
    pub fn start(notifier: Arc<Notifier>, queue_bound: usize, workers: usize) -> Self {
        let bound = queue_bound.max(1);
        let worker_count = workers.max(1);
        let mut shards = Vec::with_capacity(worker_count);
        let mut tasks = JoinSet::new();

        for id in 0..worker_count {
            // The semaphore already limits outstanding events, so a shard never fills
            let (tx, rx) = mpsc::channel(bound);
            shards.push(tx);
            tasks.spawn(run_worker(id, notifier.clone(), rx));
        }

        info!("Started {} delivery workers (queue bound {})", worker_count, bound);

        Self {
            handle: DispatchHandle {
                shards: shards.into(),
                permits: Arc::new(Semaphore::new(bound)),
                bound,
            },
            workers: tasks,
        }
    }

    /// Handle for enqueuing events
    pub fn handle(&self) -> DispatchHandle {
        self.handle.clone()
    }

    /// Closes the queue and waits up to `grace` for queued events to be delivered.
    ///
    /// Every [`DispatchHandle`] clone must be dropped for the queue to close;
    /// workers still running after `grace` are aborted.
    pub async fn shutdown(self, grace: Duration) {
        let Self { handle, mut workers } = self;
        let outstanding = handle.outstanding();
        drop(handle);

        if outstanding > 0 {
            info!("Draining {} outstanding events (grace period {:?})", outstanding, grace);
        }

        let drained = tokio::time::timeout(grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                "Delivery workers did not finish within {:?}; aborting {} workers",
                grace,
                workers.len()
            );
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }
    }
}

async fn run_worker(id: usize, notifier: Arc<Notifier>, mut rx: mpsc::Receiver<Queued>) {
    debug!("Delivery worker {} started", id);

    while let Some(queued) = rx.recv().await {
        // Failures are logged and counted by the notifier
        let _ = notifier.notify(&queued.event).await;
    }

    debug!("Delivery worker {} stopped", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_event;
    use clusterapi_client::{MockClusterApiClient, MockFailure};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    fn notifier(mock: &MockClusterApiClient, max_attempts: u32) -> (Arc<Notifier>, Metrics) {
        let metrics = Metrics::new().expect("metrics");
        let notifier = Notifier::new(Arc::new(mock.clone()), fast_policy(max_attempts), metrics.clone());
        (Arc::new(notifier), metrics)
    }

    #[tokio::test]
    async fn test_retries_up_to_limit_on_503() {
        let mock = MockClusterApiClient::new("http://clusterapi.test");
        mock.fail_always(Some(MockFailure::Status(503)));
        let (notifier, metrics) = notifier(&mock, 4);

        let result = notifier.notify(&create_test_event("uid-1")).await;

        assert!(matches!(result, Err(DeliveryError::Exhausted { attempts: 4, .. })));
        assert_eq!(mock.attempts(), 4);
        assert!(mock.delivered().is_empty());
        assert_eq!(metrics.delivery_retries.get(), 3);
        assert_eq!(metrics.deliveries.with_label_values(&["exhausted"]).get(), 1);
    }

    #[tokio::test]
    async fn test_client_error_is_permanent() {
        let mock = MockClusterApiClient::new("http://clusterapi.test");
        mock.fail_next(MockFailure::Status(404));
        let (notifier, _metrics) = notifier(&mock, 4);

        let result = notifier.notify(&create_test_event("uid-1")).await;

        assert!(matches!(result, Err(DeliveryError::Permanent { attempts: 1, .. })));
        assert_eq!(mock.attempts(), 1);
    }

    #[tokio::test]
    async fn test_rejection_after_transient_failure_reports_attempt() {
        let mock = MockClusterApiClient::new("http://clusterapi.test");
        mock.fail_next(MockFailure::Status(503));
        mock.fail_next(MockFailure::Status(422));
        let (notifier, metrics) = notifier(&mock, 5);

        let result = notifier.notify(&create_test_event("uid-1")).await;

        assert!(matches!(result, Err(DeliveryError::Permanent { attempts: 2, .. })));
        assert_eq!(mock.attempts(), 2);
        assert_eq!(metrics.deliveries.with_label_values(&["rejected"]).get(), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let mock = MockClusterApiClient::new("http://clusterapi.test");
        mock.fail_next(MockFailure::Status(503));
        mock.fail_next(MockFailure::Timeout);
        mock.fail_next(MockFailure::ConnectionReset);
        let (notifier, metrics) = notifier(&mock, 5);

        let event = create_test_event("uid-1");
        notifier.notify(&event).await.expect("delivered");

        assert_eq!(mock.attempts(), 4);
        assert_eq!(mock.delivered(), vec![event]);
        assert_eq!(metrics.deliveries.with_label_values(&["delivered"]).get(), 1);
    }

    #[tokio::test]
    async fn test_payload_carries_idempotency_fields() {
        let mock = MockClusterApiClient::new("http://clusterapi.test");
        let (notifier, _metrics) = notifier(&mock, 1);
        let event = create_test_event("uid-7");

        notifier.notify(&event).await.expect("delivered");

        let delivered = &mock.delivered()[0];
        assert_eq!(delivered.dedup_key(), ("uid-7", event.transition_at));
        let json = serde_json::to_value(delivered).expect("serialize");
        assert_eq!(json["uid"], "uid-7");
        assert!(json["transitionAt"].is_string());
    }

    #[tokio::test]
    async fn test_backpressure_blocks_without_dropping() {
        let mock = MockClusterApiClient::new("http://clusterapi.test");
        mock.stall();
        let (notifier, _metrics) = notifier(&mock, 1);
        let dispatcher = Dispatcher::start(notifier, 2, 1);
        let handle = dispatcher.handle();

        handle.dispatch(create_test_event("a")).await.expect("first");
        handle.dispatch(create_test_event("b")).await.expect("second");
        assert_eq!(handle.outstanding(), 2);

        let blocked = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.dispatch(create_test_event("c")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished(), "third dispatch should wait for a free slot");

        mock.release(1);
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("third dispatch unblocked")
            .expect("task")
            .expect("enqueued");

        mock.unstall();
        drop(handle);
        dispatcher.shutdown(Duration::from_secs(1)).await;

        let mut uids: Vec<_> = mock.delivered().into_iter().map(|e| e.uid).collect();
        uids.sort();
        assert_eq!(uids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_same_pod_delivered_in_order() {
        let mock = MockClusterApiClient::new("http://clusterapi.test");
        let (notifier, _metrics) = notifier(&mock, 1);
        let dispatcher = Dispatcher::start(notifier, 8, 4);
        let handle = dispatcher.handle();

        let mut first = create_test_event("same");
        first.resource_version = Some("1".to_string());
        let mut second = create_test_event("same");
        second.resource_version = Some("2".to_string());

        handle.dispatch(first).await.expect("first");
        handle.dispatch(second).await.expect("second");
        drop(handle);
        dispatcher.shutdown(Duration::from_secs(1)).await;

        let versions: Vec<_> = mock
            .delivered()
            .into_iter()
            .filter_map(|e| e.resource_version)
            .collect();
        assert_eq!(versions, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_after_grace() {
        let mock = MockClusterApiClient::new("http://clusterapi.test");
        mock.stall();
        let (notifier, _metrics) = notifier(&mock, 1);
        let dispatcher = Dispatcher::start(notifier, 4, 1);
        let handle = dispatcher.handle();

        handle.dispatch(create_test_event("stuck")).await.expect("enqueued");
        drop(handle);

        tokio::time::timeout(Duration::from_secs(2), dispatcher.shutdown(Duration::from_millis(50)))
            .await
            .expect("shutdown bounded by grace period");
        assert!(mock.delivered().is_empty());
    }
}
