//! Pod watch loop.
//!
//! One `WatchLoop` per cluster drives a resumable LIST + WATCH subscription:
//!
//! 1. LIST every pod, reconcile the listing against the previous-state cache
//!    and take the collection resourceVersion as checkpoint.
//! 2. WATCH from the checkpoint. Each notification is observed, filtered,
//!    normalized and handed to the dispatcher; the checkpoint advances after
//!    normalization whether or not an event was produced.
//! 3. A clean stream close reopens the watch from the checkpoint.
//! 4. 410 Gone drops the checkpoint and goes back to 1.
//! 5. Transport errors back off with jitter; exhausting the budget (or being
//!    refused with 401/403) is fatal. The budget resets after a successful
//!    LIST, a delivered notification or a clean close.
//!
//! The cache and checkpoint are owned by the loop and only touched from its task.

use chrono::Utc;
use clusterapi_client::{EventKind, PodEvent};
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::{Backoff, RetryPolicy};
use crate::checkpoint::Checkpoint;
use crate::error::{ControllerError, WatchError};
use crate::filter::PhaseChangeFilter;
use crate::metrics::Metrics;
use crate::normalizer::{self, EventContext};
use crate::notifier::DispatchHandle;
use crate::probes::Readiness;
use crate::source::{PodSource, RawNotification};

/// How often expired cache entries are swept between relists.
const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Lifecycle state of a watch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// Initial LIST in progress
    Listing,
    /// Consuming the watch stream
    Watching,
    /// Relisting after the checkpoint was dropped
    Resyncing,
    /// Waiting before the next attempt
    Backoff,
    /// Gave up; terminal
    Fatal,
}

impl fmt::Display for WatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Listing => "Listing",
            Self::Watching => "Watching",
            Self::Resyncing => "Resyncing",
            Self::Backoff => "Backoff",
            Self::Fatal => "Fatal",
        };
        f.write_str(name)
    }
}

/// Tunables of a watch loop.
#[derive(Debug, Clone, Copy)]
pub struct WatchSettings {
    /// Backoff for LIST and WATCH failures
    pub retry: RetryPolicy,
    /// Previous-state cache TTL
    pub cache_ttl: Duration,
    /// Dispatch events produced by the first LIST
    pub notify_on_initial_list: bool,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::WATCH,
            cache_ttl: Duration::from_secs(86_400),
            notify_on_initial_list: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Resilient pod watch for one cluster.
pub struct WatchLoop {
    context: EventContext,
    source: Arc<dyn PodSource>,
    dispatcher: DispatchHandle,
    metrics: Metrics,
    filter: PhaseChangeFilter,
    checkpoint: Checkpoint,
    backoff: Backoff,
    state: WatchState,
    notify_on_initial_list: bool,
    listed_once: bool,
    readiness: Option<Readiness>,
    last_sweep: Instant,
}

impl WatchLoop {
    /// Creates a watch loop in the `Listing` state.
    pub fn new(
        context: EventContext,
        source: Arc<dyn PodSource>,
        dispatcher: DispatchHandle,
        metrics: Metrics,
        settings: WatchSettings,
    ) -> Self {
        Self {
            context,
            source,
            dispatcher,
            metrics,
            filter: PhaseChangeFilter::new(settings.cache_ttl),
            checkpoint: Checkpoint::new(),
            backoff: Backoff::new(settings.retry),
            state: WatchState::Listing,
            notify_on_initial_list: settings.notify_on_initial_list,
            listed_once: false,
            readiness: None,
            last_sweep: Instant::now(),
        }
    }

    /// Signals `readiness` once the first LIST completes
    #[must_use]
    pub fn with_readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = Some(readiness);
        self
    }

    /// Current state
    pub fn state(&self) -> WatchState {
        self.state
    }

    /// Current checkpoint
    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Phase change filter and its cache
    pub fn filter(&self) -> &PhaseChangeFilter {
        &self.filter
    }

    /// Runs until `shutdown` is cancelled (`Ok`) or the watch gives up (`Err`).
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), ControllerError> {
        info!("[{}] Starting pod watch", self.context.cluster);

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let step = if self.checkpoint.is_set() {
                self.watch(&shutdown).await
            } else {
                self.list(&shutdown).await
            };

            let flow = match step {
                Ok(flow) => flow,
                Err(err) => self.recover(err, &shutdown).await?,
            };

            if flow == Flow::Stop {
                break;
            }
        }

        info!("[{}] Pod watch stopped", self.context.cluster);
        Ok(())
    }

    async fn list(&mut self, shutdown: &CancellationToken) -> Result<Flow, WatchError> {
        debug!("[{}] Listing pods", self.context.cluster);

        let listing = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(Flow::Stop),
            result = self.source.list_pods() => result?,
        };
        self.backoff.reset();

        let now = Utc::now();
        let mut observations = Vec::with_capacity(listing.pods.len());
        for pod in &listing.pods {
            match normalizer::observe(pod, now) {
                Ok(observation) => observations.push(observation),
                Err(e) => self.record_malformed(EventKind::Added, &e),
            }
        }

        let listed = observations.len();
        let transitions = self.filter.reconcile_listing(observations, now);
        let dispatch = self.listed_once || self.notify_on_initial_list;
        info!(
            "[{}] Listed {} pods at resourceVersion {} ({} transitions{})",
            self.context.cluster,
            listed,
            listing.resource_version,
            transitions.len(),
            if dispatch { "" } else { ", not dispatched" }
        );

        if dispatch {
            for (transition, observation) in transitions {
                let event = normalizer::normalize(&observation, &transition, &self.context);
                if self.emit(event, shutdown).await == Flow::Stop {
                    return Ok(Flow::Stop);
                }
            }
        }

        self.checkpoint.advance(listing.resource_version);
        self.sweep_cache();

        if !self.listed_once {
            self.listed_once = true;
            if let Some(readiness) = &self.readiness {
                readiness.mark_ready();
            }
        }

        self.set_state(WatchState::Watching);
        Ok(Flow::Continue)
    }

    async fn watch(&mut self, shutdown: &CancellationToken) -> Result<Flow, WatchError> {
        let from = self.checkpoint.resource_version().unwrap_or_default().to_string();
        debug!("[{}] Opening watch from resourceVersion {}", self.context.cluster, from);

        let mut stream = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(Flow::Stop),
            result = self.source.watch_pods(&from) => result?,
        };
        self.set_state(WatchState::Watching);

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(Flow::Stop),
                next = stream.next() => next,
            };

            match next {
                None => {
                    self.backoff.reset();
                    debug!(
                        "[{}] Watch stream closed; resuming from resourceVersion {}",
                        self.context.cluster,
                        self.checkpoint.resource_version().unwrap_or_default()
                    );
                    self.metrics
                        .watch_restarts
                        .with_label_values(&[self.context.cluster.as_str()])
                        .inc();
                    return Ok(Flow::Continue);
                }
                Some(Err(err)) => return Err(err),
                Some(Ok(notification)) => {
                    // A stream that opens and fails before delivering anything keeps its budget
                    self.backoff.reset();
                    if self.handle(notification, shutdown).await == Flow::Stop {
                        return Ok(Flow::Stop);
                    }
                }
            }
        }
    }

    async fn handle(&mut self, notification: RawNotification, shutdown: &CancellationToken) -> Flow {
        let resource_version = notification.resource_version().map(str::to_string);
        let (kind, pod) = match notification {
            RawNotification::Added(pod) => (EventKind::Added, pod),
            RawNotification::Modified(pod) => (EventKind::Modified, pod),
            RawNotification::Deleted(pod) => (EventKind::Deleted, pod),
            RawNotification::Bookmark(_) => {
                if let Some(resource_version) = resource_version {
                    self.checkpoint.advance(resource_version);
                }
                return Flow::Continue;
            }
        };

        let event = match normalizer::observe(&pod, Utc::now()) {
            Ok(observation) => {
                debug!(
                    "[{}] {} {} phase {}",
                    self.context.cluster,
                    kind,
                    observation.key(),
                    observation.phase
                );
                let transition = self.filter.observe(kind, observation.clone());
                transition.map(|t| normalizer::normalize(&observation, &t, &self.context))
            }
            Err(e) => {
                self.record_malformed(kind, &e);
                None
            }
        };

        if let Some(resource_version) = resource_version {
            self.checkpoint.advance(resource_version);
        }
        self.maybe_sweep_cache();

        match event {
            Some(event) => self.emit(event, shutdown).await,
            None => Flow::Continue,
        }
    }

    async fn emit(&self, event: PodEvent, shutdown: &CancellationToken) -> Flow {
        let previous = event
            .previous_phase
            .map_or_else(|| "none".to_string(), |p| p.to_string());

        if event.new_phase.is_critical() {
            warn!(
                "[{}] Pod {}/{} entered {} ({} -> {}, {})",
                self.context.cluster, event.namespace, event.name, event.new_phase, previous, event.new_phase, event.kind
            );
        } else {
            info!(
                "[{}] Pod {}/{} {} -> {} ({})",
                self.context.cluster, event.namespace, event.name, previous, event.new_phase, event.kind
            );
        }

        self.metrics
            .events_emitted
            .with_label_values(&[self.context.cluster.as_str(), event.kind.as_str()])
            .inc();

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => Flow::Stop,
            result = self.dispatcher.dispatch(event) => match result {
                Ok(()) => Flow::Continue,
                Err(e) => {
                    warn!("[{}] Stopping watch: {}", self.context.cluster, e);
                    Flow::Stop
                }
            },
        }
    }

    async fn recover(&mut self, err: WatchError, shutdown: &CancellationToken) -> Result<Flow, ControllerError> {
        if let WatchError::Gone(message) = &err {
            warn!(
                "[{}] resourceVersion {} expired ({}); relisting",
                self.context.cluster,
                self.checkpoint.resource_version().unwrap_or_default(),
                message
            );
            self.checkpoint.reset();
            self.metrics
                .resyncs
                .with_label_values(&[self.context.cluster.as_str()])
                .inc();
            self.set_state(WatchState::Resyncing);
            return Ok(Flow::Continue);
        }

        if !err.is_retryable() {
            return Err(self.fatal(self.backoff.failures() + 1, err));
        }

        let Some(delay) = self.backoff.next_delay() else {
            return Err(self.fatal(self.backoff.failures(), err));
        };

        self.set_state(WatchState::Backoff);
        warn!(
            "[{}] Watch attempt {} failed: {}. Retrying in {:?}",
            self.context.cluster,
            self.backoff.failures(),
            err,
            delay
        );
        self.metrics
            .watch_restarts
            .with_label_values(&[self.context.cluster.as_str()])
            .inc();

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(Flow::Stop),
            _ = tokio::time::sleep(delay) => {}
        }

        let next = if self.checkpoint.is_set() {
            WatchState::Watching
        } else {
            WatchState::Resyncing
        };
        self.set_state(next);
        Ok(Flow::Continue)
    }

    fn fatal(&mut self, attempts: u32, source: WatchError) -> ControllerError {
        self.set_state(WatchState::Fatal);
        error!(
            "[{}] Giving up on pod watch after {} attempt(s): {}",
            self.context.cluster, attempts, source
        );
        ControllerError::Fatal {
            cluster: self.context.cluster.clone(),
            attempts,
            source,
        }
    }

    fn record_malformed(&self, kind: EventKind, error: &crate::error::ValidationError) {
        warn!("[{}] Skipping malformed {} notification: {}", self.context.cluster, kind, error);
        self.metrics
            .malformed
            .with_label_values(&[self.context.cluster.as_str()])
            .inc();
    }

    fn maybe_sweep_cache(&mut self) {
        if self.last_sweep.elapsed() >= CACHE_SWEEP_INTERVAL {
            self.sweep_cache();
        } else {
            self.update_cache_gauge();
        }
    }

    fn sweep_cache(&mut self) {
        let evicted = self.filter.evict_expired();
        if evicted > 0 {
            info!("[{}] Evicted {} stale pods from cache", self.context.cluster, evicted);
        }
        self.last_sweep = Instant::now();
        self.update_cache_gauge();
    }

    fn update_cache_gauge(&self) {
        let entries = i64::try_from(self.filter.cache().len()).unwrap_or(i64::MAX);
        self.metrics
            .cache_entries
            .with_label_values(&[self.context.cluster.as_str()])
            .set(entries);
    }

    fn set_state(&mut self, state: WatchState) {
        if self.state != state {
            debug!("[{}] Watch state {} -> {}", self.context.cluster, self.state, state);
            self.state = state;
        }
    }
}
