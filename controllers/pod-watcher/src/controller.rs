//! Main controller implementation.
//!
//! The `Controller` wires one [`WatchLoop`] per configured cluster to a shared
//! delivery [`Dispatcher`], serves the probe endpoints, and turns SIGINT or
//! SIGTERM into a cancellation of every task.
//!
//! Shutdown order: watch loops stop, the dispatcher drains within the grace
//! period, then the probe server exits. The first watch loop to fail cancels
//! the others and its error is returned.

use clusterapi_client::{ClusterApiClient, ClusterApiClientTrait};
use kube::Client;
use kube::config::KubeConfigOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ClusterConfig, ClusterConnection, Config, ConfigError, Environment};
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::normalizer::EventContext;
use crate::notifier::{Dispatcher, Notifier};
use crate::probes::{self, ProbeState, Readiness};
use crate::source::KubePodSource;
use crate::watcher::{WatchLoop, WatchSettings};

type ProbeTask = JoinHandle<Result<(), std::io::Error>>;

/// Main controller for pod phase watching.
pub struct Controller {
    watchers: Vec<WatchLoop>,
    dispatcher: Dispatcher,
    probes: Option<(SocketAddr, ProbeState)>,
    shutdown_grace: Duration,
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(config: Config, environment: Environment) -> Result<Self, ControllerError> {
        info!("Initializing Pod Phase Watcher");

        let metrics = Metrics::new()?;

        let clusterapi = ClusterApiClient::new(
            config.clusterapi.base_url.clone(),
            config.clusterapi.auth.api_key.clone(),
            config.clusterapi.timeout(),
        )?
        .with_event_path(config.clusterapi.event_path.clone());

        info!("Checking clusterapi connectivity at {}", clusterapi.base_url());
        match clusterapi.health_check().await {
            Ok(()) => info!("clusterapi is reachable"),
            Err(e) => warn!("clusterapi health check failed (will continue): {}", e),
        }

        let notifier = Notifier::new(Arc::new(clusterapi), config.clusterapi.retry.policy(), metrics.clone());
        let dispatcher = Dispatcher::start(
            Arc::new(notifier),
            config.watcher.queue_bound,
            config.watcher.workers,
        );

        let clusters = config.clusters();
        let readiness = Readiness::new(clusters.len());
        let settings = WatchSettings {
            retry: config.watcher.retry.policy(),
            cache_ttl: config.watcher.cache_ttl(),
            notify_on_initial_list: config.watcher.notify_on_initial_list,
        };

        let mut watchers = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            let client = kube_client(&cluster).await?;
            let source = KubePodSource::new(
                client,
                config.watcher.namespace.as_deref(),
                config.watcher.label_selector.as_deref(),
                config.watcher.watch_timeout_secs,
            );
            let context = EventContext {
                cluster: cluster.name.clone(),
                environment: environment.to_string(),
            };

            info!(
                "Watching pods in cluster {} ({})",
                cluster.name,
                config.watcher.namespace.as_deref().unwrap_or("all namespaces")
            );
            watchers.push(
                WatchLoop::new(context, Arc::new(source), dispatcher.handle(), metrics.clone(), settings)
                    .with_readiness(readiness.clone()),
            );
        }

        let probes = config
            .probes
            .enabled
            .then(|| (config.probes.listen, ProbeState { readiness, metrics }));

        Ok(Self {
            watchers,
            dispatcher,
            probes,
            shutdown_grace: config.watcher.shutdown_grace(),
        })
    }

    /// Runs until a shutdown signal arrives or a watch loop fails.
    pub async fn run(self) -> Result<(), ControllerError> {
        let Self {
            watchers,
            dispatcher,
            probes,
            shutdown_grace,
        } = self;

        let shutdown = CancellationToken::new();
        let signals = tokio::spawn(wait_for_signal(shutdown.clone()));

        let mut tasks: JoinSet<Result<(), ControllerError>> = JoinSet::new();
        for mut watcher in watchers {
            let token = shutdown.clone();
            tasks.spawn(async move { watcher.run(token).await });
        }

        let probe_task = probes.map(|(addr, state)| {
            let token = shutdown.clone();
            tokio::spawn(async move { probes::serve(addr, state, token).await })
        });

        let (mut first_error, mut probe_task) = supervise(tasks, probe_task, &shutdown).await;

        shutdown.cancel();
        signals.abort();

        info!("Watches stopped; draining notification queue");
        dispatcher.shutdown(shutdown_grace).await;

        if let Some(task) = probe_task.take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Probe server failed: {}", e);
                    first_error.get_or_insert(ControllerError::Probe(e));
                }
                Err(e) => warn!("Probe server task ended abnormally: {}", e),
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Pod Phase Watcher stopped");
                Ok(())
            }
        }
    }
}

/// Waits for every watch loop, cancelling `shutdown` on the first failure of
/// a watch loop or of the probe server. Returns that failure and the probe
/// task if it is still running.
async fn supervise(
    mut tasks: JoinSet<Result<(), ControllerError>>,
    mut probe_task: Option<ProbeTask>,
    shutdown: &CancellationToken,
) -> (Option<ControllerError>, Option<ProbeTask>) {
    let mut first_error = None;
    loop {
        tokio::select! {
            joined = tasks.join_next() => {
                let Some(joined) = joined else { break };
                let result = joined
                    .map_err(|e| ControllerError::Watch(format!("Watch task panicked: {}", e)))
                    .and_then(|result| result);

                if let Err(e) = result {
                    if first_error.is_none() {
                        error!("Watch failed: {}; shutting down", e);
                        shutdown.cancel();
                        first_error = Some(e);
                    } else {
                        error!("Additional watch failure during shutdown: {}", e);
                    }
                }
            }
            joined = wait_probe(&mut probe_task) => {
                probe_task = None;
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!("Probe server failed: {}; shutting down", e);
                        shutdown.cancel();
                        first_error.get_or_insert(ControllerError::Probe(e));
                    }
                    Err(e) => warn!("Probe server task ended abnormally: {}", e),
                }
            }
        }
    }
    (first_error, probe_task)
}

/// Waits for the probe server task; never resolves once it has finished.
async fn wait_probe(task: &mut Option<ProbeTask>) -> Result<Result<(), std::io::Error>, JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

/// Builds the Kubernetes client of one cluster.
///
/// Without a context or host the in-cluster service account or the current
/// kubeconfig context is used.
async fn kube_client(cluster: &ClusterConfig) -> Result<Client, ControllerError> {
    let config = match cluster.connection() {
        ClusterConnection::Inferred => return Ok(Client::try_default().await?),
        ClusterConnection::Context(context) => {
            let options = KubeConfigOptions {
                context: Some(context.to_string()),
                ..Default::default()
            };
            kube::Config::from_kubeconfig(&options).await?
        }
        ClusterConnection::Direct {
            host,
            token,
            verify_ssl,
        } => direct_config(&cluster.name, host, token, verify_ssl)?,
    };
    Ok(Client::try_from(config)?)
}

/// Client config for a cluster reached through its API server URL.
fn direct_config(name: &str, host: &str, token: Option<&str>, verify_ssl: bool) -> Result<kube::Config, ConfigError> {
    let url = host
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("cluster {name}: invalid host {host}: {e}")))?;

    let mut config = kube::Config::new(url);
    config.accept_invalid_certs = !verify_ssl;
    if let Some(token) = token {
        config.auth_info.token = Some(token.to_string().into());
    }
    if !verify_ssl {
        warn!("Certificate verification disabled for cluster {}", name);
    }
    Ok(config)
}

/// Cancels `shutdown` on SIGINT or SIGTERM.
#[cfg(unix)]
async fn wait_for_signal(shutdown: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("SIGINT (Ctrl+C) received, shutting down"),
                _ = shutdown.cancelled() => return,
            }
            shutdown.cancel();
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT (Ctrl+C) received, shutting down"),
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}

/// Cancels `shutdown` on Ctrl+C.
#[cfg(not(unix))]
async fn wait_for_signal(shutdown: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Ctrl+C received, shutting down"),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_config_applies_connection_settings() {
        let config = direct_config("prod", "https://10.0.0.1:6443", Some("sa-token"), false).expect("config");

        assert_eq!(config.cluster_url.host(), Some("10.0.0.1"));
        assert_eq!(config.cluster_url.port_u16(), Some(6443));
        assert!(config.accept_invalid_certs);
        assert!(config.auth_info.token.is_some());

        let config = direct_config("prod", "https://10.0.0.1:6443", None, true).expect("config");
        assert!(!config.accept_invalid_certs);
        assert!(config.auth_info.token.is_none());
    }

    #[tokio::test]
    async fn test_probe_failure_stops_watchers() {
        let shutdown = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let token = shutdown.clone();
        tasks.spawn(async move {
            token.cancelled().await;
            Ok(())
        });
        let probe: ProbeTask = tokio::spawn(async {
            Err(std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use"))
        });

        let (error, probe_task) = tokio::time::timeout(Duration::from_secs(2), supervise(tasks, Some(probe), &shutdown))
            .await
            .expect("supervision ends once the probe server fails");

        assert!(matches!(error, Some(ControllerError::Probe(_))));
        assert!(probe_task.is_none());
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_first_watch_failure_is_reported() {
        let shutdown = CancellationToken::new();
        let mut tasks = JoinSet::new();
        tasks.spawn(async { Err(ControllerError::Watch("boom".to_string())) });
        let token = shutdown.clone();
        tasks.spawn(async move {
            token.cancelled().await;
            Ok(())
        });

        let (error, _) = tokio::time::timeout(Duration::from_secs(2), supervise(tasks, None, &shutdown))
            .await
            .expect("remaining watchers are cancelled");

        assert!(matches!(error, Some(ControllerError::Watch(_))));
        assert!(shutdown.is_cancelled());
    }

    #[test]
    fn test_direct_config_rejects_bad_host() {
        assert!(matches!(
            direct_config("prod", "https://bad host:6443", None, true),
            Err(ConfigError::Invalid(_))
        ));
    }
}
