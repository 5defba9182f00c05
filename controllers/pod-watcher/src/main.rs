//! Pod Phase Watcher
//!
//! Watches pods in one or more Kubernetes clusters and forwards every phase
//! transition (Pending, Running, Succeeded, Failed, Unknown, and Terminated on
//! deletion) to clusterapi.
//!
//! Usage: `pod-watcher [development|staging|production]`

mod backoff;
mod checkpoint;
mod config;
mod controller;
mod error;
mod filter;
mod metrics;
mod normalizer;
mod notifier;
mod probes;
mod source;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::{CONFIG_DIR_ENV_NAME, Config, ENVIRONMENT_ENV_NAME, Environment};
use crate::error::ControllerError;
use controller::Controller;
use std::env;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    // kube and reqwest share rustls; pick the provider before any client is built
    let _ = rustls::crypto::ring::default_provider().install_default();

    let environment = Environment::resolve(env::args().nth(1), env::var(ENVIRONMENT_ENV_NAME).ok())?;
    let config_dir = env::var(CONFIG_DIR_ENV_NAME)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config"));
    let (config, missing) = Config::load(&config_dir, environment)?;

    init_tracing(environment, &config.watcher.log_level);

    info!("Starting Pod Phase Watcher in {} environment", environment);
    for path in missing {
        warn!("Config file {} not found, skipping", path.display());
    }

    info!("Configuration:");
    info!("  clusterapi URL: {}{}", config.clusterapi.base_url, config.clusterapi.event_path);
    info!("  Namespace: {}", config.watcher.namespace.as_deref().unwrap_or("all namespaces"));
    if let Some(selector) = &config.watcher.label_selector {
        info!("  Label selector: {}", selector);
    }
    info!(
        "  Clusters: {}",
        config
            .clusters()
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let controller = Controller::new(config, environment).await?;
    controller.run().await?;

    Ok(())
}

/// JSON lines in production, human-readable output elsewhere. `RUST_LOG`
/// takes precedence over the configured level.
fn init_tracing(environment: Environment, default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if environment.is_production() {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
