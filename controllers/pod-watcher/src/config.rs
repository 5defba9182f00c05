//! Layered configuration.
//!
//! `config/base.yaml` is merged with `config/<environment>.yaml`, then
//! `${VAR}` / `${VAR:-default}` placeholders are substituted from the process
//! environment, then a handful of well-known environment variables override
//! the result:
//!
//! - `CLUSTERAPI_URL`: clusterapi base URL
//! - `CLUSTERAPI_TOKEN`: clusterapi bearer token
//! - `WATCH_NAMESPACE`: namespace to watch (empty for all namespaces)
//! - `LOG_LEVEL`: default log filter

use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::backoff::RetryPolicy;

/// Name of the environment variable selecting the environment.
pub const ENVIRONMENT_ENV_NAME: &str = "ENVIRONMENT";

/// Name of the environment variable pointing at the config directory.
pub const CONFIG_DIR_ENV_NAME: &str = "CONFIG_DIR";

const DEVELOPMENT_ENV_NAME: &str = "development";
const STAGING_ENV_NAME: &str = "staging";
const PRODUCTION_ENV_NAME: &str = "production";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A config file exists but could not be read
    #[error("Failed to read {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// A document is not valid YAML or does not match the schema
    #[error("Failed to parse {origin}: {source}")]
    Yaml {
        /// File path or description of the document
        origin: String,
        /// Underlying error
        #[source]
        source: serde_yaml::Error,
    },

    /// Unknown environment name
    #[error("{0} is not a supported environment. Use `development`, `staging` or `production`")]
    UnsupportedEnvironment(String),

    /// Semantically invalid configuration
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Deployment environment of the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    /// Local development
    #[default]
    Development,
    /// Pre-production
    Staging,
    /// Production; logs are emitted as JSON
    Production,
}

impl Environment {
    /// Resolves the environment from the first CLI argument, falling back to
    /// `ENVIRONMENT`, then to development.
    pub fn resolve(cli_arg: Option<String>, env_var: Option<String>) -> Result<Self, ConfigError> {
        match cli_arg.or(env_var) {
            Some(name) => Self::try_from(name),
            None => Ok(Self::default()),
        }
    }

    /// Canonical name, also used as the config file stem
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => DEVELOPMENT_ENV_NAME,
            Self::Staging => STAGING_ENV_NAME,
            Self::Production => PRODUCTION_ENV_NAME,
        }
    }

    /// Whether this is the production environment
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Environment {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            DEVELOPMENT_ENV_NAME => Ok(Self::Development),
            STAGING_ENV_NAME => Ok(Self::Staging),
            PRODUCTION_ENV_NAME => Ok(Self::Production),
            _ => Err(ConfigError::UnsupportedEnvironment(s)),
        }
    }
}

/// Complete watcher configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Watch loop settings
    pub watcher: WatcherConfig,
    /// clusterapi endpoint settings
    pub clusterapi: ClusterApiConfig,
    /// Clusters to watch
    pub kubernetes: KubernetesConfig,
    /// Probe and metrics server
    pub probes: ProbesConfig,
}

/// Watch loop settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Namespace to watch; `None` watches all namespaces
    pub namespace: Option<String>,
    /// Optional label selector applied to LIST and WATCH
    pub label_selector: Option<String>,
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Previous-state cache TTL
    pub cache_ttl_secs: u64,
    /// Server-side watch timeout (must be below 295)
    pub watch_timeout_secs: u32,
    /// Dispatch events for pods found by the first LIST
    pub notify_on_initial_list: bool,
    /// Maximum events queued or in flight
    pub queue_bound: usize,
    /// Delivery worker count
    pub workers: usize,
    /// Time allowed for draining deliveries on shutdown
    pub shutdown_grace_secs: u64,
    /// Backoff for re-establishing the watch
    pub retry: RetryConfig,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            label_selector: None,
            log_level: "info".to_string(),
            cache_ttl_secs: 86_400,
            watch_timeout_secs: 290,
            notify_on_initial_list: true,
            queue_bound: 256,
            workers: 4,
            shutdown_grace_secs: 10,
            retry: RetryConfig::from(RetryPolicy::WATCH),
        }
    }
}

impl WatcherConfig {
    /// Previous-state cache TTL
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Shutdown grace period
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// clusterapi endpoint settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterApiConfig {
    /// Base URL, e.g. `https://clusterapi.example.com`
    pub base_url: String,
    /// Path events are POSTed to
    pub event_path: String,
    /// Authentication
    pub auth: AuthConfig,
    /// Per-request timeout
    pub timeout_secs: u64,
    /// Delivery retry policy
    pub retry: RetryConfig,
}

impl Default for ClusterApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            event_path: clusterapi_client::client::DEFAULT_EVENT_PATH.to_string(),
            auth: AuthConfig::default(),
            timeout_secs: 30,
            retry: RetryConfig::from(RetryPolicy::DELIVERY),
        }
    }
}

impl ClusterApiConfig {
    /// Per-request timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// clusterapi authentication.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Bearer token
    pub api_key: Option<String>,
}

/// Retry settings as they appear in YAML.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts
    pub max_attempts: u32,
    /// First backoff delay in milliseconds
    pub initial_delay_ms: u64,
    /// Backoff cap in milliseconds
    pub max_delay_ms: u64,
    /// Backoff growth factor
    pub multiplier: f64,
    /// Random fraction removed from each delay
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(RetryPolicy::default())
    }
}

impl From<RetryPolicy> for RetryConfig {
    fn from(policy: RetryPolicy) -> Self {
        Self {
            max_attempts: policy.max_attempts,
            initial_delay_ms: u64::try_from(policy.initial_delay.as_millis()).unwrap_or(u64::MAX),
            max_delay_ms: u64::try_from(policy.max_delay.as_millis()).unwrap_or(u64::MAX),
            multiplier: policy.multiplier,
            jitter: policy.jitter,
        }
    }
}

impl RetryConfig {
    /// Converts to the runtime policy
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }

    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid(format!("{section}.retry.max_attempts must be at least 1")));
        }
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            return Err(ConfigError::Invalid(format!("{section}.retry.multiplier must be >= 1.0")));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid(format!("{section}.retry.jitter must be within 0.0..=1.0")));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "{section}.retry.initial_delay_ms must not exceed max_delay_ms"
            )));
        }
        Ok(())
    }
}

/// Clusters to watch.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    /// Empty means one cluster named `default` using the inferred client config
    pub clusters: Vec<ClusterConfig>,
}

/// One watched cluster.
///
/// A cluster is reached through a kubeconfig `context`, through a direct
/// `host` (with optional bearer `token`), or, when neither is set, through the
/// inferred in-cluster/kubeconfig client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// Name used in logs, metrics and event payloads
    pub name: String,
    /// kubeconfig context
    #[serde(default)]
    pub context: Option<String>,
    /// API server URL
    #[serde(default)]
    pub host: Option<String>,
    /// Bearer token used with `host`
    #[serde(default)]
    pub token: Option<String>,
    /// Verify the API server certificate when connecting through `host`
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,
}

fn default_verify_ssl() -> bool {
    true
}

/// How the client of one cluster is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterConnection<'a> {
    /// In-cluster service account or current kubeconfig context
    Inferred,
    /// Named kubeconfig context
    Context(&'a str),
    /// Direct connection to an API server
    Direct {
        /// API server URL
        host: &'a str,
        /// Bearer token
        token: Option<&'a str>,
        /// Verify the server certificate
        verify_ssl: bool,
    },
}

impl ClusterConfig {
    /// Cluster reached through the inferred client config
    pub fn inferred(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            context: None,
            host: None,
            token: None,
            verify_ssl: true,
        }
    }

    /// Connection settings; [`Config`] validation guarantees they are unambiguous
    pub fn connection(&self) -> ClusterConnection<'_> {
        match (&self.context, &self.host) {
            (Some(context), _) => ClusterConnection::Context(context),
            (None, Some(host)) => ClusterConnection::Direct {
                host,
                token: self.token.as_deref(),
                verify_ssl: self.verify_ssl,
            },
            (None, None) => ClusterConnection::Inferred,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.context.is_some() && self.host.is_some() {
            return Err(ConfigError::Invalid(format!(
                "cluster {} sets both context and host",
                self.name
            )));
        }
        if self.host.is_none() && (self.token.is_some() || !self.verify_ssl) {
            return Err(ConfigError::Invalid(format!(
                "cluster {}: token and verify_ssl require host",
                self.name
            )));
        }
        if let Some(host) = &self.host {
            if !(host.starts_with("https://") || host.starts_with("http://")) {
                return Err(ConfigError::Invalid(format!(
                    "cluster {}: host {} must be an http(s) URL",
                    self.name, host
                )));
            }
        }
        Ok(())
    }
}

/// Probe and metrics server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbesConfig {
    /// Serve `/healthz`, `/readyz` and `/metrics`
    pub enabled: bool,
    /// Listen address
    pub listen: SocketAddr,
}

impl Default for ProbesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl Config {
    /// Loads `<dir>/base.yaml` and `<dir>/<environment>.yaml`.
    ///
    /// Missing files are treated as empty and returned so the caller can log
    /// them once tracing is initialised.
    pub fn load(dir: &Path, environment: Environment) -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let mut documents = Vec::new();
        let mut missing = Vec::new();

        for stem in ["base", environment.as_str()] {
            let path = dir.join(format!("{stem}.yaml"));
            match std::fs::read_to_string(&path) {
                Ok(text) => documents.push((path.display().to_string(), text)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => missing.push(path),
                Err(source) => return Err(ConfigError::Io { path, source }),
            }
        }

        let config = Self::from_documents(&documents, |name| std::env::var(name).ok())?;
        Ok((config, missing))
    }

    /// Builds a config from `(origin, yaml)` documents, later ones winning,
    /// resolving environment variables through `lookup`.
    pub fn from_documents<F>(documents: &[(String, String)], lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut merged = Value::Mapping(Mapping::new());
        for (origin, text) in documents {
            let document: Value = serde_yaml::from_str(text).map_err(|source| ConfigError::Yaml {
                origin: origin.clone(),
                source,
            })?;
            merged = merge(merged, document);
        }

        let substituted = substitute(merged, &lookup);
        let mut config: Config = serde_yaml::from_value(substituted).map_err(|source| ConfigError::Yaml {
            origin: "merged configuration".to_string(),
            source,
        })?;

        config.apply_env_overrides(&lookup);
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides<F>(&mut self, lookup: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("CLUSTERAPI_URL") {
            self.clusterapi.base_url = url;
        }
        if let Some(token) = lookup("CLUSTERAPI_TOKEN") {
            self.clusterapi.auth.api_key = Some(token);
        }
        if let Some(namespace) = lookup("WATCH_NAMESPACE") {
            self.watcher.namespace = Some(namespace);
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.watcher.log_level = level;
        }
    }

    // Empty strings from unset `${VAR}` placeholders mean "not configured"
    fn normalize(&mut self) {
        fn non_empty(value: &mut Option<String>) {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                *value = None;
            }
        }
        non_empty(&mut self.watcher.namespace);
        non_empty(&mut self.watcher.label_selector);
        non_empty(&mut self.clusterapi.auth.api_key);
        for cluster in &mut self.kubernetes.clusters {
            non_empty(&mut cluster.context);
            non_empty(&mut cluster.host);
            non_empty(&mut cluster.token);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.clusterapi.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("clusterapi.base_url must not be empty".to_string()));
        }
        if self.clusterapi.timeout_secs == 0 {
            return Err(ConfigError::Invalid("clusterapi.timeout_secs must be at least 1".to_string()));
        }
        if self.watcher.queue_bound == 0 {
            return Err(ConfigError::Invalid("watcher.queue_bound must be at least 1".to_string()));
        }
        if self.watcher.workers == 0 {
            return Err(ConfigError::Invalid("watcher.workers must be at least 1".to_string()));
        }
        if !(1..295).contains(&self.watcher.watch_timeout_secs) {
            return Err(ConfigError::Invalid(
                "watcher.watch_timeout_secs must be between 1 and 294".to_string(),
            ));
        }
        self.watcher.retry.validate("watcher")?;
        self.clusterapi.retry.validate("clusterapi")?;

        let mut names = HashSet::new();
        let mut inferred = 0;
        for cluster in &self.kubernetes.clusters {
            if cluster.name.trim().is_empty() {
                return Err(ConfigError::Invalid("kubernetes.clusters[].name must not be empty".to_string()));
            }
            if !names.insert(cluster.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate cluster name {}", cluster.name)));
            }
            cluster.validate()?;
            if cluster.connection() == ClusterConnection::Inferred {
                inferred += 1;
            }
        }
        // Two inferred clusters would watch the same API server twice
        if inferred > 1 {
            return Err(ConfigError::Invalid(
                "at most one cluster may omit both context and host".to_string(),
            ));
        }
        Ok(())
    }

    /// Clusters to watch, defaulting to a single inferred cluster
    pub fn clusters(&self) -> Vec<ClusterConfig> {
        if self.kubernetes.clusters.is_empty() {
            vec![ClusterConfig::inferred("default")]
        } else {
            self.kubernetes.clusters.clone()
        }
    }
}

/// Recursively merges `overlay` into `base`. Mappings merge key by key;
/// anything else in `overlay` replaces the base value. A null overlay (empty
/// document) leaves `base` untouched.
pub fn merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (base, Value::Null) => base,
        (Value::Mapping(mut base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => merge(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Mapping(base)
        }
        (_, overlay) => overlay,
    }
}

/// Replaces every string scalar of the form `${VAR}` or `${VAR:-default}`
/// with the variable's value, the default, or an empty string.
pub fn substitute<F>(value: Value, lookup: &F) -> Value
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        Value::Mapping(mapping) => Value::Mapping(
            mapping
                .into_iter()
                .map(|(k, v)| (k, substitute(v, lookup)))
                .collect(),
        ),
        Value::Sequence(items) => Value::Sequence(items.into_iter().map(|v| substitute(v, lookup)).collect()),
        Value::String(s) => match s.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) {
            Some(expr) => {
                let (name, default) = match expr.split_once(":-") {
                    Some((name, default)) => (name, default),
                    None => (expr, ""),
                };
                Value::String(lookup(name).unwrap_or_else(|| default.to_string()))
            }
            None => Value::String(s),
        },
        other => other,
    }
}
