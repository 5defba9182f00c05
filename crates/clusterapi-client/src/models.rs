//! clusterapi data models
//!
//! Wire representation of pod phase notifications.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse-grained pod lifecycle stage.
///
/// Mirrors the Kubernetes `status.phase` values plus the synthetic
/// `Terminated` phase reported when a pod is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PodPhase {
    /// Accepted by the cluster, containers not yet running
    Pending,
    /// Bound to a node with at least one container running
    Running,
    /// All containers terminated successfully
    Succeeded,
    /// All containers terminated, at least one in failure
    Failed,
    /// State could not be obtained
    Unknown,
    /// The pod object was deleted
    Terminated,
}

impl PodPhase {
    /// Parses a Kubernetes phase string. Unrecognised values map to `Unknown`.
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            "Terminated" => Self::Terminated,
            _ => Self::Unknown,
        }
    }

    /// Returns the canonical string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
            Self::Terminated => "Terminated",
        }
    }

    /// Failed and Unknown pods deserve operator attention.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Failed | Self::Unknown)
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of watch notification a [`PodEvent`] was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    /// First sighting of a pod
    Added,
    /// Phase change of a known pod
    Modified,
    /// Pod deletion
    Deleted,
}

impl EventKind {
    /// Returns the Kubernetes watch event type string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "ADDED",
            Self::Modified => "MODIFIED",
            Self::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-container status snapshot sent alongside the phase change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSummary {
    /// Container name
    pub name: String,
    /// Readiness probe result
    pub ready: bool,
    /// Restart counter
    pub restart_count: i32,
    /// "Running", "Waiting (reason)", "Terminated (reason)" or "Unknown"
    pub state: String,
}

/// One entry of the pod's `status.conditions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodConditionSummary {
    /// Condition type, e.g. `Ready` or `PodScheduled`
    #[serde(rename = "type")]
    pub condition_type: String,
    /// "True", "False" or "Unknown"
    pub status: String,
    /// Machine-readable reason of the last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human-readable details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the condition last changed status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Canonical phase-transition notification.
///
/// `(uid, transition_at)` identifies a transition; clusterapi is expected to
/// de-duplicate on it because delivery is at-least-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodEvent {
    /// Pod UID
    pub uid: String,
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
    /// Phase before the transition, if known
    pub previous_phase: Option<PodPhase>,
    /// Phase after the transition
    pub new_phase: PodPhase,
    /// Watch notification kind the event was derived from
    pub kind: EventKind,
    /// When the transition happened, taken from the pod where possible so
    /// redeliveries after a restart carry the same value
    pub transition_at: DateTime<Utc>,
    /// resourceVersion of the notification, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    /// Name of the watched cluster
    pub cluster: String,
    /// Deployment environment of the watcher
    pub environment: String,
    /// Node the pod is scheduled on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    /// Container status snapshot
    #[serde(default)]
    pub containers: Vec<ContainerSummary>,
    /// Pod conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<PodConditionSummary>,
    /// Pod creation time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

impl PodEvent {
    /// De-duplication key: `(uid, transition_at)`.
    pub fn dedup_key(&self) -> (&str, DateTime<Utc>) {
        (&self.uid, self.transition_at)
    }

    /// String form of [`PodEvent::dedup_key`], sent as the `Idempotency-Key` header.
    pub fn idempotency_key(&self) -> String {
        format!(
            "{}@{}",
            self.uid,
            self.transition_at.to_rfc3339_opts(SecondsFormat::Nanos, true)
        )
    }
}
