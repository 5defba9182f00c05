//! Pod observation and event normalization.
//!
//! `observe` validates a raw `Pod` and snapshots the fields the filter and the
//! outbound payload need. `normalize` turns an observation plus an accepted
//! transition into the canonical [`PodEvent`].

use chrono::{DateTime, Utc};
use clusterapi_client::{ContainerSummary, EventKind, PodConditionSummary, PodEvent, PodPhase};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod, PodCondition};

use crate::error::ValidationError;
use crate::filter::Transition;

/// Immutable snapshot of a pod taken when a notification is received.
#[derive(Debug, Clone, PartialEq)]
pub struct PodObservation {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
    /// Pod UID
    pub uid: String,
    /// Observed phase
    pub phase: PodPhase,
    /// resourceVersion of the pod object
    pub resource_version: Option<String>,
    /// When the watcher received the notification
    pub observed_at: DateTime<Utc>,
    /// Node the pod is scheduled on
    pub node_name: Option<String>,
    /// Per-container status
    pub containers: Vec<ContainerSummary>,
    /// Pod conditions
    pub conditions: Vec<PodConditionSummary>,
    /// `metadata.creationTimestamp`
    pub created_at: Option<DateTime<Utc>>,
    /// `metadata.deletionTimestamp`
    pub deleting_at: Option<DateTime<Utc>>,
}

impl PodObservation {
    /// `namespace/name`, used in log lines
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Identity of the watcher stamped onto every event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventContext {
    /// Configured cluster name
    pub cluster: String,
    /// Deployment environment
    pub environment: String,
}

/// Validates a pod and takes a snapshot of it.
///
/// Rejects pods without `metadata.uid` or `status.phase`.
pub fn observe(pod: &Pod, observed_at: DateTime<Utc>) -> Result<PodObservation, ValidationError> {
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let name = pod.metadata.name.clone().unwrap_or_default();
    let display = format!("{}/{}", namespace, name);

    let uid = pod
        .metadata
        .uid
        .as_deref()
        .filter(|uid| !uid.is_empty())
        .ok_or_else(|| ValidationError::MissingUid(display.clone()))?
        .to_string();

    let status = pod.status.as_ref();
    let phase = status
        .and_then(|s| s.phase.as_deref())
        .filter(|phase| !phase.is_empty())
        .map(PodPhase::parse)
        .ok_or(ValidationError::MissingPhase(display))?;

    let node_name = pod.spec.as_ref().and_then(|spec| spec.node_name.clone());
    let containers = status
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| statuses.iter().map(summarize_container).collect())
        .unwrap_or_default();
    let conditions = status
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| conditions.iter().map(summarize_condition).collect())
        .unwrap_or_default();

    Ok(PodObservation {
        namespace,
        name,
        uid,
        phase,
        resource_version: pod.metadata.resource_version.clone(),
        observed_at,
        node_name,
        containers,
        conditions,
        created_at: pod.metadata.creation_timestamp.as_ref().map(|t| t.0),
        deleting_at: pod.metadata.deletion_timestamp.as_ref().map(|t| t.0),
    })
}

fn summarize_container(status: &ContainerStatus) -> ContainerSummary {
    let state = match status.state.as_ref() {
        Some(state) if state.running.is_some() => "Running".to_string(),
        Some(state) if state.waiting.is_some() => {
            let reason = state.waiting.as_ref().and_then(|w| w.reason.as_deref());
            format!("Waiting ({})", reason.unwrap_or("unknown"))
        }
        Some(state) if state.terminated.is_some() => {
            let reason = state.terminated.as_ref().and_then(|t| t.reason.as_deref());
            format!("Terminated ({})", reason.unwrap_or("unknown"))
        }
        _ => "Unknown".to_string(),
    };

    ContainerSummary {
        name: status.name.clone(),
        ready: status.ready,
        restart_count: status.restart_count,
        state,
    }
}

fn summarize_condition(condition: &PodCondition) -> PodConditionSummary {
    PodConditionSummary {
        condition_type: condition.type_.clone(),
        status: condition.status.clone(),
        reason: condition.reason.clone(),
        message: condition.message.clone(),
        last_transition_time: condition.last_transition_time.as_ref().map(|t| t.0),
    }
}

/// When a transition happened, preferring timestamps recorded on the pod.
///
/// Deletions use `deletionTimestamp`. Other transitions use the most recent
/// condition change, and a first sighting without conditions uses the
/// creation time. The receipt time is the last resort.
pub fn transition_time(observation: &PodObservation, transition: &Transition) -> DateTime<Utc> {
    let recorded = match transition.kind {
        EventKind::Deleted => observation.deleting_at,
        EventKind::Added | EventKind::Modified => {
            let latest_condition = observation
                .conditions
                .iter()
                .filter_map(|c| c.last_transition_time)
                .max();
            match (latest_condition, transition.previous) {
                (Some(at), _) => Some(at),
                (None, None) => observation.created_at,
                // A second transition keyed on the creation time would collide with the first
                (None, Some(_)) => None,
            }
        }
    };
    recorded.unwrap_or(observation.observed_at)
}

/// Builds the canonical event for an accepted transition.
pub fn normalize(observation: &PodObservation, transition: &Transition, context: &EventContext) -> PodEvent {
    PodEvent {
        uid: observation.uid.clone(),
        namespace: observation.namespace.clone(),
        name: observation.name.clone(),
        previous_phase: transition.previous,
        new_phase: transition.new,
        kind: transition.kind,
        transition_at: transition_time(observation, transition),
        resource_version: observation.resource_version.clone(),
        cluster: context.cluster.clone(),
        environment: context.environment.clone(),
        node_name: observation.node_name.clone(),
        containers: observation.containers.clone(),
        conditions: observation.conditions.clone(),
        creation_timestamp: observation.created_at,
    }
}
