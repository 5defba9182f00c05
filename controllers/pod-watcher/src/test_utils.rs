//! Test utilities for unit testing the watch pipeline
//!
//! This module provides pod and event builders plus a scripted [`PodSource`].

use async_trait::async_trait;
use chrono::Utc;
use clusterapi_client::{EventKind, PodEvent, PodPhase};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::WatchError;
use crate::source::{NotificationStream, PodListing, PodSource, RawNotification};

/// Helper to create a test Pod in the `default` namespace
pub fn create_test_pod(name: &str, uid: &str, phase: Option<&str>, resource_version: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            uid: Some(uid.to_string()),
            resource_version: Some(resource_version.to_string()),
            ..Default::default()
        },
        spec: None,
        status: Some(PodStatus {
            phase: phase.map(str::to_string),
            ..Default::default()
        }),
    }
}

/// Helper to create a test PodEvent
pub fn create_test_event(uid: &str) -> PodEvent {
    PodEvent {
        uid: uid.to_string(),
        namespace: "default".to_string(),
        name: format!("pod-{uid}"),
        previous_phase: Some(PodPhase::Pending),
        new_phase: PodPhase::Running,
        kind: EventKind::Modified,
        transition_at: Utc::now(),
        resource_version: None,
        cluster: "test".to_string(),
        environment: "development".to_string(),
        node_name: None,
        containers: Vec::new(),
        conditions: Vec::new(),
        creation_timestamp: None,
    }
}

/// Scripted outcome of one `watch_pods` call
pub enum WatchScript {
    /// Opening the watch fails
    Fail(WatchError),
    /// The watch yields these items, then closes cleanly
    Items(Vec<Result<RawNotification, WatchError>>),
}

/// [`PodSource`] replaying scripted LIST and WATCH results.
///
/// Once a script queue is exhausted the corresponding call never completes,
/// so a watch loop under test idles until cancelled.
#[derive(Default)]
pub struct ScriptedPodSource {
    lists: Mutex<VecDeque<Result<PodListing, WatchError>>>,
    watches: Mutex<VecDeque<WatchScript>>,
    list_calls: AtomicUsize,
    watched_from: Mutex<Vec<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedPodSource {
    /// Queue a LIST result
    pub fn push_list(&self, result: Result<PodListing, WatchError>) -> &Self {
        lock(&self.lists).push_back(result);
        self
    }

    /// Queue a successful LIST
    pub fn push_listing(&self, pods: Vec<Pod>, resource_version: &str) -> &Self {
        self.push_list(Ok(PodListing {
            pods,
            resource_version: resource_version.to_string(),
        }))
    }

    /// Queue a WATCH result
    pub fn push_watch(&self, script: WatchScript) -> &Self {
        lock(&self.watches).push_back(script);
        self
    }

    /// Number of `list_pods` calls so far
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// resourceVersions passed to `watch_pods`, in call order
    pub fn watched_from(&self) -> Vec<String> {
        lock(&self.watched_from).clone()
    }
}

#[async_trait]
impl PodSource for ScriptedPodSource {
    async fn list_pods(&self) -> Result<PodListing, WatchError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let next = lock(&self.lists).pop_front();
        match next {
            Some(result) => result,
            None => futures::future::pending().await,
        }
    }

    async fn watch_pods(&self, resource_version: &str) -> Result<NotificationStream, WatchError> {
        lock(&self.watched_from).push(resource_version.to_string());
        let next = lock(&self.watches).pop_front();
        match next {
            Some(WatchScript::Fail(err)) => Err(err),
            Some(WatchScript::Items(items)) => Ok(futures::stream::iter(items).boxed()),
            None => Ok(futures::stream::pending().boxed()),
        }
    }
}

/// Polls `condition` until it holds, panicking after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}
