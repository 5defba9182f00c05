//! Pod source: the cluster side of the watch loop.
//!
//! `PodSource` is the seam between the watch loop and the Kubernetes API. The
//! production implementation talks to `kube::Api<Pod>`; tests drive the loop
//! with a scripted source.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, WatchEvent, WatchParams};
use kube::{Api, Client};
use std::pin::Pin;
use tracing::debug;

use crate::error::WatchError;

/// One raw notification from the watch stream.
#[derive(Debug, Clone)]
pub enum RawNotification {
    /// Pod created (or first seen by this watch)
    Added(Pod),
    /// Pod updated
    Modified(Pod),
    /// Pod deleted
    Deleted(Pod),
    /// Progress marker carrying only a resourceVersion
    Bookmark(String),
}

impl RawNotification {
    /// resourceVersion carried by the notification, if any
    pub fn resource_version(&self) -> Option<&str> {
        match self {
            Self::Added(pod) | Self::Modified(pod) | Self::Deleted(pod) => {
                pod.metadata.resource_version.as_deref()
            }
            Self::Bookmark(rv) => Some(rv.as_str()),
        }
    }
}

/// Result of a full LIST.
#[derive(Debug, Clone, Default)]
pub struct PodListing {
    /// Every pod in scope
    pub pods: Vec<Pod>,
    /// Collection resourceVersion to watch from
    pub resource_version: String,
}

/// Lazy, non-restartable stream of watch notifications.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Result<RawNotification, WatchError>> + Send>>;

/// Cluster collaborator used by the watch loop.
#[async_trait]
pub trait PodSource: Send + Sync {
    /// Lists every pod in scope together with the collection resourceVersion
    async fn list_pods(&self) -> Result<PodListing, WatchError>;

    /// Opens a watch starting after `resource_version`
    async fn watch_pods(&self, resource_version: &str) -> Result<NotificationStream, WatchError>;
}

/// [`PodSource`] backed by `kube::Api<Pod>`.
#[derive(Clone)]
pub struct KubePodSource {
    api: Api<Pod>,
    list_params: ListParams,
    watch_params: WatchParams,
}

impl KubePodSource {
    /// Creates a source for one namespace, or for all namespaces when `namespace` is `None`.
    ///
    /// `watch_timeout_secs` is the server-side watch timeout; the server closes
    /// the stream cleanly when it expires.
    pub fn new(client: Client, namespace: Option<&str>, label_selector: Option<&str>, watch_timeout_secs: u32) -> Self {
        let api: Api<Pod> = match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };

        let (list_params, watch_params) = request_params(label_selector, watch_timeout_secs);
        Self {
            api,
            list_params,
            watch_params,
        }
    }
}

// Bookmarks are on by default in `WatchParams`
fn request_params(label_selector: Option<&str>, watch_timeout_secs: u32) -> (ListParams, WatchParams) {
    let mut list_params = ListParams::default();
    let mut watch_params = WatchParams::default().timeout(watch_timeout_secs);
    if let Some(selector) = label_selector {
        list_params = list_params.labels(selector);
        watch_params = watch_params.labels(selector);
    }
    (list_params, watch_params)
}

#[async_trait]
impl PodSource for KubePodSource {
    async fn list_pods(&self) -> Result<PodListing, WatchError> {
        let list = self.api.list(&self.list_params).await.map_err(WatchError::from_kube)?;

        let resource_version = list
            .metadata
            .resource_version
            .filter(|rv| !rv.is_empty())
            .ok_or_else(|| WatchError::Transport("LIST response carried no resourceVersion".to_string()))?;

        debug!("Listed {} pods at resourceVersion {}", list.items.len(), resource_version);

        Ok(PodListing {
            pods: list.items,
            resource_version,
        })
    }

    async fn watch_pods(&self, resource_version: &str) -> Result<NotificationStream, WatchError> {
        let stream = self
            .api
            .watch(&self.watch_params, resource_version)
            .await
            .map_err(WatchError::from_kube)?;

        Ok(stream
            .map(|item| match item {
                Ok(WatchEvent::Added(pod)) => Ok(RawNotification::Added(pod)),
                Ok(WatchEvent::Modified(pod)) => Ok(RawNotification::Modified(pod)),
                Ok(WatchEvent::Deleted(pod)) => Ok(RawNotification::Deleted(pod)),
                Ok(WatchEvent::Bookmark(bookmark)) => {
                    Ok(RawNotification::Bookmark(bookmark.metadata.resource_version))
                }
                Ok(WatchEvent::Error(status)) => Err(WatchError::from_status(status.code, status.message.clone())),
                Err(err) => Err(WatchError::from_kube(err)),
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_pod;

    #[test]
    fn test_notification_resource_version() {
        let pod = create_test_pod("web-0", "uid-1", Some("Running"), "17");

        assert_eq!(RawNotification::Modified(pod).resource_version(), Some("17"));
        assert_eq!(RawNotification::Bookmark("20".to_string()).resource_version(), Some("20"));
    }

    #[test]
    fn test_request_params() {
        let (list, watch) = request_params(Some("app=web"), 290);

        assert_eq!(list.label_selector.as_deref(), Some("app=web"));
        assert_eq!(watch.label_selector.as_deref(), Some("app=web"));
        assert_eq!(watch.timeout, Some(290));
        assert!(watch.bookmarks);

        let (list, watch) = request_params(None, 60);
        assert!(list.label_selector.is_none());
        assert!(watch.label_selector.is_none());
    }
}
