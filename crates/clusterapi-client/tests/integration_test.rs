//! Integration tests for the clusterapi client
//!
//! These tests require a running clusterapi instance.
//! Set CLUSTERAPI_URL (and CLUSTERAPI_TOKEN if auth is enabled) to run.

use chrono::Utc;
use clusterapi_client::{ClusterApiClient, ClusterApiClientTrait, EventKind, PodEvent, PodPhase};
use std::time::Duration;

fn client() -> ClusterApiClient {
    let url = std::env::var("CLUSTERAPI_URL")
        .unwrap_or_else(|_| "http://localhost:3000".to_string());
    let token = std::env::var("CLUSTERAPI_TOKEN").ok();

    ClusterApiClient::new(url, token, Duration::from_secs(10)).expect("Failed to create client")
}

fn sample_event() -> PodEvent {
    PodEvent {
        uid: "integration-test-pod".to_string(),
        namespace: "default".to_string(),
        name: "integration-test".to_string(),
        previous_phase: Some(PodPhase::Pending),
        new_phase: PodPhase::Running,
        kind: EventKind::Modified,
        transition_at: Utc::now(),
        resource_version: None,
        cluster: "integration".to_string(),
        environment: "development".to_string(),
        node_name: None,
        containers: Vec::new(),
        conditions: Vec::new(),
        creation_timestamp: None,
    }
}

#[tokio::test]
#[ignore] // Requires running clusterapi instance
async fn test_health_check() {
    let client = client();
    let result = client.health_check().await;
    assert!(result.is_ok(), "Health check failed: {result:?}");
}

#[tokio::test]
#[ignore]
async fn test_send_pod_event() {
    let client = client();
    let result = client.send_pod_event(&sample_event()).await;
    assert!(result.is_ok(), "Failed to send pod event: {result:?}");
}

#[tokio::test]
#[ignore]
async fn test_redelivery_is_accepted() {
    // clusterapi de-duplicates on (uid, transitionAt); a second send must not fail
    let client = client();
    let event = sample_event();

    client.send_pod_event(&event).await.expect("first delivery failed");
    client.send_pod_event(&event).await.expect("redelivery failed");
}
