//! clusterapi REST client
//!
//! A small client for the clusterapi notification endpoint. The pod watcher
//! uses it to deliver one [`PodEvent`] per observed phase transition.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use clusterapi_client::{ClusterApiClient, ClusterApiClientTrait};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ClusterApiClient::new(
//!     "http://clusterapi:3000".to_string(),
//!     Some("api-key".to_string()),
//!     Duration::from_secs(30),
//! )?;
//!
//! client.health_check().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Delivery semantics
//!
//! Delivery is at-least-once. Every request carries the event's
//! `(uid, transitionAt)` pair in the body and in the `Idempotency-Key` header,
//! so clusterapi can de-duplicate redeliveries.

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod clusterapi_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::ClusterApiClient;
pub use clusterapi_trait::ClusterApiClientTrait;
pub use error::ClusterApiError;
pub use models::*;
#[cfg(feature = "test-util")]
pub use mock::{MockClusterApiClient, MockFailure};
