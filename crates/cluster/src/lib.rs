//! Cluster access seam: the injected resource-watch capability.
//!
//! Everything above this crate (watch sessions, reconcilers, log fan-out)
//! talks to the cluster through [`WatchClient`]; the kube-backed
//! implementation lives in [`kube_client`]. Tests inject mock clients.

#![forbid(unsafe_code)]

pub mod kube_client;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use wsgate_core::{ContainerHandle, StreamFailure};

pub use kube_client::KubeWatchClient;

/// Wire-shaped watch event, before typed parsing: the server's event kind
/// string plus the raw object (or status) payload.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub kind: String,
    pub object: serde_json::Value,
}

/// Ordered stream of wire events for one watch connection.
pub type EventStream = BoxStream<'static, Result<RawEvent, StreamFailure>>;

/// Ordered stream of log chunks for one container.
pub type ByteStream = BoxStream<'static, Result<Bytes, StreamFailure>>;

/// One logical watch target: a resource collection addressed by GVK key
/// ("v1/Pod" or "group/v1/Kind"), optionally scoped to a namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchTarget {
    pub gvk_key: String,
    pub namespace: Option<String>,
    /// Starting version token; `None` resyncs from the server's current state.
    pub resource_version: Option<String>,
}

impl WatchTarget {
    pub fn namespaced(gvk_key: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { gvk_key: gvk_key.into(), namespace: Some(namespace.into()), resource_version: None }
    }
}

/// Container names of one pod, in spec order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodContainers {
    pub containers: Vec<String>,
    pub init_containers: Vec<String>,
}

impl PodContainers {
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty() && self.init_containers.is_empty()
    }
}

/// Options for opening one container's log stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogOptions {
    pub follow: bool,
    pub tail_lines: Option<i64>,
    pub since_seconds: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("pod {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Capability required from the cluster: open watches, read pod specs,
/// open per-container log streams. One implementation per transport.
#[async_trait]
pub trait WatchClient: Send + Sync + 'static {
    /// Open one streaming watch over the target collection. The returned
    /// stream yields wire events in server order until it ends or fails.
    async fn open_watch(&self, target: &WatchTarget) -> anyhow::Result<EventStream>;

    /// Fetch the current container names of one pod.
    async fn fetch_pod(&self, namespace: &str, pod: &str) -> Result<PodContainers, FetchError>;

    /// Open one container's log stream. An immediate open failure reports
    /// why; failures after open arrive as stream items.
    async fn open_log_stream(
        &self,
        handle: &ContainerHandle,
        opts: &LogOptions,
    ) -> Result<ByteStream, StreamFailure>;
}
