//! Kube-backed [`WatchClient`] implementation.

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use kube::{
    api::{Api, LogParams, WatchParams},
    core::{DynamicObject, GroupVersionKind, WatchEvent},
    discovery::{Discovery, Scope},
    Client,
};
use tracing::{debug, info};

use wsgate_core::{ContainerHandle, StreamFailure};

use crate::{ByteStream, EventStream, FetchError, LogOptions, PodContainers, RawEvent, WatchClient, WatchTarget};

/// Production client backed by the kube-rs API machinery.
pub struct KubeWatchClient;

impl KubeWatchClient {
    pub fn new() -> Self {
        Self
    }
}

impl Default for KubeWatchClient {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind {
            group: String::new(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        [group, version, kind] => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(kube::core::ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn failure_from_kube(e: kube::Error) -> StreamFailure {
    match e {
        kube::Error::Api(ae) => StreamFailure::Status(wsgate_core::Status::new(ae.code, ae.message)),
        other => StreamFailure::Other(other.to_string()),
    }
}

fn raw_event_from(ev: WatchEvent<DynamicObject>) -> Result<RawEvent, StreamFailure> {
    let (kind, object) = match ev {
        WatchEvent::Added(o) => ("ADDED", serde_json::to_value(&o)),
        WatchEvent::Modified(o) => ("MODIFIED", serde_json::to_value(&o)),
        WatchEvent::Deleted(o) => ("DELETED", serde_json::to_value(&o)),
        // Bookmarks carry no object payload worth keeping; the session skips them.
        WatchEvent::Bookmark(_) => {
            return Ok(RawEvent { kind: "BOOKMARK".to_string(), object: serde_json::Value::Null });
        }
        WatchEvent::Error(er) => {
            let payload = serde_json::json!({
                "kind": "Status",
                "status": er.status,
                "reason": er.reason,
                "message": er.message,
                "code": er.code,
            });
            return Ok(RawEvent { kind: "ERROR".to_string(), object: payload });
        }
    };
    let object = object.map_err(|e| StreamFailure::Other(format!("serializing watch object: {e}")))?;
    Ok(RawEvent { kind: kind.to_string(), object })
}

#[async_trait::async_trait]
impl WatchClient for KubeWatchClient {
    async fn open_watch(&self, target: &WatchTarget) -> Result<EventStream> {
        let client = Client::try_default().await?;
        let gvk = parse_gvk_key(&target.gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;

        let api: Api<DynamicObject> = if namespaced {
            match target.namespace.as_deref() {
                Some(ns) => Api::namespaced_with(client.clone(), ns, &ar),
                None => Api::all_with(client.clone(), &ar),
            }
        } else {
            Api::all_with(client.clone(), &ar)
        };

        let wp = WatchParams::default();
        let version = target.resource_version.as_deref().unwrap_or("0").to_string();
        let stream = api.watch(&wp, &version).await.context("opening watch")?;
        info!(gvk = %target.gvk_key, ns = ?target.namespace, version = %version, "watch opened");

        let mapped = stream.map(|item| match item {
            Ok(ev) => raw_event_from(ev),
            Err(e) => Err(failure_from_kube(e)),
        });
        Ok(mapped.boxed())
    }

    async fn fetch_pod(&self, namespace: &str, pod: &str) -> Result<PodContainers, FetchError> {
        use k8s_openapi::api::core::v1::Pod;

        let client = Client::try_default()
            .await
            .context("building kube client")
            .map_err(FetchError::Other)?;
        let api: Api<Pod> = Api::namespaced(client, namespace);
        let fetched = match api.get(pod).await {
            Ok(p) => p,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                return Err(FetchError::NotFound(format!("{namespace}/{pod}")));
            }
            Err(e) => return Err(FetchError::Other(anyhow::Error::new(e).context("fetching pod"))),
        };

        let spec = fetched.spec.unwrap_or_default();
        let containers = spec.containers.into_iter().map(|c| c.name).collect();
        let init_containers = spec
            .init_containers
            .unwrap_or_default()
            .into_iter()
            .map(|c| c.name)
            .collect();
        debug!(ns = %namespace, pod = %pod, "pod containers fetched");
        Ok(PodContainers { containers, init_containers })
    }

    async fn open_log_stream(
        &self,
        handle: &ContainerHandle,
        opts: &LogOptions,
    ) -> Result<ByteStream, StreamFailure> {
        use k8s_openapi::api::core::v1::Pod;
        use tokio_util::{compat::FuturesAsyncReadCompatExt, io::ReaderStream};

        let client = Client::try_default()
            .await
            .map_err(|e| StreamFailure::Other(format!("building kube client: {e}")))?;
        let api: Api<Pod> = Api::namespaced(client, &handle.namespace);

        let mut lp = LogParams::default();
        lp.follow = opts.follow;
        lp.container = Some(handle.container.clone());
        lp.tail_lines = opts.tail_lines;
        lp.since_seconds = opts.since_seconds;

        let reader = api.log_stream(&handle.pod, &lp).await.map_err(failure_from_kube)?;
        info!(container = %handle, follow = lp.follow, "log stream opened");

        let stream = ReaderStream::new(reader.compat())
            .map(|item| item.map_err(|e| StreamFailure::Other(e.to_string())));
        Ok(stream.boxed())
    }
}
