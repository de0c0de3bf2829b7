//! Watch sessions: one streaming subscription per logical watch target.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use wsgate_cluster::{RawEvent, WatchClient, WatchTarget};
use wsgate_core::{Delta, ResourceIdentity, Snapshot, Status};

/// Why a connection stopped delivering deltas. At most one per connection
/// lifetime; afterwards the session is dead until restarted.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The server sent a terminal ERROR event.
    #[error("watch terminated by server: {0}")]
    Terminated(Status),
    /// Transport failed or the stream ended.
    #[error("watch stream closed: {0}")]
    Stream(String),
}

/// Cancellation handle for one in-flight connection. Cancelling twice is a
/// no-op; the underlying task is asked to close and the caller moves on.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub(crate) fn new(tx: oneshot::Sender<()>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn cancel(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// One logical watch: owns at most one live connection to its target.
/// Restarting cancels the previous connection before opening the next, so
/// two concurrent connections for one target never exist.
pub struct WatchSession<C> {
    client: Arc<C>,
    target: WatchTarget,
    active: Option<CancelHandle>,
}

impl<C: WatchClient> WatchSession<C> {
    pub fn new(client: Arc<C>, target: WatchTarget) -> Self {
        Self { client, target, active: None }
    }

    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    /// Open a fresh connection, superseding any previous one. Typed deltas
    /// flow into `deltas` in server order; `errors` receives at most one
    /// item for this connection: `Terminated` when the server ends the
    /// watch with an ERROR event (also forwarded downstream as
    /// `Delta::Error`), `Stream` on transport death or stream end.
    pub async fn start(
        &mut self,
        deltas: mpsc::Sender<Delta>,
        errors: mpsc::Sender<WatchError>,
    ) -> anyhow::Result<()> {
        self.stop();
        let mut stream = self.client.open_watch(&self.target).await?;

        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let gvk = self.target.gvk_key.clone();
        // Objects on the wire may omit TypeMeta; the target's kind fills in.
        let fallback_kind = kind_of(&self.target.gvk_key);

        tokio::spawn(async move {
            info!(gvk = %gvk, "watch session connected");
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => {
                        info!(gvk = %gvk, "watch session cancelled");
                        return;
                    }
                    next = stream.next() => {
                        match next {
                            Some(Ok(ev)) => match parse_event(&ev, &fallback_kind) {
                                Parsed::Delta(d) => {
                                    debug!(gvk = %gvk, identity = ?d.identity(), "delta forwarded");
                                    if deltas.send(d).await.is_err() {
                                        debug!(gvk = %gvk, "delta receiver gone; closing session");
                                        return;
                                    }
                                }
                                Parsed::Terminal(status) => {
                                    warn!(gvk = %gvk, %status, "server ended watch with error");
                                    let _ = deltas.send(Delta::Error(status.clone())).await;
                                    let _ = errors.send(WatchError::Terminated(status)).await;
                                    return;
                                }
                                Parsed::Skip => {}
                            },
                            Some(Err(e)) => {
                                warn!(gvk = %gvk, error = %e, "watch transport error");
                                let _ = errors.send(WatchError::Stream(e.to_string())).await;
                                return;
                            }
                            None => {
                                warn!(gvk = %gvk, "watch stream ended");
                                let _ = errors.send(WatchError::Stream("stream ended".to_string())).await;
                                return;
                            }
                        }
                    }
                }
            }
        });

        self.active = Some(CancelHandle::new(cancel_tx));
        Ok(())
    }

    /// Cancel the active connection, if any. Safe to call repeatedly and on
    /// a session that already died.
    pub fn stop(&mut self) {
        if let Some(mut handle) = self.active.take() {
            handle.cancel();
        }
    }
}

impl<C> Drop for WatchSession<C> {
    fn drop(&mut self) {
        if let Some(mut handle) = self.active.take() {
            handle.cancel();
        }
    }
}

fn kind_of(gvk_key: &str) -> String {
    gvk_key.rsplit('/').next().unwrap_or(gvk_key).to_string()
}

enum Parsed {
    Delta(Delta),
    Terminal(Status),
    Skip,
}

/// Parse one wire event into a typed delta. Malformed payloads are dropped
/// with a warning and keep the stream alive; an ERROR payload is terminal.
fn parse_event(ev: &RawEvent, fallback_kind: &str) -> Parsed {
    match ev.kind.as_str() {
        "ADDED" | "MODIFIED" | "DELETED" => match identity_of(&ev.object, fallback_kind) {
            Some(identity) => {
                let snap = Snapshot::new(identity, ev.object.clone());
                Parsed::Delta(match ev.kind.as_str() {
                    "ADDED" => Delta::Added(snap),
                    "MODIFIED" => Delta::Modified(snap),
                    _ => Delta::Deleted(snap),
                })
            }
            None => {
                warn!(kind = %ev.kind, "dropping malformed watch event: no identity");
                metrics::counter!("watch_malformed_events_total", 1u64);
                Parsed::Skip
            }
        },
        "ERROR" => Parsed::Terminal(Status::from_value(&ev.object)),
        "BOOKMARK" => {
            debug!("bookmark event skipped");
            Parsed::Skip
        }
        other => {
            warn!(kind = %other, "dropping malformed watch event: unknown kind");
            metrics::counter!("watch_malformed_events_total", 1u64);
            Parsed::Skip
        }
    }
}

fn identity_of(object: &serde_json::Value, fallback_kind: &str) -> Option<ResourceIdentity> {
    let meta = object.get("metadata")?;
    let name = meta.get("name").and_then(|v| v.as_str())?;
    let namespace = meta.get("namespace").and_then(|v| v.as_str()).unwrap_or("");
    let kind = object
        .get("kind")
        .and_then(|v| v.as_str())
        .filter(|k| !k.is_empty())
        .unwrap_or(fallback_kind);
    Some(ResourceIdentity::new(kind, namespace, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(kind: &str, object: serde_json::Value) -> RawEvent {
        RawEvent { kind: kind.to_string(), object }
    }

    #[test]
    fn added_event_parses_to_typed_delta() {
        let raw = ev(
            "ADDED",
            serde_json::json!({
                "kind": "Workspace",
                "metadata": {"name": "ws-1", "namespace": "dev"},
                "status": {"phase": "Running"},
            }),
        );
        match parse_event(&raw, "Workspace") {
            Parsed::Delta(Delta::Added(s)) => {
                assert_eq!(s.identity, ResourceIdentity::new("Workspace", "dev", "ws-1"));
                assert_eq!(s.phase(), Some(wsgate_core::WorkspacePhase::Running));
            }
            _ => panic!("expected Added delta"),
        }
    }

    #[test]
    fn missing_kind_falls_back_to_target_kind() {
        let raw = ev("MODIFIED", serde_json::json!({"metadata": {"name": "ws-2", "namespace": "dev"}}));
        match parse_event(&raw, "Workspace") {
            Parsed::Delta(Delta::Modified(s)) => assert_eq!(s.identity.kind, "Workspace"),
            _ => panic!("expected Modified delta"),
        }
    }

    #[test]
    fn cluster_scoped_objects_get_empty_namespace() {
        let raw = ev("ADDED", serde_json::json!({"kind": "Node", "metadata": {"name": "n1"}}));
        match parse_event(&raw, "Node") {
            Parsed::Delta(Delta::Added(s)) => assert_eq!(s.identity.namespace, ""),
            _ => panic!("expected Added delta"),
        }
    }

    #[test]
    fn malformed_events_are_skipped_not_terminal() {
        for raw in [
            ev("ADDED", serde_json::json!({"metadata": {}})),
            ev("ADDED", serde_json::json!("not an object")),
            ev("MUTATED", serde_json::json!({"metadata": {"name": "x"}})),
            ev("BOOKMARK", serde_json::json!({"metadata": {"resourceVersion": "12"}})),
        ] {
            assert!(matches!(parse_event(&raw, "Workspace"), Parsed::Skip));
        }
    }

    #[test]
    fn error_event_is_terminal_with_status() {
        let raw = ev("ERROR", serde_json::json!({"kind": "Status", "code": 410, "message": "Expired"}));
        match parse_event(&raw, "Workspace") {
            Parsed::Terminal(s) => {
                assert_eq!(s.code, 410);
                assert_eq!(s.message, "Expired");
            }
            _ => panic!("expected terminal"),
        }
    }
}
