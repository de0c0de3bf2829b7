//! wsgate watch: watch sessions, delta reconciliation and the
//! running-workspace admission counter.

#![forbid(unsafe_code)]

pub mod reconcile;
pub mod session;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use wsgate_cluster::{WatchClient, WatchTarget};
use wsgate_core::Delta;

pub use reconcile::{spawn_reconciler, Reconciler, RunningSnapshot, RunningWorkspaceCounter};
pub use session::{CancelHandle, WatchError, WatchSession};

fn delta_queue_cap() -> usize {
    std::env::var("WSGATE_DELTA_QUEUE_CAP")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1024)
}

/// Cluster-wide cap on concurrently running workspaces. `None` or a
/// non-positive value means unlimited. Read per admission check; the value
/// is owned by external configuration, not by this crate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterLimit(pub Option<i64>);

impl ClusterLimit {
    pub const UNLIMITED: Self = Self(None);

    /// Read `WSGATE_MAX_RUNNING_WORKSPACES`; absent or unparseable means
    /// unlimited.
    pub fn from_env() -> Self {
        Self(std::env::var("WSGATE_MAX_RUNNING_WORKSPACES").ok().and_then(|s| s.parse().ok()))
    }
}

/// Options for (re)starting a watch.
#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    pub namespace: Option<String>,
    pub resource_version: Option<String>,
}

/// Facade wiring one watch session into one reconciler: the surface the
/// serving layer talks to for admission decisions.
pub struct WorkspaceWatcher<C> {
    client: Arc<C>,
    gvk_key: String,
    session: Option<WatchSession<C>>,
    counter: RunningWorkspaceCounter,
    delta_tx: mpsc::Sender<Delta>,
    err_tx: mpsc::Sender<WatchError>,
}

impl<C: WatchClient> WorkspaceWatcher<C> {
    /// Build the watcher plus its error stream. The stream yields at most
    /// one item per connection (server-terminated or transport death); the
    /// owner decides whether to call `watch_in_namespace` again. A restart
    /// resyncs from the server's current state.
    pub fn new(client: Arc<C>, gvk_key: impl Into<String>) -> (Self, mpsc::Receiver<WatchError>) {
        let (err_tx, err_rx) = mpsc::channel::<WatchError>(8);
        let (delta_tx, counter, mut status_rx) = spawn_reconciler(delta_queue_cap());

        // The session already reports terminal server errors on the shared
        // error channel; the reconciler's status copy exists for standalone
        // reconciler owners. Drain it so the owner sees each error once.
        tokio::spawn(async move {
            while let Some(status) = status_rx.recv().await {
                debug!(%status, "terminal status absorbed by reconciler");
            }
        });

        let watcher = Self {
            client,
            gvk_key: gvk_key.into(),
            session: None,
            counter,
            delta_tx,
            err_tx,
        };
        (watcher, err_rx)
    }

    /// (Re)start watching the collection; after return exactly one
    /// underlying connection is live, whatever was live before.
    pub async fn watch_in_namespace(&mut self, opts: WatchOptions) -> anyhow::Result<()> {
        if let Some(mut prev) = self.session.take() {
            prev.stop();
        }
        let target = WatchTarget {
            gvk_key: self.gvk_key.clone(),
            namespace: opts.namespace,
            resource_version: opts.resource_version,
        };
        info!(gvk = %self.gvk_key, ns = ?target.namespace, "starting workspace watch");
        let mut session = WatchSession::new(Arc::clone(&self.client), target);
        session.start(self.delta_tx.clone(), self.err_tx.clone()).await?;
        self.session = Some(session);
        Ok(())
    }

    /// Cancel the live connection, if any. Reconciled state stays readable
    /// (stale but valid) until the next start.
    pub fn stop_watching(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.stop();
        }
    }

    /// Shared read handle, cheap to clone into the serving layer.
    pub fn counter(&self) -> RunningWorkspaceCounter {
        self.counter.clone()
    }

    /// Diagnostic surface: current number of Starting/Running workspaces.
    pub fn number_of_running_workspaces(&self) -> usize {
        self.counter.count()
    }

    /// Admission check against the externally configured cluster limit.
    pub fn is_cluster_limit_exceeded(&self, limit: ClusterLimit) -> bool {
        self.counter.is_limit_exceeded(limit.0)
    }
}
