//! Reconciliation: folds typed deltas into the identity-keyed running set
//! and publishes immutable snapshots for lock-free reads.

use std::sync::Arc;

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use wsgate_core::{Delta, PhaseProjector, ResourceIdentity, Status, StatusPhase, WorkspacePhase};

/// Immutable view of the running set, swapped in whole after every apply.
/// Readers observe either the pre- or post-apply state, never a partial map.
#[derive(Debug, Clone, Default)]
pub struct RunningSnapshot {
    pub entries: FxHashMap<ResourceIdentity, WorkspacePhase>,
    /// Entries whose phase is `Starting` or `Running`, derived from
    /// `entries` at freeze time so it cannot drift from the map.
    pub running: usize,
}

/// Single-writer fold of deltas into the running set. Generic over the
/// phase projection so other resource kinds can reuse it.
pub struct Reconciler<P = StatusPhase> {
    set: FxHashMap<ResourceIdentity, WorkspacePhase>,
    snap: Arc<ArcSwap<RunningSnapshot>>,
    // Unbounded: a terminal status is the signal to resubscribe and must
    // never be dropped. Volume is at most one per connection lifetime.
    errors: mpsc::UnboundedSender<Status>,
    projector: P,
}

impl Reconciler<StatusPhase> {
    pub fn new(errors: mpsc::UnboundedSender<Status>) -> Self {
        Self::with_projector(errors, StatusPhase)
    }
}

impl<P: PhaseProjector> Reconciler<P> {
    pub fn with_projector(errors: mpsc::UnboundedSender<Status>, projector: P) -> Self {
        Self {
            set: FxHashMap::default(),
            snap: Arc::new(ArcSwap::from_pointee(RunningSnapshot::default())),
            errors,
            projector,
        }
    }

    /// Read handle over the published snapshots. Cheap to clone and share.
    pub fn counter(&self) -> RunningWorkspaceCounter {
        RunningWorkspaceCounter { snap: Arc::clone(&self.snap) }
    }

    /// Apply one delta and publish the post-apply snapshot.
    ///
    /// An upsert whose payload carries no phase keeps the previously known
    /// phase: partial updates must not fake a "not running" transition.
    /// Only `Deleted` removes an entry. `Error` deltas never touch the map;
    /// their status is forwarded for the owner to decide on resubscription.
    pub fn apply(&mut self, delta: Delta) {
        metrics::counter!("reconcile_deltas_total", 1u64);
        match delta {
            Delta::Added(snap) | Delta::Modified(snap) => match self.projector.project(&snap) {
                Some(phase) => {
                    self.set.insert(snap.identity, phase);
                }
                None => {
                    debug!(identity = %snap.identity, "delta carries no phase; keeping previous");
                    return;
                }
            },
            Delta::Deleted(snap) => {
                self.set.remove(&snap.identity);
            }
            Delta::Error(status) => {
                warn!(%status, "error delta; forwarding to owner");
                if self.errors.send(status).is_err() {
                    warn!("error receiver gone; terminal status unobserved");
                }
                return;
            }
        }
        self.publish();
    }

    fn publish(&self) {
        let running = self.set.values().filter(|p| p.is_active()).count();
        metrics::gauge!("running_workspaces", running as f64);
        self.snap.store(Arc::new(RunningSnapshot { entries: self.set.clone(), running }));
    }
}

/// Shared read handle: the number of active workspaces and the admission
/// check against a configurable cluster limit.
#[derive(Clone)]
pub struct RunningWorkspaceCounter {
    snap: Arc<ArcSwap<RunningSnapshot>>,
}

impl RunningWorkspaceCounter {
    /// Workspaces whose phase is `Starting` or `Running`.
    pub fn count(&self) -> usize {
        self.snap.load().running
    }

    /// `limit` of `None` or `<= 0` means unlimited (never exceeded);
    /// otherwise exceeded once `count() >= limit`.
    pub fn is_limit_exceeded(&self, limit: Option<i64>) -> bool {
        match limit {
            Some(n) if n > 0 => self.count() as i64 >= n,
            _ => false,
        }
    }

    pub fn phase_of(&self, identity: &ResourceIdentity) -> Option<WorkspacePhase> {
        self.snap.load().entries.get(identity).copied()
    }

    /// Current full snapshot, for diagnostics.
    pub fn current(&self) -> Arc<RunningSnapshot> {
        self.snap.load_full()
    }
}

/// Spawn the single-writer ingest loop: deltas apply one at a time, in
/// receive order. Returns the delta sender, a read handle, and the receiver
/// carrying statuses from `Error` deltas.
pub fn spawn_reconciler(
    cap: usize,
) -> (mpsc::Sender<Delta>, RunningWorkspaceCounter, mpsc::UnboundedReceiver<Status>) {
    let (tx, mut rx) = mpsc::channel::<Delta>(cap);
    let (err_tx, err_rx) = mpsc::unbounded_channel::<Status>();
    let mut rec = Reconciler::new(err_tx);
    let counter = rec.counter();
    tokio::spawn(async move {
        while let Some(d) = rx.recv().await {
            rec.apply(d);
        }
        info!("reconcile loop stopped");
    });
    (tx, counter, err_rx)
}
