//! wsgate logs: fan one pod out into independent per-container log streams.
//!
//! One multiplexer instance tracks at most one pod at a time; starting a new
//! `watch` supersedes the previous one. Streams are opened sequentially
//! (regular containers first, then init containers, in spec order) but
//! deliver independently once open. The multiplexer exclusively owns every
//! cancel handle it creates.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use wsgate_cluster::{ByteStream, FetchError, LogOptions, PodContainers, WatchClient};
use wsgate_core::{ContainerHandle, LogEvent, RetryPolicy, Status};

/// The pod whose containers are being followed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodTarget {
    pub namespace: String,
    pub pod: String,
}

impl PodTarget {
    pub fn new(namespace: impl Into<String>, pod: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), pod: pod.into() }
    }
}

struct ActiveStream {
    handle: ContainerHandle,
    cancel: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// Bounded channel for log events, capacity from `WSGATE_LOG_QUEUE_CAP`
/// (default 1024).
pub fn event_channel() -> (mpsc::Sender<LogEvent>, mpsc::Receiver<LogEvent>) {
    let cap = std::env::var("WSGATE_LOG_QUEUE_CAP").ok().and_then(|s| s.parse().ok()).unwrap_or(1024);
    mpsc::channel(cap)
}

pub struct LogStreamMultiplexer<C> {
    client: Arc<C>,
    opts: LogOptions,
    readiness: RetryPolicy,
    active: Vec<ActiveStream>,
}

impl<C: WatchClient> LogStreamMultiplexer<C> {
    /// Follow-mode multiplexer with the default readiness polling budget
    /// (ten fixed one-second attempts).
    pub fn new(client: Arc<C>) -> Self {
        Self {
            client,
            opts: LogOptions { follow: true, ..LogOptions::default() },
            readiness: RetryPolicy::fixed(Duration::from_secs(1), 10),
            active: Vec::new(),
        }
    }

    pub fn with_options(mut self, opts: LogOptions) -> Self {
        self.opts = opts;
        self
    }

    pub fn with_readiness(mut self, policy: RetryPolicy) -> Self {
        self.readiness = policy;
        self
    }

    /// Number of streams opened by the most recent `watch`.
    pub fn active_streams(&self) -> usize {
        self.active.len()
    }

    /// Follow every container of `pod`, delivering chunks and normalized
    /// failures to `events`. Any previously watched pod is stopped first.
    ///
    /// A pod spec that cannot be read (or that never grows containers
    /// within the readiness budget) is terminal for this call: exactly one
    /// `Error` event is emitted and no stream is opened. A single
    /// container's failure to open is reported for that container only;
    /// its siblings still stream.
    pub async fn watch(&mut self, pod: &PodTarget, events: mpsc::Sender<LogEvent>) -> anyhow::Result<()> {
        self.stop_watching();

        let containers = match self.discover_containers(pod).await {
            Ok(c) => c,
            Err(status) => {
                let handle = ContainerHandle {
                    namespace: pod.namespace.clone(),
                    pod: pod.pod.clone(),
                    container: String::new(),
                    init: false,
                };
                warn!(pod = %format!("{}/{}", pod.namespace, pod.pod), %status, "pod discovery failed");
                let _ = events.send(LogEvent::Error { handle, status }).await;
                return Ok(());
            }
        };

        let ordered = containers
            .containers
            .iter()
            .map(|c| (c.clone(), false))
            .chain(containers.init_containers.iter().map(|c| (c.clone(), true)));

        for (container, init) in ordered {
            let handle = ContainerHandle {
                namespace: pod.namespace.clone(),
                pod: pod.pod.clone(),
                container,
                init,
            };
            match self.client.open_log_stream(&handle, &self.opts).await {
                Ok(stream) => {
                    info!(container = %handle, init = handle.init, "log stream opened");
                    self.spawn_pump(handle, stream, events.clone());
                }
                Err(failure) => {
                    let status = failure.into_status();
                    warn!(container = %handle, %status, "log stream failed to open");
                    let _ = events.send(LogEvent::Error { handle, status }).await;
                }
            }
        }
        Ok(())
    }

    /// Cancel every stream of the most recent `watch` and clear the
    /// bookkeeping. No-op when nothing is active.
    pub fn stop_watching(&mut self) {
        if self.active.is_empty() {
            return;
        }
        info!(streams = self.active.len(), "stopping log streams");
        for mut stream in self.active.drain(..) {
            if let Some(cancel) = stream.cancel.take() {
                let _ = cancel.send(());
            }
            stream.task.abort();
            debug!(container = %stream.handle, "log stream stopped");
        }
    }

    fn spawn_pump(&mut self, handle: ContainerHandle, stream: ByteStream, events: mpsc::Sender<LogEvent>) {
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(pump_stream(stream, handle.clone(), events, cancel_rx));
        self.active.push(ActiveStream { handle, cancel: Some(cancel_tx), task });
    }

    /// Fetch the pod's containers, polling under the readiness policy while
    /// the pod exists but reports none yet. Fetch failures (including
    /// not-found) are terminal, not retried.
    async fn discover_containers(&self, pod: &PodTarget) -> Result<PodContainers, Status> {
        let mut attempt = 0u32;
        loop {
            match self.client.fetch_pod(&pod.namespace, &pod.pod).await {
                Ok(c) if !c.is_empty() => return Ok(c),
                Ok(_) => debug!(pod = %pod.pod, attempt, "pod has no containers yet"),
                Err(FetchError::NotFound(what)) => {
                    return Err(Status::bad_request(format!("pod {what} not found")));
                }
                Err(FetchError::Other(e)) => return Err(Status::bad_request(e.to_string())),
            }
            match self.readiness.delay_for(attempt) {
                Some(delay) => {
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(Status::bad_request(format!(
                        "pod {}/{} reported no containers after {} attempts",
                        pod.namespace,
                        pod.pod,
                        self.readiness.max_attempts() + 1
                    )));
                }
            }
        }
    }
}

impl<C> Drop for LogStreamMultiplexer<C> {
    fn drop(&mut self) {
        for mut stream in self.active.drain(..) {
            if let Some(cancel) = stream.cancel.take() {
                let _ = cancel.send(());
            }
            stream.task.abort();
        }
    }
}

/// Forward one container's chunks in receive order; normalize a failure
/// into exactly one `Error` event tagged with the container.
async fn pump_stream(
    mut stream: ByteStream,
    handle: ContainerHandle,
    events: mpsc::Sender<LogEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut cancel_rx => {
                info!(container = %handle, "log pump cancelled");
                return;
            }
            next = stream.next() => {
                match next {
                    Some(Ok(bytes)) => {
                        if events.send(LogEvent::Data { handle: handle.clone(), bytes }).await.is_err() {
                            debug!(container = %handle, "log listener gone");
                            return;
                        }
                    }
                    Some(Err(failure)) => {
                        let status = failure.into_status();
                        warn!(container = %handle, %status, "log stream error");
                        let _ = events.send(LogEvent::Error { handle: handle.clone(), status }).await;
                        return;
                    }
                    None => {
                        info!(container = %handle, "log stream ended");
                        return;
                    }
                }
            }
        }
    }
}
