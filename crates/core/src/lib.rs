//! wsgate core types: identities, deltas, phases, statuses, log events.

#![forbid(unsafe_code)]

pub mod retry;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use retry::RetryPolicy;

/// Stable address of one watched object: `(kind, namespace, name)`.
/// Used as the reconciler's map key for the object's whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceIdentity {
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind: kind.into(), namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Lifecycle stage reported by a workspace resource.
///
/// Only `Starting` and `Running` count toward admission pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkspacePhase {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failing,
    Failed,
    Terminating,
}

impl WorkspacePhase {
    pub fn is_active(self) -> bool {
        matches!(self, WorkspacePhase::Starting | WorkspacePhase::Running)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown workspace phase: {0}")]
pub struct UnknownPhase(pub String);

impl FromStr for WorkspacePhase {
    type Err = UnknownPhase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Starting" => Ok(Self::Starting),
            "Running" => Ok(Self::Running),
            "Stopping" => Ok(Self::Stopping),
            "Stopped" => Ok(Self::Stopped),
            "Failing" => Ok(Self::Failing),
            "Failed" => Ok(Self::Failed),
            "Terminating" => Ok(Self::Terminating),
            other => Err(UnknownPhase(other.to_string())),
        }
    }
}

impl fmt::Display for WorkspacePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Failing => "Failing",
            Self::Failed => "Failed",
            Self::Terminating => "Terminating",
        };
        f.write_str(s)
    }
}

/// Structured failure payload in the shape the resource API itself reports:
/// a `Status` object with a kind, an HTTP-style code and a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub kind: String,
    pub code: u16,
    pub message: String,
}

impl Status {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self { kind: "Status".to_string(), code, message: message.into() }
    }

    /// Synthesized status for failures that carry no structured payload.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    /// Best-effort parse of a wire `Status` object; missing fields get defaults.
    pub fn from_value(v: &serde_json::Value) -> Self {
        let code = v.get("code").and_then(|c| c.as_u64()).unwrap_or(500) as u16;
        let message = v
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("watch error")
            .to_string();
        Self::new(code, message)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.kind, self.code, self.message)
    }
}

/// One object as carried by an `Added`/`Modified`/`Deleted` delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub identity: ResourceIdentity,
    /// Raw object as received from the wire.
    pub raw: serde_json::Value,
}

impl Snapshot {
    pub fn new(identity: ResourceIdentity, raw: serde_json::Value) -> Self {
        Self { identity, raw }
    }

    /// Phase reported by the object's `status.phase`, if present and known.
    /// Unknown or missing phases read as `None` ("no information").
    pub fn phase(&self) -> Option<WorkspacePhase> {
        self.raw
            .get("status")
            .and_then(|s| s.get("phase"))
            .and_then(|p| p.as_str())
            .and_then(|p| p.parse().ok())
    }
}

/// Typed change event produced by a watch session, consumed exactly once by
/// the reconciler. Closed enum so dispatch is exhaustive at compile time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Delta {
    Added(Snapshot),
    Modified(Snapshot),
    Deleted(Snapshot),
    Error(Status),
}

impl Delta {
    pub fn identity(&self) -> Option<&ResourceIdentity> {
        match self {
            Delta::Added(s) | Delta::Modified(s) | Delta::Deleted(s) => Some(&s.identity),
            Delta::Error(_) => None,
        }
    }
}

/// Address of one container's log stream within one pod.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub init: bool,
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.pod, self.container)
    }
}

/// Event delivered to a log listener: a data chunk or a normalized failure,
/// both tagged with the container they came from.
#[derive(Debug, Clone)]
pub enum LogEvent {
    Data { handle: ContainerHandle, bytes: Bytes },
    Error { handle: ContainerHandle, status: Status },
}

impl LogEvent {
    pub fn handle(&self) -> &ContainerHandle {
        match self {
            LogEvent::Data { handle, .. } | LogEvent::Error { handle, .. } => handle,
        }
    }
}

/// Extracts a lifecycle phase from a raw object snapshot. Seam that keeps
/// the reconciler generic over resource kinds.
pub trait PhaseProjector: Send + Sync {
    fn project(&self, snapshot: &Snapshot) -> Option<WorkspacePhase>;
}

/// Default projector: reads `status.phase`, the shape workspace resources use.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusPhase;

impl PhaseProjector for StatusPhase {
    fn project(&self, snapshot: &Snapshot) -> Option<WorkspacePhase> {
        snapshot.phase()
    }
}

/// Failure raised by an individual byte stream, before normalization.
#[derive(Debug, thiserror::Error)]
pub enum StreamFailure {
    /// The server sent a structured `Status` payload.
    #[error("{0}")]
    Status(Status),
    /// An HTTP-style response without a parseable `Status` body.
    #[error("http {code}: {body}")]
    Http { code: u16, body: String },
    /// Anything else (transport errors, closed sockets, ...).
    #[error("{0}")]
    Other(String),
}

impl StreamFailure {
    /// Normalize into a `Status` suitable for delivery as a `LogEvent::Error`:
    /// structured statuses pass through verbatim, HTTP responses keep their
    /// code, everything else becomes a generic 400.
    pub fn into_status(self) -> Status {
        match self {
            StreamFailure::Status(s) => s,
            StreamFailure::Http { code, body } => Status::new(code, body),
            StreamFailure::Other(msg) => Status::bad_request(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_parses_every_known_variant() {
        for (s, p) in [
            ("Starting", WorkspacePhase::Starting),
            ("Running", WorkspacePhase::Running),
            ("Stopping", WorkspacePhase::Stopping),
            ("Stopped", WorkspacePhase::Stopped),
            ("Failing", WorkspacePhase::Failing),
            ("Failed", WorkspacePhase::Failed),
            ("Terminating", WorkspacePhase::Terminating),
        ] {
            assert_eq!(s.parse::<WorkspacePhase>().unwrap(), p);
            assert_eq!(p.to_string(), s);
        }
        assert!("RUNNING".parse::<WorkspacePhase>().is_err());
        assert!("".parse::<WorkspacePhase>().is_err());
    }

    #[test]
    fn only_starting_and_running_are_active() {
        assert!(WorkspacePhase::Starting.is_active());
        assert!(WorkspacePhase::Running.is_active());
        for p in [
            WorkspacePhase::Stopping,
            WorkspacePhase::Stopped,
            WorkspacePhase::Failing,
            WorkspacePhase::Failed,
            WorkspacePhase::Terminating,
        ] {
            assert!(!p.is_active());
        }
    }

    #[test]
    fn snapshot_phase_reads_status_phase() {
        let id = ResourceIdentity::new("Workspace", "ns", "ws-1");
        let snap = Snapshot::new(id.clone(), serde_json::json!({"status": {"phase": "Running"}}));
        assert_eq!(snap.phase(), Some(WorkspacePhase::Running));

        let no_status = Snapshot::new(id.clone(), serde_json::json!({"spec": {}}));
        assert_eq!(no_status.phase(), None);

        let unknown = Snapshot::new(id, serde_json::json!({"status": {"phase": "Booting"}}));
        assert_eq!(unknown.phase(), None);
    }

    #[test]
    fn stream_failure_normalization() {
        let verbatim = StreamFailure::Status(Status::new(404, "pod not found")).into_status();
        assert_eq!(verbatim.code, 404);
        assert_eq!(verbatim.message, "pod not found");

        let http = StreamFailure::Http { code: 503, body: "backend down".into() }.into_status();
        assert_eq!(http.code, 503);
        assert_eq!(http.message, "backend down");

        let other = StreamFailure::Other("connection reset".into()).into_status();
        assert_eq!(other.code, 400);
        assert_eq!(other.kind, "Status");
        assert_eq!(other.message, "connection reset");
    }

    #[test]
    fn status_from_value_defaults() {
        let full = Status::from_value(&serde_json::json!({"code": 410, "message": "Gone"}));
        assert_eq!((full.code, full.message.as_str()), (410, "Gone"));
        let empty = Status::from_value(&serde_json::json!({}));
        assert_eq!(empty.code, 500);
    }
}
