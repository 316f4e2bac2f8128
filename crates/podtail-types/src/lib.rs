//! Shared types for podtail
//!
//! This crate contains the data structures passed between the engine, the
//! Kubernetes layer, and the CLI: pod and container identities, observed
//! container state, watch notifications, and the log event record.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

// ============================================================================
// Identities
// ============================================================================

/// Identity of a pod within one cluster snapshot
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PodId {
    pub namespace: String,
    pub name: String,
}

impl PodId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Identity of one container belonging to one pod
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContainerRef {
    pub pod: PodId,
    pub container: String,
    /// Init containers run to completion before regular containers start
    pub init: bool,
}

impl ContainerRef {
    pub fn new(pod: PodId, container: impl Into<String>, init: bool) -> Self {
        Self {
            pod,
            container: container.into(),
            init,
        }
    }
}

impl fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pod, self.container)
    }
}

// ============================================================================
// Observed container state
// ============================================================================

/// Runtime state the cluster reports for a container. The states are
/// mutually exclusive; transitions are driven by the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContainerState {
    Waiting,
    Running,
    Terminated,
}

impl ContainerState {
    /// Parse the lowercase state name used on the command line.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "running" => Some(Self::Running),
            "terminated" => Some(Self::Terminated),
            _ => None,
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => f.write_str("waiting"),
            Self::Running => f.write_str("running"),
            Self::Terminated => f.write_str("terminated"),
        }
    }
}

/// One container as observed in a pod snapshot.
///
/// `state` is `None` when the container appears in the pod spec but has no
/// status yet (not scheduled); such a container never matches a state
/// filter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservedContainer {
    pub name: String,
    pub init: bool,
    pub state: Option<ContainerState>,
}

impl ObservedContainer {
    pub fn new(name: impl Into<String>, init: bool, state: Option<ContainerState>) -> Self {
        Self {
            name: name.into(),
            init,
            state,
        }
    }
}

/// Point-in-time view of a pod and its containers.
///
/// Containers keep the pod spec order with init containers listed before
/// regular containers; the ordering is semantic and must be preserved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodSnapshot {
    pub id: PodId,
    pub containers: Vec<ObservedContainer>,
}

impl PodSnapshot {
    pub fn new(id: PodId) -> Self {
        Self {
            id,
            containers: Vec::new(),
        }
    }

    pub fn with_containers(id: PodId, containers: Vec<ObservedContainer>) -> Self {
        Self { id, containers }
    }

    /// Build the ContainerRef for one observed container of this pod.
    pub fn container_ref(&self, container: &ObservedContainer) -> ContainerRef {
        ContainerRef::new(self.id.clone(), container.name.clone(), container.init)
    }
}

// ============================================================================
// Watch notifications
// ============================================================================

/// What happened to a pod, as far as the engine needs to know.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationKind {
    /// The pod appeared or changed; current state must be re-fetched.
    Upsert,
    /// The pod is gone.
    Delete,
}

/// A resource-change notification delivered by the watch bridge.
///
/// Delivery is at-least-once; the engine's dedup cache absorbs redelivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub id: PodId,
    pub kind: NotificationKind,
}

impl Notification {
    pub fn upsert(id: PodId) -> Self {
        Self {
            id,
            kind: NotificationKind::Upsert,
        }
    }

    pub fn delete(id: PodId) -> Self {
        Self {
            id,
            kind: NotificationKind::Delete,
        }
    }
}

// ============================================================================
// Namespace scope
// ============================================================================

/// Which namespaces a tail session watches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NamespaceScope {
    /// Every namespace in the cluster.
    All,
    /// An explicit, non-empty set of namespaces.
    List(Vec<String>),
    /// The namespace of the current kubeconfig context.
    Current,
}

impl NamespaceScope {
    /// Whether output lines should carry the namespace. A session scoped to
    /// the current context namespace is unambiguous and stays unqualified.
    pub fn is_namespaced(&self) -> bool {
        matches!(self, Self::All | Self::List(_))
    }
}

// ============================================================================
// Tail lifecycle state
// ============================================================================

/// Dedup cache state for one (pod, container).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TailState {
    /// Announced but not yet scheduled (submission was rejected).
    Announced,
    /// A stream task has been submitted for this container.
    Streaming,
    /// The stream ended or the container stopped matching.
    Stopped,
}

// ============================================================================
// Log events
// ============================================================================

/// One emitted log line, consumed exactly once by the formatter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub message: String,
    pub pod_name: String,
    pub container_name: String,
    /// Populated only when output is namespace-qualified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Present only when timestamps were requested and parsed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}
