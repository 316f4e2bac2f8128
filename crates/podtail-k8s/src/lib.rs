//! Kubernetes access for podtail
//!
//! This crate connects the engine to a real cluster: a `kube`-backed
//! implementation of the engine's `Cluster` trait, plus the watcher bridge
//! that feeds pod-change notifications into the reconciler.

mod client;
mod watch;

pub use client::KubeCluster;
pub use watch::{resolve_namespaces, spawn_pod_watcher};

// Re-export types that are used in our public API
pub use podtail_types::{NamespaceScope, Notification, PodId};
