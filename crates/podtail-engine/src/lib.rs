//! Reconciliation and log streaming engine for podtail
//!
//! This crate turns pod-change notifications into running container log
//! streams: filtering, dedup, bounded scheduling, reading, formatting, and
//! the reconciler that ties them together. It talks to the cluster only
//! through the [`Cluster`] trait, so everything here is testable against
//! the in-memory mock.

mod cluster;
mod color;
mod config;
mod dedup;
mod error;
mod format;
mod pool;
mod predicate;
mod query;
mod reader;
mod reconciler;
mod sink;

pub use cluster::{Cluster, ClusterError, LogStream, LogStreamOptions};
pub use color::{ColorMode, ColorPair, ColorPalette};
pub use config::{EngineConfig, MAX_WORKERS};
pub use dedup::{DedupCache, Transition};
pub use error::{EngineError, Result};
pub use format::{LogFormatter, OutputFormat};
pub use pool::{StreamPool, SubmitError};
pub use predicate::PodFilter;
pub use query::Query;
pub use reader::{ActiveIndex, StreamContext, StreamTask};
pub use reconciler::Reconciler;
pub use sink::OutputSink;

#[cfg(any(test, feature = "test-utils"))]
pub use cluster::mock;
#[cfg(any(test, feature = "test-utils"))]
pub use sink::CapturedOutput;

// Re-export types that are used in our public API
pub use podtail_types::{
    ContainerRef, ContainerState, LogEvent, NamespaceScope, Notification, NotificationKind,
    ObservedContainer, PodId, PodSnapshot, TailState,
};
