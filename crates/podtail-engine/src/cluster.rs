//! Cluster connection seam.
//!
//! The engine never talks to a cluster API directly; everything it needs
//! goes through the [`Cluster`] trait. The real client lives in a separate
//! crate, and [`mock::MockCluster`] provides a scriptable in-memory cluster
//! for tests.

use std::pin::Pin;

use async_trait::async_trait;
use futures::AsyncBufRead;
use podtail_types::{ContainerRef, PodId, PodSnapshot};
use thiserror::Error;

use crate::config::EngineConfig;

/// A line-oriented log byte stream from the cluster.
pub type LogStream = Pin<Box<dyn AsyncBufRead + Send>>;

/// Failure classes for cluster calls.
///
/// The split drives very different reactions: `NotFound` ends work on the
/// target quietly, `Transient` is retried with backoff, and `Api` is
/// surfaced as a real error.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("resource not found")]
    NotFound,
    #[error("transient cluster error: {0}")]
    Transient(String),
    #[error("cluster api error: {0}")]
    Api(Box<dyn std::error::Error + Send + Sync>),
}

impl ClusterError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Options for opening one log stream.
#[derive(Debug, Clone, Default)]
pub struct LogStreamOptions {
    pub follow: bool,
    pub since_seconds: Option<i64>,
    pub tail_lines: Option<i64>,
    pub timestamps: bool,
}

impl LogStreamOptions {
    /// The options every stream of a tail session shares.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            follow: true,
            since_seconds: config.since_seconds,
            tail_lines: config.tail_lines,
            timestamps: config.timestamps,
        }
    }
}

/// Read access to a cluster, narrowed to what tailing needs.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Fetch the current state of one pod.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::NotFound`] when the pod no longer exists,
    /// which callers treat as a deletion rather than a failure.
    async fn get_pod(&self, id: &PodId) -> Result<PodSnapshot, ClusterError>;

    /// Open a log stream for one container.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::NotFound`] when the container is gone and
    /// [`ClusterError::Transient`] for failures worth retrying.
    async fn open_log_stream(
        &self,
        target: &ContainerRef,
        options: &LogStreamOptions,
    ) -> Result<LogStream, ClusterError>;
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    //! Scriptable in-memory cluster.

    use std::collections::{HashMap, VecDeque};
    use std::io;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};

    use async_trait::async_trait;
    use futures::io::Cursor;
    use futures::{AsyncBufRead, AsyncRead};
    use parking_lot::Mutex;
    use podtail_types::{ContainerRef, PodId, PodSnapshot};

    use super::{Cluster, ClusterError, LogStream, LogStreamOptions};

    /// What the next `open_log_stream` call for a target should produce.
    pub enum StreamScript {
        /// A stream yielding these lines, then end of stream.
        Lines(Vec<String>),
        /// A stream that stays open and never yields a line.
        Pending,
        /// An open failure.
        Fail(ClusterError),
    }

    #[derive(Default)]
    struct OpenCounter {
        current: AtomicUsize,
        max: AtomicUsize,
    }

    struct OpenGuard {
        counter: Arc<OpenCounter>,
    }

    impl OpenGuard {
        fn acquire(counter: &Arc<OpenCounter>) -> Self {
            let now = counter.current.fetch_add(1, Ordering::SeqCst) + 1;
            counter.max.fetch_max(now, Ordering::SeqCst);
            Self {
                counter: Arc::clone(counter),
            }
        }
    }

    impl Drop for OpenGuard {
        fn drop(&mut self) {
            self.counter.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MockInner {
        pods: HashMap<PodId, PodSnapshot>,
        get_failures: HashMap<PodId, VecDeque<ClusterError>>,
        scripts: HashMap<ContainerRef, VecDeque<StreamScript>>,
    }

    /// In-memory [`Cluster`] with scripted pods and log streams.
    ///
    /// Streams for targets with no remaining script fail with `NotFound`,
    /// matching a container that disappeared between reconciliation and
    /// stream open. Open-stream counts are tracked so tests can assert
    /// concurrency bounds.
    #[derive(Default)]
    pub struct MockCluster {
        inner: Mutex<MockInner>,
        counter: Arc<OpenCounter>,
    }

    impl MockCluster {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Insert or replace a pod.
        pub fn put_pod(&self, snapshot: PodSnapshot) {
            self.inner.lock().pods.insert(snapshot.id.clone(), snapshot);
        }

        pub fn remove_pod(&self, id: &PodId) {
            self.inner.lock().pods.remove(id);
        }

        /// Make the next `get_pod` for `id` fail with `error`.
        pub fn fail_next_get(&self, id: &PodId, error: ClusterError) {
            self.inner
                .lock()
                .get_failures
                .entry(id.clone())
                .or_default()
                .push_back(error);
        }

        /// Queue the outcome of the next `open_log_stream` for `target`.
        pub fn script_stream(&self, target: &ContainerRef, script: StreamScript) {
            self.inner
                .lock()
                .scripts
                .entry(target.clone())
                .or_default()
                .push_back(script);
        }

        /// Streams open right now.
        #[must_use]
        pub fn open_streams(&self) -> usize {
            self.counter.current.load(Ordering::SeqCst)
        }

        /// High-water mark of concurrently open streams.
        #[must_use]
        pub fn max_open_streams(&self) -> usize {
            self.counter.max.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Cluster for MockCluster {
        async fn get_pod(&self, id: &PodId) -> Result<PodSnapshot, ClusterError> {
            let mut inner = self.inner.lock();
            if let Some(queue) = inner.get_failures.get_mut(id) {
                if let Some(error) = queue.pop_front() {
                    return Err(error);
                }
            }
            inner.pods.get(id).cloned().ok_or(ClusterError::NotFound)
        }

        async fn open_log_stream(
            &self,
            target: &ContainerRef,
            _options: &LogStreamOptions,
        ) -> Result<LogStream, ClusterError> {
            let script = self
                .inner
                .lock()
                .scripts
                .get_mut(target)
                .and_then(VecDeque::pop_front);
            match script {
                None => Err(ClusterError::NotFound),
                Some(StreamScript::Fail(error)) => Err(error),
                Some(StreamScript::Lines(lines)) => {
                    let mut bytes = Vec::new();
                    for line in lines {
                        bytes.extend_from_slice(line.as_bytes());
                        bytes.push(b'\n');
                    }
                    Ok(Box::pin(CannedStream {
                        cursor: Cursor::new(bytes),
                        _guard: OpenGuard::acquire(&self.counter),
                    }))
                }
                Some(StreamScript::Pending) => Ok(Box::pin(PendingStream {
                    _guard: OpenGuard::acquire(&self.counter),
                })),
            }
        }
    }

    struct CannedStream {
        cursor: Cursor<Vec<u8>>,
        _guard: OpenGuard,
    }

    impl AsyncRead for CannedStream {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut [u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.get_mut().cursor).poll_read(cx, buf)
        }
    }

    impl AsyncBufRead for CannedStream {
        fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
            Pin::new(&mut self.get_mut().cursor).poll_fill_buf(cx)
        }

        fn consume(self: Pin<&mut Self>, amt: usize) {
            Pin::new(&mut self.get_mut().cursor).consume(amt);
        }
    }

    /// Never yields data and never ends; released only by cancellation.
    struct PendingStream {
        _guard: OpenGuard,
    }

    impl AsyncRead for PendingStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut [u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Pending
        }
    }

    impl AsyncBufRead for PendingStream {
        fn poll_fill_buf(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
            Poll::Pending
        }

        fn consume(self: Pin<&mut Self>, _amt: usize) {}
    }
}
