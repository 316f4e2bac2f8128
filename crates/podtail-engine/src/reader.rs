//! Per-container log stream tasks.
//!
//! A [`StreamTask`] owns the whole life of one container's log stream:
//! open with retry on transient failures, read line by line, parse,
//! filter, format, write. Every exit funnels through the same bookkeeping
//! so the dedup cache and the active index stay truthful about what is
//! actually running.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{AsyncBufReadExt, TryStreamExt};
use parking_lot::Mutex;
use podtail_types::{ContainerRef, LogEvent, PodId, TailState};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::cluster::{Cluster, LogStream, LogStreamOptions};
use crate::color::ColorPair;
use crate::dedup::DedupCache;
use crate::format::LogFormatter;
use crate::query::Query;
use crate::sink::OutputSink;

const BACKOFF_INITIAL: Duration = Duration::from_millis(200);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Doubling retry delay for transient stream-open failures.
struct Backoff {
    delay: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            delay: BACKOFF_INITIAL,
        }
    }

    fn next(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = (delay * 2).min(BACKOFF_MAX);
        delay
    }
}

/// Sleep for `delay` unless cancelled first; returns false on cancellation.
async fn sleep_or_cancel(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

struct ActiveEntry {
    cancel: CancellationToken,
    id: u64,
}

#[derive(Default)]
struct ActiveInner {
    tasks: HashMap<ContainerRef, ActiveEntry>,
    next_id: u64,
}

/// Side index from container identity to its running task's cancel handle.
///
/// Entries carry a generation id: a finished task deregisters itself only
/// while its own id still holds the slot, so a successor registered in the
/// meantime is left alone.
#[derive(Default)]
pub struct ActiveIndex {
    inner: Mutex<ActiveInner>,
}

impl ActiveIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task for `target`, returning its generation id.
    pub fn insert(&self, target: &ContainerRef, cancel: CancellationToken) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.tasks.insert(target.clone(), ActiveEntry { cancel, id });
        id
    }

    #[must_use]
    pub fn contains(&self, target: &ContainerRef) -> bool {
        self.inner.lock().tasks.contains_key(target)
    }

    /// Cancel and deregister the task for `target`; false when none runs.
    pub fn cancel(&self, target: &ContainerRef) -> bool {
        match self.inner.lock().tasks.remove(target) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Identities of this pod's registered tasks.
    #[must_use]
    pub fn refs_for_pod(&self, pod: &PodId) -> Vec<ContainerRef> {
        self.inner
            .lock()
            .tasks
            .keys()
            .filter(|r| r.pod == *pod)
            .cloned()
            .collect()
    }

    /// Deregistration on task exit. A mismatched id means a successor took
    /// the slot and must stay registered.
    pub fn remove_task(&self, target: &ContainerRef, id: u64) {
        let mut inner = self.inner.lock();
        if inner.tasks.get(target).is_some_and(|e| e.id == id) {
            inner.tasks.remove(target);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything a stream task needs, shared across all of them.
pub struct StreamContext {
    pub cluster: Arc<dyn Cluster>,
    pub query: Arc<Query>,
    pub formatter: Arc<LogFormatter>,
    pub sink: Arc<OutputSink>,
    pub dedup: Arc<DedupCache>,
    pub active: Arc<ActiveIndex>,
    pub options: LogStreamOptions,
    /// Tag events with their namespace (multi-namespace sessions).
    pub namespaced: bool,
}

/// One container's log stream from open to exit.
pub struct StreamTask {
    pub target: ContainerRef,
    pub colors: ColorPair,
    pub cancel: CancellationToken,
    /// Generation id assigned by [`ActiveIndex::insert`].
    pub id: u64,
}

impl StreamTask {
    /// Drive the stream to completion.
    ///
    /// The dedup entry moves to `Stopped` before the active index slot is
    /// released; announcements for the stop are the reconciler's business,
    /// a natural end of stream stays silent.
    pub async fn run(self, ctx: Arc<StreamContext>) {
        self.tail(&ctx).await;
        ctx.dedup.check_and_mark(&self.target, TailState::Stopped);
        ctx.active.remove_task(&self.target, self.id);
    }

    async fn tail(&self, ctx: &StreamContext) {
        let Some(stream) = self.open_with_retry(ctx).await else {
            return;
        };
        let mut lines = stream.lines();
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!(container = %self.target, "stream cancelled");
                    return;
                }
                line = lines.try_next() => match line {
                    Ok(Some(line)) => {
                        if !self.emit(ctx, &line) {
                            return;
                        }
                    }
                    Ok(None) => {
                        debug!(container = %self.target, "log stream ended");
                        return;
                    }
                    Err(error) => {
                        warn!(%error, container = %self.target, "log stream read failed");
                        return;
                    }
                }
            }
        }
    }

    async fn open_with_retry(&self, ctx: &StreamContext) -> Option<LogStream> {
        let mut backoff = Backoff::new();
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            match ctx.cluster.open_log_stream(&self.target, &ctx.options).await {
                Ok(stream) => return Some(stream),
                Err(error) if error.is_not_found() => {
                    debug!(container = %self.target, "container gone before its stream opened");
                    return None;
                }
                Err(error) if error.is_transient() => {
                    let delay = backoff.next();
                    warn!(%error, ?delay, container = %self.target, "stream open failed, backing off");
                    if !sleep_or_cancel(&self.cancel, delay).await {
                        return None;
                    }
                }
                Err(error) => {
                    warn!(%error, container = %self.target, "failed to open log stream");
                    return None;
                }
            }
        }
    }

    /// Process one raw line; false ends the stream.
    fn emit(&self, ctx: &StreamContext, raw: &str) -> bool {
        let line = raw.trim_end_matches('\r');
        let (timestamp, message) = if ctx.options.timestamps {
            split_timestamp(line)
        } else {
            (None, line)
        };
        if !ctx.query.line_passes(message) {
            return true;
        }

        let event = LogEvent {
            message: message.to_string(),
            pod_name: self.target.pod.name.clone(),
            container_name: self.target.container.clone(),
            namespace: ctx.namespaced.then(|| self.target.pod.namespace.clone()),
            timestamp,
        };
        let rendered = match ctx.formatter.render(&event, self.colors) {
            Ok(rendered) => rendered,
            Err(error) => {
                error!(%error, container = %self.target, "failed to render log event");
                return false;
            }
        };
        match ctx.sink.write_line(&rendered) {
            Ok(()) => true,
            Err(error) if error.kind() == io::ErrorKind::BrokenPipe => {
                debug!(container = %self.target, "output closed, ending stream");
                false
            }
            Err(error) => {
                error!(%error, container = %self.target, "failed to write log line");
                false
            }
        }
    }
}

/// Split the leading timestamp token the cluster prepends when timestamps
/// were requested. A token that does not parse leaves the whole line as the
/// message; lines are never dropped over it.
fn split_timestamp(line: &str) -> (Option<DateTime<Utc>>, &str) {
    if let Some((token, rest)) = line.split_once(' ') {
        if let Ok(ts) = DateTime::parse_from_rfc3339(token) {
            return (Some(ts.with_timezone(&Utc)), rest);
        }
    }
    (None, line)
}
