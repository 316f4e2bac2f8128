//! Bounded worker pool for stream tasks.
//!
//! A fixed number of workers pull [`StreamTask`]s off one queue, so no
//! matter how many containers match a session, at most `workers` log
//! streams are open at once. The queue itself is bounded too; a full queue
//! rejects the submission and the caller rolls its bookkeeping back and
//! waits for the watch to redeliver.

use std::sync::Arc;

use parking_lot::Mutex;
use podtail_types::TailState;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::config::EngineConfig;
use crate::reader::{StreamContext, StreamTask};

/// Why a task submission was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("stream task queue is full")]
    Saturated,
    #[error("stream pool is shut down")]
    Closed,
}

/// Fixed-size executor for [`StreamTask`]s.
pub struct StreamPool {
    tx: mpsc::Sender<StreamTask>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamPool {
    /// Spawn the worker set. Streams started by this pool are cancelled
    /// when `parent` is, or on [`shutdown`](Self::shutdown).
    #[must_use]
    pub fn new(ctx: Arc<StreamContext>, config: &EngineConfig, parent: &CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_depth);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let cancel = parent.child_token();
        let workers = (0..config.workers)
            .map(|worker_id| {
                tokio::spawn(worker(
                    worker_id,
                    Arc::clone(&rx),
                    Arc::clone(&ctx),
                    cancel.clone(),
                ))
            })
            .collect();
        Self {
            tx,
            cancel,
            workers: Mutex::new(workers),
        }
    }

    /// Queue a task without waiting.
    pub fn submit(&self, task: StreamTask) -> Result<(), SubmitError> {
        self.tx.try_send(task).map_err(|error| match error {
            mpsc::error::TrySendError::Full(_) => SubmitError::Saturated,
            mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
        })
    }

    /// Cancellation token for one stream task, tied to the pool's own.
    #[must_use]
    pub fn stream_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Cancel every running stream and wait for the workers to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(error) = handle.await {
                if error.is_panic() {
                    error!(%error, "pool worker panicked");
                }
            }
        }
    }
}

async fn worker(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<StreamTask>>>,
    ctx: Arc<StreamContext>,
    cancel: CancellationToken,
) {
    loop {
        let task = tokio::select! {
            () = cancel.cancelled() => return,
            task = async {
                let mut guard = rx.lock().await;
                guard.recv().await
            } => task,
        };
        let Some(task) = task else {
            return;
        };

        // Run the task as its own tokio task so a panic is contained to
        // this one stream instead of taking the worker down with it.
        let container = task.target.clone();
        let task_id = task.id;
        let handle = tokio::spawn(task.run(Arc::clone(&ctx)));
        if let Err(join_error) = handle.await {
            if join_error.is_panic() {
                error!(worker = worker_id, container = %container, "stream task panicked");
                // The task died before its own exit bookkeeping ran.
                ctx.dedup.check_and_mark(&container, TailState::Stopped);
                ctx.active.remove_task(&container, task_id);
            }
        }
    }
}
