//! Signal handling and the root cancellation token.

use tokio_util::sync::CancellationToken;

/// Why the process is stopping.
#[derive(Debug, Clone, Copy)]
pub enum ShutdownReason {
    CtrlC,
    Sigterm,
}

/// Owner of the root cancellation token; every engine and watcher token
/// descends from it.
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    #[must_use]
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for Ctrl+C (SIGINT) and cancel the token.
pub async fn wait_ctrl_c(shutdown: &Shutdown) -> ShutdownReason {
    let _ = tokio::signal::ctrl_c().await;
    shutdown.cancel();
    ShutdownReason::CtrlC
}

/// Wait for SIGTERM on Unix. On other platforms this resolves only once
/// something else cancels the token.
#[cfg(unix)]
pub async fn wait_sigterm(shutdown: &Shutdown) -> ShutdownReason {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sig) => {
            sig.recv().await;
            shutdown.cancel();
            ShutdownReason::Sigterm
        }
        Err(_) => {
            // Registration failed; never fire on our own.
            shutdown.token().cancelled().await;
            ShutdownReason::Sigterm
        }
    }
}

#[cfg(not(unix))]
pub async fn wait_sigterm(shutdown: &Shutdown) -> ShutdownReason {
    shutdown.token().cancelled().await;
    ShutdownReason::Sigterm
}
