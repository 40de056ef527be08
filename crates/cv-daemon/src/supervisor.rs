use std::fmt;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Lifecycle of the daemon's background loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for SupervisorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SupervisorStatus::Starting => "starting",
            SupervisorStatus::Running => "running",
            SupervisorStatus::Stopping => "stopping",
            SupervisorStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Owner side: held by the loops and updated as they progress.
#[derive(Debug)]
pub struct Supervisor {
    token: CancellationToken,
    status: watch::Sender<SupervisorStatus>,
}

impl Supervisor {
    pub fn new() -> (Self, SupervisorHandle) {
        let token = CancellationToken::new();
        let (tx, rx) = watch::channel(SupervisorStatus::Starting);
        let handle = SupervisorHandle {
            token: token.clone(),
            status: rx,
        };
        (Self { token, status: tx }, handle)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn set_status(&self, status: SupervisorStatus) {
        self.status.send_replace(status);
    }
}

/// Cloneable control handle for a running daemon.
///
/// ```ignore
/// let handle = daemon.start().await?;
/// handle.shutdown();
/// handle.wait_stopped().await;
/// ```
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    token: CancellationToken,
    status: watch::Receiver<SupervisorStatus>,
}

impl SupervisorHandle {
    /// Ask every loop to stop. Idempotent.
    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            info!("shutdown requested");
        }
        self.token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn status(&self) -> SupervisorStatus {
        *self.status.borrow()
    }

    /// Resolves once the loops report `Stopped`, or the owner is dropped.
    pub async fn wait_stopped(&self) {
        let mut rx = self.status.clone();
        // Err: the owner was dropped.
        let _ = rx.wait_for(|s| *s == SupervisorStatus::Stopped).await;
    }

    /// A token that fires on shutdown, for callers running their own loops.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_flows_to_handle() {
        let (supervisor, handle) = Supervisor::new();
        assert_eq!(handle.status(), SupervisorStatus::Starting);
        supervisor.set_status(SupervisorStatus::Running);
        assert_eq!(handle.status(), SupervisorStatus::Running);

        handle.shutdown();
        assert!(supervisor.token().is_cancelled());
        supervisor.set_status(SupervisorStatus::Stopped);
        handle.wait_stopped().await;
    }

    #[tokio::test]
    async fn dropped_supervisor_unblocks_waiters() {
        let (supervisor, handle) = Supervisor::new();
        drop(supervisor);
        handle.wait_stopped().await;
    }
}
