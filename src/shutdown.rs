use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Tells every live bridge connection to close, and tracks how many are
/// still open.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    tx: Arc<watch::Sender<bool>>,
    active: Arc<watch::Sender<usize>>,
}

/// Held by a connection for its lifetime.
pub struct ConnectionGuard {
    active: Arc<watch::Sender<usize>>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        let (active, _) = watch::channel(0usize);
        Self {
            tx: Arc::new(tx),
            active: Arc::new(active),
        }
    }

    /// Register a connection. The receiver flips to `true` on shutdown.
    pub fn register(&self) -> (ConnectionGuard, watch::Receiver<bool>) {
        self.active.send_modify(|n| *n += 1);
        (
            ConnectionGuard {
                active: self.active.clone(),
            },
            self.tx.subscribe(),
        )
    }

    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn active_connections(&self) -> usize {
        *self.active.borrow()
    }

    /// Wait until every registered connection has dropped its guard, or
    /// `timeout` passes. Returns whether all connections closed.
    pub async fn wait_for_all_closed(&self, timeout: Duration) -> bool {
        let mut active = self.active.subscribe();
        // The sender lives in `self`, so `wait_for` only ends on a match.
        let closed = matches!(
            tokio::time::timeout(timeout, active.wait_for(|n| *n == 0)).await,
            Ok(Ok(_))
        );
        closed
    }
}
