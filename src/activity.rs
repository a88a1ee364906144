use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// Tracks when a session last saw output or input.
///
/// Each activity bumps a monotonic generation counter, so a client that
/// polls context can tell "nothing happened since last time" apart from
/// "something happened and went quiet again".
#[derive(Clone)]
pub struct ActivityTracker {
    tx: Arc<watch::Sender<Instant>>,
    generation: Arc<AtomicU64>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Instant::now());
        Self {
            tx: Arc::new(tx),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record activity. Safe to call from blocking threads.
    pub fn touch(&self) {
        self.generation.fetch_add(1, Ordering::Release);
        self.tx.send_replace(Instant::now());
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Milliseconds since the last activity (or since creation).
    pub fn idle_ms(&self) -> u64 {
        self.tx.borrow().elapsed().as_millis() as u64
    }
}
