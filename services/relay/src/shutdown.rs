//! Signal handling and graceful shutdown.
//!
//! On SIGINT or SIGTERM the listeners stop taking new work, in-flight
//! datagrams get a bounded drain window, then every session and upstream
//! channel is closed.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::relay::Relay;

/// Default drain window.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Wait for SIGINT or SIGTERM. Returns the signal name.
pub async fn wait_for_signal() -> io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
            _ = sigterm.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.map(|_| "SIGINT")
    }
}

/// Broadcasts the stop request and drives the drain.
pub struct Shutdown {
    tx: watch::Sender<bool>,
    timeout: Duration,
}

impl Shutdown {
    pub fn new(timeout: Duration) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx, timeout }
    }

    /// Receiver that flips to true when shutdown starts.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Stop listeners, drain in-flight work, close all sessions.
    ///
    /// Returns true when everything finished inside the drain window.
    pub async fn run(&self, relay: &Arc<Relay>, tasks: Vec<JoinHandle<()>>) -> bool {
        info!(timeout_ms = self.timeout.as_millis() as u64, "Shutting down");
        self.tx.send_replace(true);

        let deadline = tokio::time::Instant::now() + self.timeout;

        let mut clean = true;
        for task in tasks {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if timeout(remaining, task).await.is_err() {
                warn!("Task did not stop before the drain deadline");
                clean = false;
            }
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        clean &= relay.drain(remaining).await;

        relay.log_stats().await;
        info!(clean, "Shutdown complete");
        clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_trigger() {
        let shutdown = Shutdown::new(DEFAULT_SHUTDOWN_TIMEOUT);
        let mut rx = shutdown.subscribe();
        assert!(!*rx.borrow());

        shutdown.tx.send_replace(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(*shutdown.subscribe().borrow());
    }
}
