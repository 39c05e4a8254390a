//! Graceful Shutdown Handler
//!
//! One shutdown request fans out to every task holding a `ShutdownToken`.
//! The signal is kept in a watch channel, so a token created after the
//! request still observes it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM / SIGINT
    Graceful,
    /// SIGQUIT, or the coordinator went away without a request
    Urgent,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Urgent => write!(f, "urgent"),
        }
    }
}

/// Where the engine is in its shutdown sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    /// No new ticks are started
    StoppingTicks,
    /// `stop` issued for every live worker
    StoppingWorkers,
    /// Final ledger snapshot
    PersistingLedger,
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ShutdownPhase::Running => "running",
            ShutdownPhase::StoppingTicks => "stopping_ticks",
            ShutdownPhase::StoppingWorkers => "stopping_workers",
            ShutdownPhase::PersistingLedger => "persisting_ledger",
            ShutdownPhase::Complete => "complete",
        };
        write!(f, "{}", s)
    }
}

/// Shutdown coordinator
pub struct GracefulShutdown {
    shutdown_requested: AtomicBool,
    signal_tx: watch::Sender<Option<ShutdownSignal>>,
    phase: Arc<watch::Sender<ShutdownPhase>>,
    phase_rx: watch::Receiver<ShutdownPhase>,
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (signal_tx, _) = watch::channel(None);
        let (phase_tx, phase_rx) = watch::channel(ShutdownPhase::Running);
        Self {
            shutdown_requested: AtomicBool::new(false),
            signal_tx,
            phase: Arc::new(phase_tx),
            phase_rx,
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase_rx.borrow()
    }

    /// Request shutdown; only the first request counts
    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already requested, ignoring duplicate signal: {}", signal);
            return;
        }

        info!("Shutdown requested: {}", signal);
        self.signal_tx.send_replace(Some(signal));
    }

    /// Token for a task that needs to react to shutdown
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            signal_rx: self.signal_tx.subscribe(),
            phase: self.phase.clone(),
        }
    }
}

/// Handle given to long-running tasks
pub struct ShutdownToken {
    signal_rx: watch::Receiver<Option<ShutdownSignal>>,
    phase: Arc<watch::Sender<ShutdownPhase>>,
}

impl ShutdownToken {
    pub fn is_shutdown_requested(&self) -> bool {
        self.signal_rx.borrow().is_some()
    }

    /// Resolve once shutdown is requested. Returns immediately if it already was.
    pub async fn wait_for_shutdown(&mut self) -> ShutdownSignal {
        loop {
            if let Some(signal) = *self.signal_rx.borrow_and_update() {
                return signal;
            }
            if self.signal_rx.changed().await.is_err() {
                return ShutdownSignal::Urgent;
            }
        }
    }

    /// Report progress of the shutdown sequence
    pub fn set_phase(&self, phase: ShutdownPhase) {
        self.phase.send_replace(phase);
        info!("Shutdown phase: {}", phase);
    }
}

/// Install OS signal handlers that request shutdown
pub fn install_signal_handlers(shutdown: Arc<GracefulShutdown>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let handlers = [
            (SignalKind::terminate(), "SIGTERM", ShutdownSignal::Graceful),
            (SignalKind::interrupt(), "SIGINT", ShutdownSignal::Graceful),
            (SignalKind::quit(), "SIGQUIT", ShutdownSignal::Urgent),
        ];

        for (kind, name, kind_signal) in handlers {
            let shutdown = shutdown.clone();
            match signal(kind) {
                Ok(mut stream) => {
                    tokio::spawn(async move {
                        stream.recv().await;
                        info!("Received {}", name);
                        shutdown.request_shutdown(kind_signal);
                    });
                }
                Err(e) => error!("Failed to install {} handler: {}", name, e),
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C");
                    shutdown.request_shutdown(ShutdownSignal::Graceful);
                }
                Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_display() {
        assert_eq!(ShutdownSignal::Graceful.to_string(), "graceful");
        assert_eq!(ShutdownSignal::Urgent.to_string(), "urgent");
        assert_eq!(ShutdownPhase::StoppingWorkers.to_string(), "stopping_workers");
        assert_eq!(ShutdownPhase::Complete.to_string(), "complete");
    }

    #[tokio::test]
    async fn test_duplicate_request_keeps_first_signal() {
        let shutdown = GracefulShutdown::new();
        let mut token = shutdown.token();
        assert!(!shutdown.is_shutdown_requested());
        assert!(!token.is_shutdown_requested());

        shutdown.request_shutdown(ShutdownSignal::Graceful);
        shutdown.request_shutdown(ShutdownSignal::Urgent);

        assert!(token.is_shutdown_requested());
        assert_eq!(token.wait_for_shutdown().await, ShutdownSignal::Graceful);
    }

    #[tokio::test]
    async fn test_late_token_sees_earlier_request() {
        let shutdown = GracefulShutdown::new();
        shutdown.request_shutdown(ShutdownSignal::Urgent);

        let mut token = shutdown.token();
        let signal = tokio::time::timeout(Duration::from_millis(100), token.wait_for_shutdown())
            .await
            .unwrap();
        assert_eq!(signal, ShutdownSignal::Urgent);
    }

    #[tokio::test]
    async fn test_token_wakes_waiting_task() {
        let shutdown = Arc::new(GracefulShutdown::new());
        let mut token = shutdown.token();

        let waiter = tokio::spawn(async move { token.wait_for_shutdown().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.request_shutdown(ShutdownSignal::Graceful);

        assert_eq!(waiter.await.unwrap(), ShutdownSignal::Graceful);
    }

    #[test]
    fn test_coordinator_sees_token_phases() {
        let shutdown = GracefulShutdown::new();
        let token = shutdown.token();
        assert_eq!(shutdown.current_phase(), ShutdownPhase::Running);

        token.set_phase(ShutdownPhase::StoppingWorkers);
        assert_eq!(shutdown.current_phase(), ShutdownPhase::StoppingWorkers);

        token.set_phase(ShutdownPhase::Complete);
        assert_eq!(shutdown.current_phase(), ShutdownPhase::Complete);
    }
}
