//! Graceful shutdown for the serving process.
//!
//! The HTTP server drains in-flight requests once the coordinator fires.
//! Pending in-memory removal jobs are aborted when their queue drops, so a
//! restart re-derives deletions from the next deactivation.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

/// Fires once, observed by any number of tasks.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
    fired: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Initiate shutdown. Later calls are no-ops.
    pub fn shutdown(&self) {
        if self
            .fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("Initiating graceful shutdown");
            let _ = self.tx.send(true);
        }
    }

    /// Resolves once shutdown has been initiated.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Fires the coordinator on SIGTERM or SIGINT.
    pub async fn listen_for_signals(self) {
        wait_for_signal().await;
        self.shutdown();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "Failed to install signal handlers");
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C"),
        Err(e) => {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await
        }
    }
}

/// Extension for running a future until completion or shutdown.
pub trait ShutdownAware: Sized {
    fn with_shutdown(
        self,
        coordinator: &ShutdownCoordinator,
    ) -> impl Future<Output = Option<Self::Output>> + Send
    where
        Self: Future + Send,
        Self::Output: Send;
}

impl<F> ShutdownAware for F
where
    F: Future + Send,
    F::Output: Send,
{
    async fn with_shutdown(self, coordinator: &ShutdownCoordinator) -> Option<F::Output> {
        tokio::select! {
            result = self => Some(result),
            _ = coordinator.wait_for_shutdown() => {
                info!("Task cancelled due to shutdown");
                None
            }
        }
    }
}
