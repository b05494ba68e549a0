//! Signal-driven shutdown
//!
//! The [`ShutdownCoordinator`] turns SIGINT/SIGTERM into exactly one call
//! to [`Orchestrator::graceful_shutdown`]. Signals arriving while a shutdown
//! is already underway are logged and ignored.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::orchestrator::{Orchestrator, ShutdownReport};

/// An external termination request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGINT / Ctrl-C
    Interrupt,
    /// SIGTERM
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => write!(f, "SIGINT"),
            Self::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// Routes termination signals to the orchestrator
pub struct ShutdownCoordinator {
    orchestrator: Arc<Orchestrator>,
    triggered: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            triggered: AtomicBool::new(false),
        }
    }

    /// Process exit status after a signal-driven shutdown
    pub fn exit_code(&self) -> i32 {
        0
    }

    /// Shut the orchestrator down in response to `signal`
    ///
    /// Only the first signal does anything; duplicates return `None`.
    pub async fn handle(&self, signal: ShutdownSignal) -> Option<ShutdownReport> {
        if self.triggered.swap(true, Ordering::SeqCst) {
            warn!(%signal, "Shutdown already in progress, ignoring signal");
            return None;
        }

        info!(%signal, "Received shutdown signal");
        Some(self.orchestrator.graceful_shutdown().await)
    }

    /// Wait for the first termination signal
    pub async fn wait_for_signal() -> io::Result<ShutdownSignal> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut terminate = signal(SignalKind::terminate())?;
            return tokio::select! {
                result = tokio::signal::ctrl_c() => result.map(|_| ShutdownSignal::Interrupt),
                _ = terminate.recv() => Ok(ShutdownSignal::Terminate),
            };
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await?;
            return Ok(ShutdownSignal::Interrupt);
        }
    }

    /// Wait for a signal and shut down
    ///
    /// Keeps listening after the first signal so that repeated Ctrl-C
    /// presses are absorbed instead of killing the process mid-shutdown.
    pub async fn listen(self: Arc<Self>) -> io::Result<ShutdownReport> {
        let signal = Self::wait_for_signal().await?;

        let repeats = tokio::spawn({
            let coordinator = self.clone();
            async move {
                while let Ok(signal) = Self::wait_for_signal().await {
                    coordinator.handle(signal).await;
                }
            }
        });

        let report = match self.handle(signal).await {
            Some(report) => report,
            None => self.orchestrator.graceful_shutdown().await,
        };
        repeats.abort();
        Ok(report)
    }

    /// Wait for a signal, shut down and exit the process
    pub async fn listen_and_exit(self: Arc<Self>) -> io::Result<()> {
        let code = self.exit_code();
        let report = self.listen().await?;
        if !report.is_clean() {
            warn!(errors = report.errors.len(), "Shutdown reported pool errors");
        }
        info!(code, "Exiting");
        std::process::exit(code)
    }
}

impl fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("triggered", &self.triggered.load(Ordering::SeqCst))
            .finish()
    }
}
