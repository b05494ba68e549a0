//! Top-level lifecycle owner
//!
//! The [`Orchestrator`] owns every pool plus the [`AutoScaler`]. Startup
//! validates every processor before any worker runs; a failure anywhere
//! during startup tears the whole system down. Shutdown is guarded so that
//! its body runs exactly once no matter how many callers race on it.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{watch, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::AutoScalerConfig;
use crate::error::{OrchestratorError, ShutdownError};
use crate::pool::{ManagedPool, PoolStats};
use crate::resources::ResourceManager;
use crate::scaler::AutoScaler;

/// Outcome of [`Orchestrator::graceful_shutdown`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// `(pool, error)` pairs collected while stopping
    pub errors: Vec<(String, ShutdownError)>,
}

impl ShutdownReport {
    /// Whether every pool stopped without error
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Owns the pools and the autoscaler
pub struct Orchestrator {
    run_id: Uuid,
    resources: Arc<ResourceManager>,
    pools: Vec<Arc<dyn ManagedPool>>,
    scaler: Arc<AutoScaler>,
    /// Set once startup has succeeded or failed
    settled: watch::Sender<bool>,
    shutting_down: CancellationToken,
    shutdown: OnceCell<ShutdownReport>,
}

impl Orchestrator {
    /// Create an orchestrator for `pools`, in pipeline order
    pub fn new(
        resources: Arc<ResourceManager>,
        scaler_config: AutoScalerConfig,
        pools: Vec<Arc<dyn ManagedPool>>,
    ) -> Self {
        let scaler = Arc::new(AutoScaler::new(
            pools.clone(),
            resources.clone(),
            scaler_config,
        ));

        Self {
            run_id: Uuid::now_v7(),
            resources,
            pools,
            scaler,
            settled: watch::channel(false).0,
            shutting_down: CancellationToken::new(),
            shutdown: OnceCell::new(),
        }
    }

    /// Identifier of this run, attached to lifecycle logs
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn scaler(&self) -> &Arc<AutoScaler> {
        &self.scaler
    }

    /// Look up a pool by id
    pub fn pool(&self, id: &str) -> Option<&Arc<dyn ManagedPool>> {
        self.pools.iter().find(|pool| pool.id() == id)
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        self.pools.iter().map(|pool| pool.stats()).collect()
    }

    /// Whether `graceful_shutdown` has completed
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.initialized()
    }

    /// Start every pool, reconcile, then wait until all pools are stopped
    ///
    /// Pools start with zero workers so that every processor is validated
    /// before any worker runs; the initial reconciliation then scales each
    /// pool to its desired count. Any startup error triggers
    /// [`graceful_shutdown`](Self::graceful_shutdown) before it is returned.
    #[instrument(skip(self), fields(run_id = %self.run_id))]
    pub async fn start(&self) -> Result<(), OrchestratorError> {
        info!(pools = self.pools.len(), "Starting orchestrator");

        let launched = self.launch().await;
        self.settled.send_replace(true);
        if let Err(err) = launched {
            error!(error = %err, "Startup failed, shutting down");
            self.graceful_shutdown().await;
            return Err(err);
        }

        join_all(self.pools.iter().map(|pool| pool.wait_stopped())).await;

        let report = self.graceful_shutdown().await;
        if !report.is_clean() {
            return Err(OrchestratorError::Shutdown(report));
        }
        info!("Orchestrator finished");
        Ok(())
    }

    async fn launch(&self) -> Result<(), OrchestratorError> {
        for pool in &self.pools {
            pool.start(0).await?;
        }
        let decisions = self.scaler.reconcile().await?;
        self.scaler.spawn_loop();

        info!(
            workers = decisions.iter().map(|d| d.target).sum::<usize>(),
            "Orchestrator running"
        );
        Ok(())
    }

    /// Stop the autoscaler, then every pool
    ///
    /// The body runs once; concurrent and later callers wait for it and
    /// receive the same report.
    pub async fn graceful_shutdown(&self) -> ShutdownReport {
        self.shutdown
            .get_or_init(|| self.shutdown_once())
            .await
            .clone()
    }

    async fn shutdown_once(&self) -> ShutdownReport {
        info!(run_id = %self.run_id, "Graceful shutdown started");
        self.shutting_down.cancel();
        self.settled.send_replace(true);

        let mut errors = self.scaler.stop().await;
        for pool in &self.pools {
            if let Err(err) = pool.stop().await {
                errors.push((pool.id().to_string(), err));
            }
        }

        for (pool, err) in &errors {
            warn!(pool = %pool, error = %err, "Pool did not stop cleanly");
        }
        info!(
            run_id = %self.run_id,
            errors = errors.len(),
            "Graceful shutdown complete"
        );
        ShutdownReport { errors }
    }

    /// Wait for every input queue to be fully processed, then shut down
    ///
    /// Waits for [`start`](Self::start) to bring the pools up first, so that
    /// input enqueued before startup is not mistaken for drained input.
    /// Pools are drained one after another in pipeline order, so results an
    /// upstream pool pushes downstream are processed before the downstream
    /// queue is considered drained.
    pub async fn drain(&self) -> ShutdownReport {
        let mut settled = self.settled.subscribe();
        // The sender lives as long as `self`
        let _ = settled.wait_for(|settled| *settled).await;

        let drained = async {
            for pool in &self.pools {
                pool.drain_input().await;
                info!(pool = %pool.id(), "Input drained");
            }
        };
        tokio::select! {
            _ = drained => {}
            _ = self.shutting_down.cancelled() => {
                info!("Shutdown started before input was drained");
            }
        }
        self.graceful_shutdown().await
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("run_id", &self.run_id)
            .field("pools", &self.pools.len())
            .field("scaler", &self.scaler)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
