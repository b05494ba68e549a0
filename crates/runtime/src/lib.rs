//! # kgflow Runtime
//!
//! The concurrency core of the kgflow pipeline: worker pools pull units of
//! work from queues, run them through a pluggable [`Processor`], and are
//! resized by a budget-aware autoscaler, with coordinated graceful shutdown.
//!
//! ## Features
//!
//! - **Work queues**: bounded or unbounded FIFO with end-of-stream markers and `join`
//! - **Worker pools**: cooperative scale-down, grace-deadline stop, per-task error isolation
//! - **Global budget**: one [`ResourceManager`] bounds the worker total across all pools
//! - **Autoscaling**: over-budget requests are rejected wholesale, never partially applied
//! - **Shutdown**: runs exactly once, on drain, internal failure or SIGINT/SIGTERM
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ShutdownCoordinator                          │
//! │  (SIGINT / SIGTERM -> one graceful_shutdown call)           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Orchestrator                            │
//! │  (validates every pool, initial reconcile, supervises)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────┐      ┌──────────────────────────┐
//! │        AutoScaler        │ ───▶ │     ResourceManager      │
//! │ (Σ desired vs budget)    │      │ (min/max, policies)      │
//! └──────────────────────────┘      └──────────────────────────┘
//!                              │
//!                              ▼  scale_to(target)
//! ┌─────────────────────────────────────────────────────────────┐
//! │   WorkerPool: input WorkQueue -> Processor -> output queue  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use kgflow_runtime::prelude::*;
//!
//! let config = RuntimeConfig::from_env()?;
//! let resources = Arc::new(ResourceManager::new(config.resources.clone())?);
//!
//! let extract = Arc::new(WorkerPool::new(
//!     PoolConfig::new("extract").with_desired_workers(4),
//!     EntityExtractor::load()?,
//!     resources.clone(),
//! ));
//! let embed = Arc::new(
//!     WorkerPool::new(PoolConfig::new("embed"), Embedder::load()?, resources.clone())
//!         .with_input(extract.output().clone()),
//! );
//!
//! let orchestrator = Arc::new(Orchestrator::new(
//!     resources,
//!     config.scaler,
//!     vec![extract.clone(), embed.clone()],
//! ));
//! tokio::spawn(Arc::new(ShutdownCoordinator::new(orchestrator.clone())).listen_and_exit());
//! orchestrator.start().await?;
//! ```

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod pool;
pub mod processor;
pub mod queue;
pub mod resources;
pub mod scaler;
pub mod shutdown;

#[cfg(test)]
mod testing;

pub use config::{AutoScalerConfig, PoolConfig, ResourceConfig, RuntimeConfig};
pub use error::{
    BudgetExceededError, ConfigError, OrchestratorError, PoolError, ProcessingError,
    ProcessingErrorKind, QueueError, ScalerError, ShutdownError, ValidationError,
};
pub use orchestrator::{Orchestrator, ShutdownReport};
pub use pool::{ManagedPool, PoolStats, PoolStatus, WorkerPool};
pub use processor::Processor;
pub use queue::{QueueItem, WorkQueue};
pub use resources::{
    BudgetLimits, BudgetPolicy, ElasticBudgetPolicy, ResourceBudget, ResourceManager,
    ResourcePolicy, ResourceSignals, StaticResourcePolicy,
};
pub use scaler::{AutoScaler, ScalerState, ScalingDecision};
pub use shutdown::{ShutdownCoordinator, ShutdownSignal};

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{AutoScalerConfig, PoolConfig, ResourceConfig, RuntimeConfig};
    pub use crate::error::{
        BudgetExceededError, OrchestratorError, PoolError, ProcessingError, ShutdownError,
        ValidationError,
    };
    pub use crate::orchestrator::{Orchestrator, ShutdownReport};
    pub use crate::pool::{ManagedPool, PoolStats, PoolStatus, WorkerPool};
    pub use crate::processor::Processor;
    pub use crate::queue::{QueueItem, WorkQueue};
    pub use crate::resources::{ResourceManager, ResourcePolicy};
    pub use crate::scaler::AutoScaler;
    pub use crate::shutdown::{ShutdownCoordinator, ShutdownSignal};
}
