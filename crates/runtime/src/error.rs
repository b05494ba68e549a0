//! Error types for the pipeline runtime
//!
//! The taxonomy follows the lifecycle of a pool:
//! - [`ValidationError`] - a capability failed its pre-flight check, no worker was started
//! - [`BudgetExceededError`] - a scaling request exceeded the global worker budget
//! - [`ProcessingError`] - one task failed inside a worker; isolated to that task
//! - [`ShutdownError`] - something went wrong while tearing a pool down

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::orchestrator::ShutdownReport;

/// A processing capability refused to start
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("processor '{processor}' failed validation for pool '{pool}'")]
pub struct ValidationError {
    /// Pool whose start was aborted
    pub pool: String,

    /// Name reported by the processor
    pub processor: String,
}

/// A requested worker count does not fit in the global budget
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("requested {requested} workers but the budget allows at most {max_allowed}")]
pub struct BudgetExceededError {
    /// Workers requested (a single pool target or the sum over all pools)
    pub requested: usize,

    /// `ResourceManager::max_workers()` at the time of the request
    pub max_allowed: usize,
}

/// Why a single task failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingErrorKind {
    /// The processor returned an error
    Failed,
    /// The per-task timeout elapsed
    TimedOut,
    /// The processor panicked
    Panicked,
}

impl fmt::Display for ProcessingErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Panicked => write!(f, "panicked"),
        }
    }
}

/// Error raised while processing one task
///
/// Worker loops log and count these, mark the task done and carry on.
/// They never stop a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingError {
    /// Human readable description
    pub message: String,

    /// Failure category
    pub kind: ProcessingErrorKind,
}

impl ProcessingError {
    /// Create an error for a task the processor rejected
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ProcessingErrorKind::Failed,
        }
    }

    /// Create an error for a task that exceeded its time limit
    pub fn timed_out(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ProcessingErrorKind::TimedOut,
        }
    }

    /// Create an error for a processor that panicked
    pub fn panicked(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ProcessingErrorKind::Panicked,
        }
    }
}

impl fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

impl std::error::Error for ProcessingError {}

/// Errors collected while stopping a pool
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ShutdownError {
    /// A worker loop panicked before it could exit
    #[error("worker in pool '{pool}' panicked: {message}")]
    WorkerPanicked { pool: String, message: String },

    /// A worker could not be joined
    #[error("failed to join worker in pool '{pool}': {message}")]
    Join { pool: String, message: String },
}

/// Work queue errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    /// `mark_done` was called more times than items were put
    #[error("mark_done called on queue '{0}' with no pending items")]
    NotPending(String),
}

/// Worker pool errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    /// Capability validation failed
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Requested worker count exceeds the budget
    #[error(transparent)]
    BudgetExceeded(#[from] BudgetExceededError),

    /// `start` was called on a running pool
    #[error("pool '{0}' is already started")]
    AlreadyStarted(String),

    /// The pool has not been started yet
    #[error("pool '{0}' is not running")]
    NotRunning(String),

    /// The pool was stopped and cannot be reused
    #[error("pool '{0}' is stopped")]
    Stopped(String),
}

/// AutoScaler errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScalerError {
    /// Sum of requested workers exceeds the budget; nothing was scaled
    #[error("reconciliation rejected: {0}")]
    BudgetExceeded(#[from] BudgetExceededError),

    /// A pool refused a scaling decision
    #[error("failed to scale pool '{pool}': {source}")]
    Pool {
        pool: String,
        #[source]
        source: PoolError,
    },

    /// The scaler was stopped
    #[error("autoscaler is stopped")]
    Stopped,
}

/// Orchestrator errors
#[derive(Debug, Clone, Error)]
pub enum OrchestratorError {
    /// A pool failed to start
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    /// The initial reconciliation failed
    #[error("autoscaler error: {0}")]
    Scaler(#[from] ScalerError),

    /// Pools were stopped but some reported errors
    #[error("shutdown finished with {} pool error(s)", .0.errors.len())]
    Shutdown(ShutdownReport),
}

/// Configuration errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A value is out of range or inconsistent
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// An environment variable could not be parsed
    #[error("invalid value for {key}: '{value}'")]
    Env { key: String, value: String },
}
