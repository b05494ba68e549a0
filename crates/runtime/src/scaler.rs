//! Budget-aware autoscaler
//!
//! The [`AutoScaler`] keeps the sum of every pool's desired worker count
//! within the global budget. A reconciliation either scales every pool to
//! its desired count or, when the total exceeds `max_workers`, rejects the
//! whole request and scales nothing.
//!
//! Reconciliation runs:
//! - once at startup, driven by the orchestrator
//! - on a timer, after letting the [`ResourceManager`] re-evaluate the budget
//! - whenever the budget changes
//! - on an explicit [`AutoScaler::notify_capacity_change`]
//!
//! Every trigger calls the same [`AutoScaler::reconcile`] routine, and
//! reconciliations never overlap.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::AutoScalerConfig;
use crate::error::{BudgetExceededError, ScalerError, ShutdownError};
use crate::pool::ManagedPool;
use crate::resources::{ResourceBudget, ResourceManager};

/// Target worker count for one pool, produced by [`AutoScaler::plan`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub pool: String,
    pub target: usize,
}

/// AutoScaler state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalerState {
    /// Waiting for the next trigger
    Idle,
    /// A reconciliation is in progress
    Reconciling,
    /// The last reconciliation was rejected or a pool refused to scale
    Failed,
    /// Terminal
    Stopped,
}

impl fmt::Display for ScalerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Reconciling => write!(f, "reconciling"),
            Self::Failed => write!(f, "failed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Reconciles requested worker counts against the global budget
pub struct AutoScaler {
    pools: Vec<Arc<dyn ManagedPool>>,
    resources: Arc<ResourceManager>,
    config: AutoScalerConfig,
    /// Serializes reconciliations
    reconciling: tokio::sync::Mutex<()>,
    state: Mutex<ScalerState>,
    capacity_changed: Notify,
    cancel: CancellationToken,
    /// Set by the first caller of `stop`
    stop_claimed: AtomicBool,
    stopped: OnceCell<Vec<(String, ShutdownError)>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AutoScaler {
    /// Create an autoscaler managing `pools`
    pub fn new(
        pools: Vec<Arc<dyn ManagedPool>>,
        resources: Arc<ResourceManager>,
        config: AutoScalerConfig,
    ) -> Self {
        Self {
            pools,
            resources,
            config,
            reconciling: tokio::sync::Mutex::new(()),
            state: Mutex::new(ScalerState::Idle),
            capacity_changed: Notify::new(),
            cancel: CancellationToken::new(),
            stop_claimed: AtomicBool::new(false),
            stopped: OnceCell::new(),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ScalerState {
        *self.state.lock()
    }

    pub fn pools(&self) -> &[Arc<dyn ManagedPool>] {
        &self.pools
    }

    /// Compute one decision per pool, or reject the whole request
    pub fn plan(&self) -> Result<Vec<ScalingDecision>, BudgetExceededError> {
        let decisions: Vec<ScalingDecision> = self
            .pools
            .iter()
            .map(|pool| ScalingDecision {
                pool: pool.id().to_string(),
                target: pool.desired_workers(),
            })
            .collect();

        let requested: usize = decisions.iter().map(|d| d.target).sum();
        let max_allowed = self.resources.max_workers();
        if requested > max_allowed {
            return Err(BudgetExceededError {
                requested,
                max_allowed,
            });
        }
        Ok(decisions)
    }

    /// Plan and apply one reconciliation
    ///
    /// On a budget violation no pool is touched and the state moves to
    /// `Failed`; the next successful reconciliation moves it back to `Idle`.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<Vec<ScalingDecision>, ScalerError> {
        let _serial = self.reconciling.lock().await;
        if self.cancel.is_cancelled() {
            return Err(ScalerError::Stopped);
        }
        self.set_state(ScalerState::Reconciling);

        let decisions = match self.plan() {
            Ok(decisions) => decisions,
            Err(err) => {
                warn!(
                    requested = err.requested,
                    max_allowed = err.max_allowed,
                    "Reconciliation rejected, worker budget exceeded"
                );
                self.set_state(ScalerState::Failed);
                return Err(err.into());
            }
        };

        for (pool, decision) in self.pools.iter().zip(&decisions) {
            if self.cancel.is_cancelled() {
                return Err(ScalerError::Stopped);
            }
            if let Err(source) = pool.scale_to(decision.target).await {
                self.set_state(ScalerState::Failed);
                return Err(ScalerError::Pool {
                    pool: decision.pool.clone(),
                    source,
                });
            }
        }

        self.set_state(ScalerState::Idle);
        debug!(pools = decisions.len(), "Reconciliation applied");
        Ok(decisions)
    }

    /// Request a reconciliation from the background loop
    pub fn notify_capacity_change(&self) {
        self.capacity_changed.notify_one();
    }

    /// Start the background reconciliation loop; a no-op if already running
    pub fn spawn_loop(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() || self.cancel.is_cancelled() {
            return;
        }
        // Subscribe before spawning so no budget change is missed
        let budget = self.resources.subscribe();
        *task = Some(tokio::spawn(self.clone().run(budget)));
    }

    async fn run(self: Arc<Self>, mut budget: watch::Receiver<ResourceBudget>) {
        let mut ticker = self.config.reconcile_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        info!(
            interval_ms = self.config.reconcile_interval.map(|d| d.as_millis() as u64),
            budget_reactions = self.config.react_to_budget_changes,
            "Autoscaler loop started"
        );

        loop {
            let trigger = tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick(&mut ticker) => {
                    self.resources.reconcile();
                    // The budget change caused by this tick is handled now
                    budget.borrow_and_update();
                    "timer"
                }
                Ok(()) = budget.changed(), if self.config.react_to_budget_changes => "budget",
                _ = self.capacity_changed.notified() => "capacity",
            };

            debug!(trigger, "Reconciliation triggered");
            let result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.reconcile() => result,
            };
            if let Err(err) = result {
                warn!(trigger, error = %err, "Reconciliation failed");
            }
        }

        debug!("Autoscaler loop exited");
    }

    /// Stop the loop and every managed pool
    ///
    /// Pools are stopped one after another in pipeline order, so results an
    /// upstream pool flushes while stopping reach a downstream pool that is
    /// still running. Returns the errors reported by the pools. Every call
    /// waits for the stop to complete; only the first call returns the
    /// errors, later calls return an empty list.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Vec<(String, ShutdownError)> {
        let first = !self.stop_claimed.swap(true, Ordering::SeqCst);
        let errors = self.stopped.get_or_init(|| self.stop_once()).await;
        if first {
            errors.clone()
        } else {
            Vec::new()
        }
    }

    async fn stop_once(&self) -> Vec<(String, ShutdownError)> {
        self.cancel.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!(error = %err, "Autoscaler loop did not exit cleanly");
            }
        }
        *self.state.lock() = ScalerState::Stopped;

        let mut errors = Vec::new();
        for pool in &self.pools {
            if let Err(err) = pool.stop().await {
                errors.push((pool.id().to_string(), err));
            }
        }

        info!(
            pools = self.pools.len(),
            errors = errors.len(),
            "Autoscaler stopped"
        );
        errors
    }

    fn set_state(&self, next: ScalerState) {
        let mut state = self.state.lock();
        if *state != ScalerState::Stopped {
            *state = next;
        }
    }
}

impl fmt::Debug for AutoScaler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoScaler")
            .field("pools", &self.pools.len())
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
