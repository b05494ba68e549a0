//! Global worker budget
//!
//! The [`ResourceManager`] is the single source of truth for how many workers
//! the whole process may run. Pools read it before scaling; the autoscaler
//! reads it before approving a plan. Telemetry plugs in through two traits:
//! - [`ResourcePolicy`] answers "are resources available?" and "is the system overloaded?"
//! - [`BudgetPolicy`] turns those answers into a new budget on `reconcile()`

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::ResourceConfig;
use crate::error::ConfigError;

/// Global min/max worker bounds
///
/// Invariant: `min_workers <= max_workers`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBudget {
    /// Lower bound
    pub min_workers: usize,

    /// Upper bound
    pub max_workers: usize,
}

/// Hard limits that budget reconciliation must respect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetLimits {
    /// Shrinking never takes `max_workers` below this
    pub floor: usize,

    /// Growing never takes `max_workers` above this
    pub ceiling: usize,
}

/// Snapshot of the resource predicates handed to a [`BudgetPolicy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceSignals {
    pub available: bool,
    pub overloaded: bool,
}

/// Overload and availability predicates
///
/// Implement this to feed real telemetry (CPU, memory, GPU queue depth)
/// into scaling without touching any other component.
pub trait ResourcePolicy: Send + Sync {
    /// Whether there is headroom to run more workers
    fn is_resource_available(&self) -> bool;

    /// Whether the system should shed workers
    fn is_system_overloaded(&self) -> bool;
}

/// Constant predicates
///
/// The default reports resources as available and the system as not overloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticResourcePolicy {
    available: bool,
    overloaded: bool,
}

impl StaticResourcePolicy {
    /// Create a policy with fixed answers
    pub fn new(available: bool, overloaded: bool) -> Self {
        Self {
            available,
            overloaded,
        }
    }
}

impl Default for StaticResourcePolicy {
    fn default() -> Self {
        Self::new(true, false)
    }
}

impl ResourcePolicy for StaticResourcePolicy {
    fn is_resource_available(&self) -> bool {
        self.available
    }

    fn is_system_overloaded(&self) -> bool {
        self.overloaded
    }
}

/// Computes the next budget during `ResourceManager::reconcile()`
pub trait BudgetPolicy: Send + Sync {
    /// Return the budget to apply; the manager clamps the result into `limits`
    fn reconcile(
        &self,
        current: ResourceBudget,
        limits: BudgetLimits,
        signals: ResourceSignals,
    ) -> ResourceBudget;
}

/// Halve on overload, double when resources are available
///
/// Shrinking is floored at `limits.floor` and growth is capped at
/// `limits.ceiling`. Overload wins when both signals are set.
#[derive(Debug, Clone, Copy, Default)]
pub struct ElasticBudgetPolicy;

impl BudgetPolicy for ElasticBudgetPolicy {
    fn reconcile(
        &self,
        current: ResourceBudget,
        limits: BudgetLimits,
        signals: ResourceSignals,
    ) -> ResourceBudget {
        if signals.overloaded {
            let max_workers = (current.max_workers / 2).max(limits.floor.min(current.max_workers));
            ResourceBudget {
                min_workers: (current.min_workers / 2).min(max_workers),
                max_workers,
            }
        } else if signals.available {
            let max_workers = current
                .max_workers
                .saturating_mul(2)
                .max(1)
                .min(limits.ceiling)
                .max(current.max_workers);
            ResourceBudget {
                min_workers: current.min_workers.saturating_mul(2).min(max_workers),
                max_workers,
            }
        } else {
            current
        }
    }
}

/// Authoritative global worker budget
///
/// All mutations go through one mutex. Reads are cheap and safe from any
/// number of pools concurrently. Every change is published on a
/// [`watch`] channel so the autoscaler can treat it as a capacity-change event.
///
/// # Example
///
/// ```
/// use kgflow_runtime::{ResourceConfig, ResourceManager};
///
/// let manager = ResourceManager::new(ResourceConfig::new().with_max_workers(10)).unwrap();
/// assert_eq!(manager.max_workers(), 10);
///
/// // Out-of-range requests are clamped, never rejected
/// assert_eq!(manager.adjust_min_workers(50), 10);
/// ```
pub struct ResourceManager {
    budget: Mutex<ResourceBudget>,
    limits: BudgetLimits,
    policy: Arc<dyn ResourcePolicy>,
    budget_policy: Arc<dyn BudgetPolicy>,
    changes: watch::Sender<ResourceBudget>,
}

impl ResourceManager {
    /// Create a manager with the default policies
    pub fn new(config: ResourceConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let budget = ResourceBudget {
            min_workers: config.min_workers,
            max_workers: config.max_workers,
        };
        let (changes, _) = watch::channel(budget);

        Ok(Self {
            budget: Mutex::new(budget),
            limits: BudgetLimits {
                floor: config.floor,
                ceiling: config.ceiling,
            },
            policy: Arc::new(StaticResourcePolicy::default()),
            budget_policy: Arc::new(ElasticBudgetPolicy),
            changes,
        })
    }

    /// Replace the overload/availability predicates
    pub fn with_policy(mut self, policy: Arc<dyn ResourcePolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the reconciliation policy
    pub fn with_budget_policy(mut self, policy: Arc<dyn BudgetPolicy>) -> Self {
        self.budget_policy = policy;
        self
    }

    /// Current upper bound
    pub fn max_workers(&self) -> usize {
        self.budget.lock().max_workers
    }

    /// Current lower bound
    pub fn min_workers(&self) -> usize {
        self.budget.lock().min_workers
    }

    /// Current budget
    pub fn budget(&self) -> ResourceBudget {
        *self.budget.lock()
    }

    /// Reconciliation limits
    pub fn limits(&self) -> BudgetLimits {
        self.limits
    }

    /// Set the upper bound, clamped into `[min_workers, ceiling]`
    ///
    /// Returns the value actually applied.
    pub fn adjust_max_workers(&self, n: usize) -> usize {
        let mut budget = self.budget.lock();
        let applied = n.max(budget.min_workers).min(self.limits.ceiling);
        let next = ResourceBudget {
            max_workers: applied,
            ..*budget
        };
        self.apply(&mut budget, next);
        applied
    }

    /// Set the lower bound, clamped into `[0, max_workers]`
    ///
    /// Returns the value actually applied.
    pub fn adjust_min_workers(&self, n: usize) -> usize {
        let mut budget = self.budget.lock();
        let applied = n.min(budget.max_workers);
        let next = ResourceBudget {
            min_workers: applied,
            ..*budget
        };
        self.apply(&mut budget, next);
        applied
    }

    /// Whether there is headroom to run more workers
    pub fn is_resource_available(&self) -> bool {
        self.policy.is_resource_available()
    }

    /// Whether the system should shed workers
    pub fn is_system_overloaded(&self) -> bool {
        self.policy.is_system_overloaded()
    }

    /// Run the budget policy once and apply its result
    pub fn reconcile(&self) -> ResourceBudget {
        let signals = ResourceSignals {
            available: self.is_resource_available(),
            overloaded: self.is_system_overloaded(),
        };

        let mut budget = self.budget.lock();
        let proposed = self.budget_policy.reconcile(*budget, self.limits, signals);

        let max_workers = proposed.max_workers.min(self.limits.ceiling);
        let next = ResourceBudget {
            min_workers: proposed.min_workers.min(max_workers),
            max_workers,
        };

        debug!(
            available = signals.available,
            overloaded = signals.overloaded,
            min_workers = next.min_workers,
            max_workers = next.max_workers,
            "Reconciled worker budget"
        );
        self.apply(&mut budget, next);
        next
    }

    /// Subscribe to budget changes
    pub fn subscribe(&self) -> watch::Receiver<ResourceBudget> {
        self.changes.subscribe()
    }

    fn apply(&self, current: &mut ResourceBudget, next: ResourceBudget) {
        if *current == next {
            return;
        }

        info!(
            old_min = current.min_workers,
            old_max = current.max_workers,
            min_workers = next.min_workers,
            max_workers = next.max_workers,
            "Worker budget changed"
        );
        *current = next;
        self.changes.send_replace(next);
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("budget", &self.budget())
            .field("limits", &self.limits)
            .finish()
    }
}
