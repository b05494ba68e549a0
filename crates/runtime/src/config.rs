//! Runtime configuration
//!
//! Every component receives its configuration explicitly through its
//! constructor. There is no process-wide config state.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Global worker budget configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceConfig {
    /// Initial lower bound of the budget
    pub min_workers: usize,

    /// Initial upper bound of the budget
    pub max_workers: usize,

    /// Lowest value budget reconciliation may shrink `max_workers` to
    pub floor: usize,

    /// Highest value the budget may ever grow to
    pub ceiling: usize,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            min_workers: 0,
            max_workers: 8,
            floor: 1,
            ceiling: 8,
        }
    }
}

impl ResourceConfig {
    /// Create a new resource configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial minimum worker count
    pub fn with_min_workers(mut self, n: usize) -> Self {
        self.min_workers = n;
        self
    }

    /// Set the initial maximum worker count, raising the ceiling if needed
    pub fn with_max_workers(mut self, n: usize) -> Self {
        self.max_workers = n;
        self.ceiling = self.ceiling.max(n);
        self
    }

    /// Set the floor used when the budget shrinks
    pub fn with_floor(mut self, n: usize) -> Self {
        self.floor = n;
        self
    }

    /// Set the ceiling used when the budget grows
    pub fn with_ceiling(mut self, n: usize) -> Self {
        self.ceiling = n;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_workers > self.max_workers {
            return Err(ConfigError::Invalid(format!(
                "min_workers ({}) must not exceed max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        if self.max_workers > self.ceiling {
            return Err(ConfigError::Invalid(format!(
                "max_workers ({}) must not exceed ceiling ({})",
                self.max_workers, self.ceiling
            )));
        }
        if self.floor > self.ceiling {
            return Err(ConfigError::Invalid(format!(
                "floor ({}) must not exceed ceiling ({})",
                self.floor, self.ceiling
            )));
        }
        Ok(())
    }
}

/// Configuration of a single worker pool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolConfig {
    /// Pool identity, unique within an orchestrator
    pub name: String,

    /// Workers this pool asks the autoscaler for
    pub desired_workers: usize,

    /// Input queue capacity (`None` = unbounded)
    pub queue_capacity: Option<usize>,

    /// Output queue capacity (`None` = unbounded)
    pub output_capacity: Option<usize>,

    /// Grace deadline for `stop()` before workers are aborted
    #[serde(with = "duration_millis")]
    pub stop_grace: Duration,

    /// Upper bound on a single `process()` call (`None` = no limit)
    #[serde(default, with = "option_duration_millis")]
    pub task_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            desired_workers: 1,
            queue_capacity: Some(1024),
            output_capacity: None,
            stop_grace: Duration::from_secs(30),
            task_timeout: None,
        }
    }
}

impl PoolConfig {
    /// Create a pool configuration with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the number of workers requested from the autoscaler
    pub fn with_desired_workers(mut self, n: usize) -> Self {
        self.desired_workers = n;
        self
    }

    /// Set the input queue capacity (`None` = unbounded)
    pub fn with_queue_capacity(mut self, capacity: Option<usize>) -> Self {
        self.queue_capacity = capacity.map(|c| c.max(1));
        self
    }

    /// Set the output queue capacity (`None` = unbounded)
    pub fn with_output_capacity(mut self, capacity: Option<usize>) -> Self {
        self.output_capacity = capacity.map(|c| c.max(1));
        self
    }

    /// Set the stop grace deadline
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Set the per-task timeout
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("pool name must not be empty".into()));
        }
        Ok(())
    }
}

/// AutoScaler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutoScalerConfig {
    /// Period of the timer-driven reconciliation (`None` = no timer)
    #[serde(default, with = "option_duration_millis")]
    pub reconcile_interval: Option<Duration>,

    /// Reconcile whenever the resource budget changes
    pub react_to_budget_changes: bool,
}

impl Default for AutoScalerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Some(Duration::from_secs(30)),
            react_to_budget_changes: true,
        }
    }
}

impl AutoScalerConfig {
    /// Create a new autoscaler configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the reconciliation interval
    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = Some(interval);
        self
    }

    /// Disable the timer trigger
    pub fn without_timer(mut self) -> Self {
        self.reconcile_interval = None;
        self
    }

    /// Enable or disable reconciliation on budget changes
    pub fn with_budget_reactions(mut self, enabled: bool) -> Self {
        self.react_to_budget_changes = enabled;
        self
    }
}

/// Complete runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Global worker budget
    pub resources: ResourceConfig,

    /// Autoscaler settings
    pub scaler: AutoScalerConfig,

    /// Pools to build
    pub pools: Vec<PoolConfig>,
}

impl RuntimeConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `KGFLOW_MIN_WORKERS` / `KGFLOW_MAX_WORKERS`: initial budget bounds
    /// - `KGFLOW_WORKER_FLOOR` / `KGFLOW_WORKER_CEILING`: reconciliation limits
    /// - `KGFLOW_RECONCILE_INTERVAL_MS`: autoscaler timer (0 disables it)
    /// - `KGFLOW_POOLS`: comma separated `name:workers` pairs (default `default:1`)
    /// - `KGFLOW_QUEUE_CAPACITY`: input queue capacity (0 = unbounded)
    /// - `KGFLOW_STOP_GRACE_MS`: stop grace deadline
    /// - `KGFLOW_TASK_TIMEOUT_MS`: per-task timeout
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut resources = ResourceConfig::default();
        if let Some(n) = parse_var::<usize, _>(&lookup, "KGFLOW_MIN_WORKERS")? {
            resources = resources.with_min_workers(n);
        }
        if let Some(n) = parse_var::<usize, _>(&lookup, "KGFLOW_MAX_WORKERS")? {
            resources = resources.with_max_workers(n);
        }
        if let Some(n) = parse_var::<usize, _>(&lookup, "KGFLOW_WORKER_FLOOR")? {
            resources = resources.with_floor(n);
        }
        if let Some(n) = parse_var::<usize, _>(&lookup, "KGFLOW_WORKER_CEILING")? {
            resources = resources.with_ceiling(n);
        }

        let mut scaler = AutoScalerConfig::default();
        match parse_var::<u64, _>(&lookup, "KGFLOW_RECONCILE_INTERVAL_MS")? {
            Some(0) => scaler = scaler.without_timer(),
            Some(ms) => scaler = scaler.with_reconcile_interval(Duration::from_millis(ms)),
            None => {}
        }

        let mut template = PoolConfig::default();
        if let Some(capacity) = parse_var::<usize, _>(&lookup, "KGFLOW_QUEUE_CAPACITY")? {
            template = template.with_queue_capacity((capacity > 0).then_some(capacity));
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "KGFLOW_STOP_GRACE_MS")? {
            template = template.with_stop_grace(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "KGFLOW_TASK_TIMEOUT_MS")? {
            template = template.with_task_timeout(Duration::from_millis(ms));
        }

        let raw = lookup("KGFLOW_POOLS").unwrap_or_else(|| "default:1".to_string());
        let pools = parse_pools(&raw, &template)?;

        let config = Self {
            resources,
            scaler,
            pools,
        };
        config.validate()?;
        Ok(config)
    }

    /// Add a pool
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pools.push(pool);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.resources.validate()?;
        for (i, pool) in self.pools.iter().enumerate() {
            pool.validate()?;
            if self.pools[..i].iter().any(|p| p.name == pool.name) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate pool name '{}'",
                    pool.name
                )));
            }
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env {
                key: key.to_string(),
                value: raw,
            }),
    }
}

fn parse_pools(raw: &str, template: &PoolConfig) -> Result<Vec<PoolConfig>, ConfigError> {
    let mut pools = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, workers) = match entry.split_once(':') {
            Some((name, workers)) => {
                let workers = workers.trim().parse().map_err(|_| ConfigError::Env {
                    key: "KGFLOW_POOLS".to_string(),
                    value: entry.to_string(),
                })?;
                (name.trim(), workers)
            }
            None => (entry, template.desired_workers),
        };

        let mut pool = template.clone().with_desired_workers(workers);
        pool.name = name.to_string();
        pools.push(pool);
    }
    Ok(pools)
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for Option<Duration> as milliseconds
pub(crate) mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
