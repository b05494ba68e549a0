//! Processors and helpers shared by unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{PoolConfig, ResourceConfig};
use crate::error::ProcessingError;
use crate::processor::Processor;
use crate::queue::{QueueItem, WorkQueue};
use crate::resources::ResourceManager;
use crate::WorkerPool;

/// Doubles its input; fails on multiples of `fail_every`, panics on `panic_on`
#[derive(Default)]
pub struct Doubler {
    pub delay: Option<Duration>,
    pub fail_every: Option<u64>,
    pub panic_on: Option<u64>,
    pub valid: Option<bool>,
    pub validations: AtomicUsize,
}

impl Doubler {
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn invalid() -> Self {
        Self {
            valid: Some(false),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Processor for Doubler {
    type Task = u64;
    type Output = u64;

    fn name(&self) -> &str {
        "doubler"
    }

    async fn validate(&self) -> bool {
        self.validations.fetch_add(1, Ordering::SeqCst);
        self.valid.unwrap_or(true)
    }

    async fn process(&self, task: u64) -> Result<u64, ProcessingError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.panic_on == Some(task) {
            panic!("cannot double {task}");
        }
        if let Some(n) = self.fail_every {
            if task % n == 0 {
                return Err(ProcessingError::new(format!("refusing {task}")));
            }
        }
        Ok(task * 2)
    }
}

pub fn resources(max_workers: usize) -> Arc<ResourceManager> {
    Arc::new(
        ResourceManager::new(ResourceConfig::new().with_max_workers(max_workers))
            .expect("valid resource config"),
    )
}

pub fn pool(
    name: &str,
    processor: Doubler,
    resources: Arc<ResourceManager>,
) -> WorkerPool<Doubler> {
    WorkerPool::new(
        PoolConfig::new(name).with_stop_grace(Duration::from_secs(5)),
        processor,
        resources,
    )
}

/// Pull `n` results from an output queue, marking each done
pub async fn collect(queue: &WorkQueue<u64>, n: usize) -> Vec<u64> {
    let mut results = Vec::with_capacity(n);
    while results.len() < n {
        let item = tokio::time::timeout(Duration::from_secs(5), queue.get())
            .await
            .expect("timed out waiting for results");
        if let QueueItem::Task(value) = item {
            results.push(value);
        }
        queue.mark_done().unwrap();
    }
    results.sort_unstable();
    results
}
