//! Worker pool
//!
//! A [`WorkerPool`] runs a variable number of identical worker loops that
//! drain one input queue through a [`Processor`] and push results to one
//! output queue.
//!
//! Stop is cooperative: shrinking the pool enqueues one end-of-stream marker
//! per worker to retire and waits for that many workers to exit. Only the
//! grace deadline of [`WorkerPool::stop`] aborts workers preemptively.
//!
//! A pool is the only consumer of its input queue. Every marker on that
//! queue retires one of its workers, including markers put by a producer.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::PoolConfig;
use crate::error::{
    BudgetExceededError, PoolError, ProcessingError, ShutdownError, ValidationError,
};
use crate::processor::Processor;
use crate::queue::{QueueItem, WorkQueue};
use crate::resources::ResourceManager;

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    /// Built, no worker spawned yet
    Created,
    /// Workers are processing the input queue
    Running,
    /// A `scale_to` is in progress
    Scaling,
    /// `stop` is retiring the workers
    Draining,
    /// Terminal; the pool cannot be restarted
    Stopped,
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Scaling => write!(f, "scaling"),
            Self::Draining => write!(f, "draining"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Point-in-time view of a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub pool: String,
    pub status: PoolStatus,
    /// Worker loops currently alive
    pub active_workers: usize,
    /// Workers requested from the autoscaler
    pub desired_workers: usize,
    /// Tasks that produced a result
    pub processed: u64,
    /// Tasks that ended in a `ProcessingError`
    pub failed: u64,
    /// Items buffered in the input queue
    pub queued: usize,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
}

struct Workers {
    handles: JoinSet<()>,
    /// Workers spawned so far; also the next worker id
    spawned: usize,
    /// Workers that exited without consuming a marker
    lost: usize,
}

/// A set of worker loops bound to one input/output queue pair
///
/// # Example
///
/// ```
/// # tokio_test::block_on(async {
/// use std::sync::Arc;
/// use async_trait::async_trait;
/// use kgflow_runtime::{
///     PoolConfig, ProcessingError, Processor, QueueItem, ResourceConfig, ResourceManager,
///     WorkerPool,
/// };
///
/// struct Length;
///
/// #[async_trait]
/// impl Processor for Length {
///     type Task = String;
///     type Output = usize;
///
///     fn name(&self) -> &str {
///         "length"
///     }
///
///     async fn process(&self, task: String) -> Result<usize, ProcessingError> {
///         Ok(task.len())
///     }
/// }
///
/// let resources = Arc::new(ResourceManager::new(ResourceConfig::new()).unwrap());
/// let pool = WorkerPool::new(PoolConfig::new("length"), Length, resources);
///
/// pool.start(1).await.unwrap();
/// pool.input().put("hello".to_string()).await;
/// assert_eq!(pool.output().get().await, QueueItem::Task(5));
///
/// pool.stop().await.unwrap();
/// # });
/// ```
pub struct WorkerPool<P: Processor> {
    id: String,
    config: PoolConfig,
    processor: Arc<P>,
    resources: Arc<ResourceManager>,
    input: Arc<WorkQueue<P::Task>>,
    output: Arc<WorkQueue<P::Output>>,
    workers: Mutex<Workers>,
    active: Arc<AtomicUsize>,
    desired: AtomicUsize,
    status: watch::Sender<PoolStatus>,
    counters: Arc<Counters>,
    started_at: parking_lot::Mutex<Option<DateTime<Utc>>>,
    stopping: CancellationToken,
}

impl<P: Processor> WorkerPool<P> {
    /// Create a pool with fresh input and output queues
    pub fn new(config: PoolConfig, processor: P, resources: Arc<ResourceManager>) -> Self {
        let input = Arc::new(WorkQueue::new(
            format!("{}.input", config.name),
            config.queue_capacity,
        ));
        let output = Arc::new(WorkQueue::new(
            format!("{}.output", config.name),
            config.output_capacity,
        ));
        let (status, _) = watch::channel(PoolStatus::Created);

        Self {
            id: config.name.clone(),
            desired: AtomicUsize::new(config.desired_workers),
            config,
            processor: Arc::new(processor),
            resources,
            input,
            output,
            workers: Mutex::new(Workers {
                handles: JoinSet::new(),
                spawned: 0,
                lost: 0,
            }),
            active: Arc::new(AtomicUsize::new(0)),
            status,
            counters: Arc::new(Counters::default()),
            started_at: parking_lot::Mutex::new(None),
            stopping: CancellationToken::new(),
        }
    }

    /// Read from an existing queue, e.g. the output of an upstream pool
    pub fn with_input(mut self, input: Arc<WorkQueue<P::Task>>) -> Self {
        self.input = input;
        self
    }

    /// Write results to an existing queue
    pub fn with_output(mut self, output: Arc<WorkQueue<P::Output>>) -> Self {
        self.output = output;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn processor(&self) -> &Arc<P> {
        &self.processor
    }

    pub fn input(&self) -> &Arc<WorkQueue<P::Task>> {
        &self.input
    }

    pub fn output(&self) -> &Arc<WorkQueue<P::Output>> {
        &self.output
    }

    pub fn status(&self) -> PoolStatus {
        *self.status.borrow()
    }

    /// Worker loops currently alive
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Workers this pool asks the autoscaler for
    pub fn desired_workers(&self) -> usize {
        self.desired.load(Ordering::SeqCst)
    }

    /// Record how many workers this pool wants at the next reconciliation
    pub fn request_workers(&self, n: usize) -> Result<(), PoolError> {
        self.check_budget(n)?;
        self.desired.store(n, Ordering::SeqCst);
        debug!(pool = %self.id, desired = n, "Worker request recorded");
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            pool: self.id.clone(),
            status: self.status(),
            active_workers: self.active_workers(),
            desired_workers: self.desired_workers(),
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            queued: self.input.len(),
            started_at: *self.started_at.lock(),
        }
    }

    /// Validate the processor and spawn `workers` worker loops
    ///
    /// Validation runs before anything is spawned; on failure the pool stays
    /// `Created` with zero workers.
    #[instrument(skip(self), fields(pool = %self.id))]
    pub async fn start(&self, workers: usize) -> Result<(), PoolError> {
        let mut guard = self.workers.lock().await;
        match self.status() {
            PoolStatus::Created => {}
            PoolStatus::Stopped => return Err(PoolError::Stopped(self.id.clone())),
            _ => return Err(PoolError::AlreadyStarted(self.id.clone())),
        }
        if self.stopping.is_cancelled() {
            return Err(PoolError::Stopped(self.id.clone()));
        }
        self.check_budget(workers)?;

        if !self.processor.validate().await {
            warn!(
                pool = %self.id,
                processor = self.processor.name(),
                "Processor failed validation, not starting"
            );
            return Err(ValidationError {
                pool: self.id.clone(),
                processor: self.processor.name().to_string(),
            }
            .into());
        }

        *self.started_at.lock() = Some(Utc::now());
        self.status.send_replace(PoolStatus::Running);
        for _ in 0..workers {
            self.spawn_worker(&mut guard);
        }

        info!(
            pool = %self.id,
            processor = self.processor.name(),
            workers,
            "Worker pool started"
        );
        Ok(())
    }

    /// Resize the pool to exactly `target` workers
    ///
    /// Markers already queued count as retirements in progress. Growing
    /// spawns new loops. Shrinking enqueues one end-of-stream marker per
    /// retired worker. Either way the call returns once exactly `target`
    /// workers are left, so it completes only after every queued marker
    /// reaches the front of the queue.
    #[instrument(skip(self), fields(pool = %self.id))]
    pub async fn scale_to(&self, target: usize) -> Result<(), PoolError> {
        let mut workers = self.workers.lock().await;
        match self.status() {
            PoolStatus::Running => {}
            PoolStatus::Created => return Err(PoolError::NotRunning(self.id.clone())),
            _ => return Err(PoolError::Stopped(self.id.clone())),
        }
        if self.stopping.is_cancelled() {
            return Err(PoolError::Stopped(self.id.clone()));
        }
        self.check_budget(target)?;

        for err in self.reap(&mut workers) {
            warn!(pool = %self.id, error = %err, "Worker exited abnormally");
        }

        let current = self.committed(&workers);
        self.desired.store(target, Ordering::SeqCst);
        if current == target as i64 && workers.handles.len() == target {
            return Ok(());
        }

        self.status.send_replace(PoolStatus::Scaling);
        let markers = if target as i64 > current {
            for _ in current..target as i64 {
                self.spawn_worker(&mut workers);
            }
            0
        } else {
            (current - target as i64) as usize
        };
        self.settle(&mut workers, markers, target).await?;
        self.status.send_replace(PoolStatus::Running);

        info!(pool = %self.id, from = current, to = target, "Worker pool scaled");
        Ok(())
    }

    /// Retire every worker and move to `Stopped`
    ///
    /// Workers still running when the grace deadline elapses are aborted;
    /// an abort counts as a clean exit. Markers no worker consumed are
    /// discarded, so the input queue only stays pending for unprocessed
    /// tasks. Calling `stop` again is a no-op.
    #[instrument(skip(self), fields(pool = %self.id))]
    pub async fn stop(&self) -> Result<(), ShutdownError> {
        // Interrupts a scale-down that is holding the worker lock
        self.stopping.cancel();
        let mut workers = self.workers.lock().await;

        match self.status() {
            PoolStatus::Stopped => return Ok(()),
            PoolStatus::Created => {
                self.finish();
                return Ok(());
            }
            _ => {}
        }

        self.status.send_replace(PoolStatus::Draining);
        let mut errors = self.reap(&mut workers);
        let count = workers.handles.len();
        let markers = self.committed(&workers).clamp(0, count as i64) as usize;
        info!(pool = %self.id, workers = count, "Draining worker pool");

        let deadline = Instant::now() + self.config.stop_grace;
        let graceful = tokio::time::timeout_at(deadline, async {
            for _ in 0..markers {
                self.input.put_end_of_stream().await;
            }
            while let Some(result) = workers.handles.join_next().await {
                errors.extend(exit_error(&self.id, result));
            }
        })
        .await;

        if graceful.is_err() {
            warn!(
                pool = %self.id,
                remaining = workers.handles.len(),
                grace_ms = self.config.stop_grace.as_millis() as u64,
                "Grace deadline elapsed, aborting workers"
            );
            workers.handles.abort_all();
            while let Some(result) = workers.handles.join_next().await {
                errors.extend(exit_error(&self.id, result));
            }
        }

        let discarded = self.input.discard_end_of_stream(usize::MAX);
        if discarded > 0 {
            debug!(pool = %self.id, discarded, "Discarded unconsumed markers");
        }
        self.finish();

        let mut errors = errors.into_iter();
        match errors.next() {
            None => Ok(()),
            Some(first) => {
                for other in errors {
                    error!(pool = %self.id, error = %other, "Additional shutdown error");
                }
                Err(first)
            }
        }
    }

    /// Wait until the pool reaches `Stopped`
    pub async fn wait_stopped(&self) {
        let mut status = self.status.subscribe();
        // The sender lives as long as `self`
        let _ = status.wait_for(|s| *s == PoolStatus::Stopped).await;
    }

    fn finish(&self) {
        self.desired.store(0, Ordering::SeqCst);
        self.status.send_replace(PoolStatus::Stopped);
        info!(pool = %self.id, stats = ?self.stats(), "Worker pool stopped");
    }

    fn check_budget(&self, requested: usize) -> Result<(), BudgetExceededError> {
        let max_allowed = self.resources.max_workers();
        if requested > max_allowed {
            return Err(BudgetExceededError {
                requested,
                max_allowed,
            });
        }
        Ok(())
    }

    fn spawn_worker(&self, workers: &mut Workers) {
        let worker_id = workers.spawned;
        workers.spawned += 1;

        let live = LiveGuard::new(self.active.clone());
        let worker = Worker {
            pool: self.id.clone(),
            worker_id,
            processor: self.processor.clone(),
            input: self.input.clone(),
            output: self.output.clone(),
            counters: self.counters.clone(),
            task_timeout: self.config.task_timeout,
        };

        workers.handles.spawn(async move {
            let _live = live;
            worker.run().await;
        });
    }

    /// Workers left once every marker put so far has been consumed
    ///
    /// Negative when more markers are queued than workers are alive.
    fn committed(&self, workers: &Workers) -> i64 {
        workers.spawned as i64 - workers.lost as i64 - self.input.end_of_stream_count() as i64
    }

    /// Collect workers that already exited, e.g. on a producer-supplied marker
    fn reap(&self, workers: &mut Workers) -> Vec<ShutdownError> {
        let mut errors = Vec::new();
        while let Some(result) = workers.handles.try_join_next() {
            if let Some(err) = exit_error(&self.id, result) {
                workers.lost += 1;
                errors.push(err);
            }
        }
        errors
    }

    /// Enqueue `markers` markers, then wait until `target` workers are left
    async fn settle(
        &self,
        workers: &mut Workers,
        markers: usize,
        target: usize,
    ) -> Result<(), PoolError> {
        let pool = &self.id;
        let converge = async {
            for _ in 0..markers {
                self.input.put_end_of_stream().await;
            }
            while workers.handles.len() > target {
                match workers.handles.join_next().await {
                    Some(result) => {
                        if let Some(err) = exit_error(pool, result) {
                            workers.lost += 1;
                            warn!(pool = %pool, error = %err, "Worker exited abnormally");
                        }
                    }
                    None => break,
                }
            }
        };

        tokio::select! {
            _ = converge => Ok(()),
            _ = self.stopping.cancelled() => {
                debug!(pool = %pool, "Scaling interrupted by stop");
                Err(PoolError::Stopped(pool.clone()))
            }
        }
    }
}

impl<P: Processor> fmt::Debug for WorkerPool<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("id", &self.id)
            .field("processor", &self.processor.name())
            .field("status", &self.status())
            .field("active_workers", &self.active_workers())
            .field("desired_workers", &self.desired_workers())
            .finish()
    }
}

/// Map a worker's exit to a shutdown error; aborted workers exit cleanly
fn exit_error(pool: &str, result: Result<(), JoinError>) -> Option<ShutdownError> {
    match result {
        Ok(()) => None,
        Err(err) if err.is_cancelled() => None,
        Err(err) if err.is_panic() => Some(ShutdownError::WorkerPanicked {
            pool: pool.to_string(),
            message: panic_message(err.into_panic().as_ref()),
        }),
        Err(err) => Some(ShutdownError::Join {
            pool: pool.to_string(),
            message: err.to_string(),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Counts a worker as active for as long as its task is alive
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self(active)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Marks a dequeued item done when dropped, including on abort
struct DoneGuard<'a, T>(&'a WorkQueue<T>);

impl<T> Drop for DoneGuard<'_, T> {
    fn drop(&mut self) {
        if let Err(err) = self.0.mark_done() {
            error!(error = %err, "Unbalanced mark_done");
        }
    }
}

struct Worker<P: Processor> {
    pool: String,
    worker_id: usize,
    processor: Arc<P>,
    input: Arc<WorkQueue<P::Task>>,
    output: Arc<WorkQueue<P::Output>>,
    counters: Arc<Counters>,
    task_timeout: Option<Duration>,
}

impl<P: Processor> Worker<P> {
    async fn run(self) {
        debug!(pool = %self.pool, worker = self.worker_id, "Worker started");

        loop {
            let item = self.input.get().await;
            let _done = DoneGuard(&self.input);

            let task = match item {
                QueueItem::Task(task) => task,
                QueueItem::EndOfStream => break,
            };

            match self.execute(task).await {
                Ok(output) => {
                    self.output.put(output).await;
                    self.counters.processed.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        pool = %self.pool,
                        worker = self.worker_id,
                        kind = %err.kind,
                        "Task failed: {}",
                        err.message
                    );
                }
            }
        }

        debug!(pool = %self.pool, worker = self.worker_id, "Worker exited");
    }

    async fn execute(&self, task: P::Task) -> Result<P::Output, ProcessingError> {
        let work = AssertUnwindSafe(self.processor.process(task)).catch_unwind();

        let outcome = match self.task_timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(ProcessingError::timed_out(format!(
                        "task exceeded {}ms",
                        limit.as_millis()
                    )))
                }
            },
            None => work.await,
        };

        outcome.unwrap_or_else(|panic| {
            Err(ProcessingError::panicked(panic_message(panic.as_ref())))
        })
    }
}

/// Type-erased pool handle used by the autoscaler and the orchestrator
///
/// Lets pools with different task and result types be managed together.
#[async_trait]
pub trait ManagedPool: Send + Sync {
    fn id(&self) -> &str;

    fn status(&self) -> PoolStatus;

    fn desired_workers(&self) -> usize;

    fn active_workers(&self) -> usize;

    fn stats(&self) -> PoolStats;

    async fn start(&self, workers: usize) -> Result<(), PoolError>;

    async fn scale_to(&self, target: usize) -> Result<(), PoolError>;

    async fn stop(&self) -> Result<(), ShutdownError>;

    async fn wait_stopped(&self);

    /// Wait until every item put on the input queue has been handled
    async fn drain_input(&self);
}

#[async_trait]
impl<P: Processor> ManagedPool for WorkerPool<P> {
    fn id(&self) -> &str {
        WorkerPool::id(self)
    }

    fn status(&self) -> PoolStatus {
        WorkerPool::status(self)
    }

    fn desired_workers(&self) -> usize {
        WorkerPool::desired_workers(self)
    }

    fn active_workers(&self) -> usize {
        WorkerPool::active_workers(self)
    }

    fn stats(&self) -> PoolStats {
        WorkerPool::stats(self)
    }

    async fn start(&self, workers: usize) -> Result<(), PoolError> {
        WorkerPool::start(self, workers).await
    }

    async fn scale_to(&self, target: usize) -> Result<(), PoolError> {
        WorkerPool::scale_to(self, target).await
    }

    async fn stop(&self) -> Result<(), ShutdownError> {
        WorkerPool::stop(self).await
    }

    async fn wait_stopped(&self) {
        WorkerPool::wait_stopped(self).await
    }

    async fn drain_input(&self) {
        self.input.join().await
    }
}
