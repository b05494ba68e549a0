//! End-to-end tests for pools, autoscaling and shutdown
//!
//! Run with: cargo test -p kgflow-runtime --test pipeline_test

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use kgflow_runtime::prelude::*;
use kgflow_runtime::{BudgetExceededError, ScalerError, ScalerState};

/// Tags a document with its word count
struct WordCount {
    delay: Duration,
    /// Documents containing this word fail
    poison: Option<&'static str>,
    seen: AtomicUsize,
}

impl WordCount {
    fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            poison: None,
            seen: AtomicUsize::new(0),
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    fn poisoned(word: &'static str) -> Self {
        Self {
            poison: Some(word),
            ..Self::new()
        }
    }
}

#[async_trait]
impl Processor for WordCount {
    type Task = String;
    type Output = (String, usize);

    fn name(&self) -> &str {
        "word-count"
    }

    async fn process(&self, task: String) -> Result<(String, usize), ProcessingError> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(word) = self.poison {
            if task.split_whitespace().any(|w| w == word) {
                return Err(ProcessingError::new(format!("poisoned document: {task}")));
            }
        }
        let words = task.split_whitespace().count();
        Ok((task, words))
    }
}

/// Second pipeline stage: keeps only long documents
struct LongOnly;

#[async_trait]
impl Processor for LongOnly {
    type Task = (String, usize);
    type Output = String;

    fn name(&self) -> &str {
        "long-only"
    }

    async fn process(&self, task: (String, usize)) -> Result<String, ProcessingError> {
        let (text, words) = task;
        if words < 3 {
            return Err(ProcessingError::new("too short"));
        }
        Ok(text.to_uppercase())
    }
}

fn budget(max_workers: usize) -> Arc<ResourceManager> {
    Arc::new(ResourceManager::new(ResourceConfig::new().with_max_workers(max_workers)).unwrap())
}

async fn drain_output<T>(queue: &WorkQueue<T>, n: usize) -> Vec<T> {
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        let item = tokio::time::timeout(Duration::from_secs(10), queue.get())
            .await
            .expect("timed out waiting for output");
        if let QueueItem::Task(value) = item {
            out.push(value);
        }
        queue.mark_done().unwrap();
    }
    out
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn two_workers_process_every_task_then_exit() {
    let pool = WorkerPool::new(PoolConfig::new("words"), WordCount::new(), budget(4));
    pool.start(2).await.unwrap();

    for doc in ["alpha", "beta gamma", "delta epsilon zeta"] {
        pool.input().put(doc.to_string()).await;
    }
    pool.input().put_end_of_stream().await;
    pool.input().put_end_of_stream().await;

    let results: HashSet<(String, usize)> = drain_output(pool.output(), 3)
        .await
        .into_iter()
        .collect();
    let expected: HashSet<(String, usize)> = [
        ("alpha".to_string(), 1),
        ("beta gamma".to_string(), 2),
        ("delta epsilon zeta".to_string(), 3),
    ]
    .into_iter()
    .collect();
    assert_eq!(results, expected);

    pool.input().join().await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while pool.active_workers() > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("workers should exit after their markers");

    assert_eq!(pool.stop().await, Ok(()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn n_tasks_with_k_markers_produce_n_results() {
    for (tasks, workers) in [(0, 1), (1, 3), (50, 4), (200, 2)] {
        let pool = WorkerPool::new(PoolConfig::new("property"), WordCount::new(), budget(8));
        pool.start(workers).await.unwrap();

        for i in 0..tasks {
            pool.input().put(format!("doc {i}")).await;
        }
        for _ in 0..workers {
            pool.input().put_end_of_stream().await;
        }

        let results = drain_output(pool.output(), tasks).await;
        assert_eq!(results.len(), tasks);
        pool.input().join().await;
        assert_eq!(pool.stats().processed, tasks as u64);
        pool.stop().await.unwrap();
    }
}

#[tokio::test]
async fn scale_to_tracks_target_and_rejects_over_budget() {
    let pool = WorkerPool::new(PoolConfig::new("elastic"), WordCount::new(), budget(6));
    pool.start(0).await.unwrap();

    for target in 0..=6 {
        pool.scale_to(target).await.unwrap();
        assert_eq!(pool.active_workers(), target);
    }
    for target in (0..6).rev() {
        pool.scale_to(target).await.unwrap();
        assert_eq!(pool.active_workers(), target);
    }

    pool.scale_to(3).await.unwrap();
    let err = pool.scale_to(7).await.unwrap_err();
    assert_eq!(
        err,
        PoolError::BudgetExceeded(BudgetExceededError {
            requested: 7,
            max_allowed: 6
        })
    );
    assert_eq!(pool.active_workers(), 3);
}

#[tokio::test]
async fn stop_twice_does_not_double_decrement() {
    let pool = WorkerPool::new(PoolConfig::new("twice"), WordCount::new(), budget(4));
    pool.start(4).await.unwrap();

    assert_eq!(pool.stop().await, Ok(()));
    assert_eq!(pool.active_workers(), 0);
    assert_eq!(pool.stop().await, Ok(()));
    assert_eq!(pool.active_workers(), 0);
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_workers_past_the_grace_deadline() {
    let pool = WorkerPool::new(
        PoolConfig::new("stuck").with_stop_grace(Duration::from_millis(100)),
        WordCount::slow(Duration::from_secs(3600)),
        budget(2),
    );
    pool.start(2).await.unwrap();
    pool.input().put("never finishes".to_string()).await;
    pool.input().put("me neither".to_string()).await;

    while pool.processor().seen.load(Ordering::SeqCst) < 2 {
        tokio::task::yield_now().await;
    }

    assert_eq!(pool.stop().await, Ok(()));
    assert_eq!(pool.active_workers(), 0);
    assert_eq!(pool.status(), PoolStatus::Stopped);
}

#[tokio::test]
async fn failed_task_does_not_block_later_tasks() {
    let pool = WorkerPool::new(
        PoolConfig::new("poison"),
        WordCount::poisoned("bad"),
        budget(2),
    );
    pool.start(1).await.unwrap();

    for doc in ["one", "bad apple", "three", "four"] {
        pool.input().put(doc.to_string()).await;
    }

    let texts: Vec<String> = drain_output(pool.output(), 3)
        .await
        .into_iter()
        .map(|(text, _)| text)
        .collect();
    assert_eq!(texts, vec!["one", "three", "four"]);

    pool.input().join().await;
    let stats = pool.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.active_workers, 1);
    pool.stop().await.unwrap();
}

#[tokio::test]
async fn autoscaler_applies_or_rejects_whole_plan() {
    let resources = budget(10);
    let a = Arc::new(WorkerPool::new(
        PoolConfig::new("a").with_desired_workers(4),
        WordCount::new(),
        resources.clone(),
    ));
    let b = Arc::new(WorkerPool::new(
        PoolConfig::new("b").with_desired_workers(4),
        WordCount::new(),
        resources.clone(),
    ));
    a.start(0).await.unwrap();
    b.start(0).await.unwrap();

    let scaler = AutoScaler::new(
        vec![a.clone() as Arc<dyn ManagedPool>, b.clone()],
        resources.clone(),
        AutoScalerConfig::new().without_timer(),
    );

    scaler.reconcile().await.unwrap();
    assert_eq!((a.active_workers(), b.active_workers()), (4, 4));

    a.request_workers(6).unwrap();
    b.request_workers(6).unwrap();
    assert_eq!(
        scaler.reconcile().await,
        Err(ScalerError::BudgetExceeded(BudgetExceededError {
            requested: 12,
            max_allowed: 10
        }))
    );
    assert_eq!((a.active_workers(), b.active_workers()), (4, 4));
    assert_eq!(scaler.state(), ScalerState::Failed);

    assert!(scaler.stop().await.is_empty());
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn chained_pools_drain_in_order() {
    let resources = budget(8);
    let count = Arc::new(WorkerPool::new(
        PoolConfig::new("count").with_desired_workers(3),
        WordCount::new(),
        resources.clone(),
    ));
    let filter = Arc::new(
        WorkerPool::new(
            PoolConfig::new("filter").with_desired_workers(2),
            LongOnly,
            resources.clone(),
        )
        .with_input(count.output().clone()),
    );

    let orchestrator = Arc::new(Orchestrator::new(
        resources,
        AutoScalerConfig::new().without_timer(),
        vec![count.clone() as Arc<dyn ManagedPool>, filter.clone()],
    ));
    let running = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.start().await }
    });

    for i in 0..20 {
        let doc = if i % 2 == 0 {
            format!("short {i}")
        } else {
            format!("a longer document {i}")
        };
        count.input().put(doc).await;
    }

    let report = orchestrator.drain().await;
    assert!(report.is_clean());
    running.await.unwrap().unwrap();

    let mut kept = Vec::new();
    while let Some(item) = filter.output().try_get() {
        if let QueueItem::Task(text) = item {
            kept.push(text);
        }
    }
    assert_eq!(kept.len(), 10);
    assert!(kept.iter().all(|t| t.starts_with("A LONGER DOCUMENT")));

    let stats = orchestrator.stats();
    assert_eq!(stats[0].processed, 20);
    assert_eq!(stats[1].processed, 10);
    assert_eq!(stats[1].failed, 10);
    assert!(stats.iter().all(|s| s.status == PoolStatus::Stopped));
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn signal_shutdown_of_chained_pools_keeps_in_flight_results() {
    let resources = budget(8);
    let count = Arc::new(WorkerPool::new(
        PoolConfig::new("count").with_desired_workers(2),
        WordCount::slow(Duration::from_millis(200)),
        resources.clone(),
    ));
    let filter = Arc::new(
        WorkerPool::new(
            PoolConfig::new("filter").with_desired_workers(1),
            LongOnly,
            resources.clone(),
        )
        .with_input(count.output().clone()),
    );

    let orchestrator = Arc::new(Orchestrator::new(
        resources,
        AutoScalerConfig::new().without_timer(),
        vec![count.clone() as Arc<dyn ManagedPool>, filter.clone()],
    ));
    let coordinator = Arc::new(ShutdownCoordinator::new(orchestrator.clone()));
    let running = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.start().await }
    });

    for i in 0..4 {
        count.input().put(format!("a longer document {i}")).await;
    }
    tokio::time::timeout(Duration::from_secs(5), async {
        while count.processor().seen.load(Ordering::SeqCst) < 2 || filter.active_workers() < 1 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("both stages should be running");

    let report = coordinator
        .handle(ShutdownSignal::Terminate)
        .await
        .expect("first signal starts the shutdown");
    assert!(report.is_clean());
    running.await.unwrap().unwrap();

    let stats = orchestrator.stats();
    assert_eq!(stats[0].processed, 4);
    assert_eq!(stats[1].processed, 4);
    assert_eq!(filter.input().pending(), 0);

    let mut kept = 0;
    while let Some(item) = filter.output().try_get() {
        if let QueueItem::Task(_) = item {
            kept += 1;
        }
    }
    assert_eq!(kept, 4);
}

#[tokio::test]
async fn concurrent_shutdown_sources_share_one_report() {
    let resources = budget(4);
    let pool = Arc::new(WorkerPool::new(
        PoolConfig::new("racy").with_desired_workers(2),
        WordCount::new(),
        resources.clone(),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        resources,
        AutoScalerConfig::new().without_timer(),
        vec![pool.clone() as Arc<dyn ManagedPool>],
    ));
    let coordinator = Arc::new(ShutdownCoordinator::new(orchestrator.clone()));

    let running = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.start().await }
    });
    tokio::time::timeout(Duration::from_secs(5), async {
        while pool.active_workers() < 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();

    let (from_signal, internal) = tokio::join!(
        coordinator.handle(ShutdownSignal::Interrupt),
        orchestrator.graceful_shutdown()
    );
    assert_eq!(from_signal, Some(internal));
    assert!(coordinator.handle(ShutdownSignal::Terminate).await.is_none());

    running.await.unwrap().unwrap();
    assert_eq!(pool.status(), PoolStatus::Stopped);
}
