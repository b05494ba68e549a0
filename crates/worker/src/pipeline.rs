//! Line-oriented pipeline wiring
//!
//! Builds one [`WorkerPool`] per configured pool, feeds them lines from a
//! reader (round-robin) and writes every result as one JSON line.

use std::io;
use std::sync::Arc;

use futures::future::try_join_all;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

use kgflow_runtime::{
    ConfigError, ManagedPool, Orchestrator, QueueItem, ResourceManager, RuntimeConfig, WorkerPool,
};

use crate::processor::{Line, TextStats, TextStatsProcessor};

/// Output record: a result tagged with the pool that produced it
#[derive(Debug, Serialize)]
struct Record<'a> {
    pool: &'a str,
    #[serde(flatten)]
    stats: &'a TextStats,
}

/// Text statistics pools under one orchestrator
#[derive(Debug, Clone)]
pub struct Pipeline {
    orchestrator: Arc<Orchestrator>,
    pools: Vec<Arc<WorkerPool<TextStatsProcessor>>>,
}

impl Pipeline {
    /// Build every pool of `config`
    pub fn build(
        config: &RuntimeConfig,
        processor: TextStatsProcessor,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if config.pools.is_empty() {
            return Err(ConfigError::Invalid("at least one pool is required".into()));
        }

        let resources = Arc::new(ResourceManager::new(config.resources.clone())?);
        let pools: Vec<Arc<WorkerPool<TextStatsProcessor>>> = config
            .pools
            .iter()
            .map(|pool| {
                Arc::new(WorkerPool::new(
                    pool.clone(),
                    processor.clone(),
                    resources.clone(),
                ))
            })
            .collect();

        let managed = pools
            .iter()
            .map(|pool| pool.clone() as Arc<dyn ManagedPool>)
            .collect();
        let orchestrator = Arc::new(Orchestrator::new(resources, config.scaler.clone(), managed));

        Ok(Self {
            orchestrator,
            pools,
        })
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn pools(&self) -> &[Arc<WorkerPool<TextStatsProcessor>>] {
        &self.pools
    }

    /// Enqueue every non-blank line, spreading lines across pools
    ///
    /// Returns the number of lines enqueued.
    pub async fn feed<R>(&self, reader: R) -> io::Result<u64>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        let mut number = 0u64;
        let mut enqueued = 0u64;

        while let Some(text) = lines.next_line().await? {
            number += 1;
            if text.trim().is_empty() {
                continue;
            }
            let pool = &self.pools[(enqueued % self.pools.len() as u64) as usize];
            pool.input().put(Line { number, text }).await;
            enqueued += 1;
        }

        info!(lines = number, enqueued, "End of input");
        Ok(enqueued)
    }

    /// Write results as JSON lines until every pool has stopped
    ///
    /// Returns the number of records written.
    pub async fn emit<W>(&self, writer: W) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let writer = Mutex::new(writer);
        let written =
            try_join_all(self.pools.iter().map(|pool| emit_pool(pool, &writer))).await?;

        writer.lock().await.flush().await?;
        Ok(written.into_iter().sum())
    }
}

async fn emit_pool<W>(pool: &WorkerPool<TextStatsProcessor>, writer: &Mutex<W>) -> io::Result<u64>
where
    W: AsyncWrite + Unpin + Send,
{
    let output = pool.output();
    let mut written = 0;

    loop {
        let item = tokio::select! {
            biased;
            item = output.get() => item,
            _ = pool.wait_stopped() => break,
        };
        written += write_item(pool.id(), item, writer).await?;
        mark_done(pool);
    }

    // Results produced right before the pool stopped
    while let Some(item) = output.try_get() {
        written += write_item(pool.id(), item, writer).await?;
        mark_done(pool);
    }

    debug!(pool = %pool.id(), written, "Output consumer finished");
    Ok(written)
}

async fn write_item<W>(
    pool: &str,
    item: QueueItem<TextStats>,
    writer: &Mutex<W>,
) -> io::Result<u64>
where
    W: AsyncWrite + Unpin + Send,
{
    let QueueItem::Task(stats) = item else {
        return Ok(0);
    };

    let mut line = serde_json::to_vec(&Record {
        pool,
        stats: &stats,
    })?;
    line.push(b'\n');
    writer.lock().await.write_all(&line).await?;
    Ok(1)
}

fn mark_done(pool: &WorkerPool<TextStatsProcessor>) {
    if let Err(err) = pool.output().mark_done() {
        debug!(pool = %pool.id(), error = %err, "Output already marked done");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgflow_runtime::{AutoScalerConfig, PoolConfig, PoolStatus};

    fn config(pools: &[(&str, usize)]) -> RuntimeConfig {
        let mut config = RuntimeConfig {
            scaler: AutoScalerConfig::new().without_timer(),
            ..Default::default()
        };
        for (name, workers) in pools {
            config = config.with_pool(PoolConfig::new(*name).with_desired_workers(*workers));
        }
        config
    }

    #[test]
    fn test_build_requires_pools() {
        let err = Pipeline::build(&config(&[]), TextStatsProcessor::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_feed_start_drain_emit() {
        let pipeline = Pipeline::build(
            &config(&[("a", 2), ("b", 1)]),
            TextStatsProcessor::default(),
        )
        .unwrap();
        let orchestrator = pipeline.orchestrator().clone();

        let running = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.start().await }
        });
        let emitting = tokio::spawn({
            let pipeline = pipeline.clone();
            async move {
                let mut out = Vec::new();
                let written = pipeline.emit(&mut out).await?;
                Ok::<_, io::Error>((written, out))
            }
        });

        let input = "first line.\n\nsecond line!\nthird\n";
        let enqueued = pipeline.feed(input.as_bytes()).await.unwrap();
        assert_eq!(enqueued, 3);

        assert!(orchestrator.drain().await.is_clean());
        running.await.unwrap().unwrap();

        let (written, out) = emitting.await.unwrap().unwrap();
        assert_eq!(written, 3);

        let records: Vec<serde_json::Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        let mut lines: Vec<u64> = records
            .iter()
            .map(|r| r["line"].as_u64().unwrap())
            .collect();
        lines.sort_unstable();
        assert_eq!(lines, vec![1, 3, 4]);
        assert!(records.iter().all(|r| r["pool"] == "a" || r["pool"] == "b"));

        assert!(pipeline
            .pools()
            .iter()
            .all(|p| p.status() == PoolStatus::Stopped));
    }
}
