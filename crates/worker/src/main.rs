use std::sync::Arc;

use anyhow::{Context, Result};
use kgflow_runtime::{RuntimeConfig, ShutdownCoordinator};
use kgflow_worker::{init_telemetry, Pipeline, TelemetryConfig, TextStatsProcessor};
use tokio::io::BufReader;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present; real environment variables take precedence
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "info")
    // - KGFLOW_LOG_FORMAT: "json" for structured logs
    // Logs go to stderr, results to stdout
    let telemetry_config = TelemetryConfig::from_env();
    init_telemetry(&telemetry_config);

    tracing::info!("kgflow-worker starting...");

    let config = RuntimeConfig::from_env().context("Invalid runtime configuration")?;
    let processor = TextStatsProcessor::from_env().context("Invalid processor configuration")?;
    let pipeline = Pipeline::build(&config, processor).context("Failed to build pipeline")?;
    let orchestrator = pipeline.orchestrator().clone();

    tracing::info!(
        run_id = %orchestrator.run_id(),
        pools = config.pools.len(),
        max_workers = config.resources.max_workers,
        "Starting pipeline"
    );

    // SIGINT / SIGTERM: shut down once and exit with status 0
    let coordinator = Arc::new(ShutdownCoordinator::new(orchestrator.clone()));
    tokio::spawn(async move {
        if let Err(e) = coordinator.listen_and_exit().await {
            tracing::error!(error = %e, "Failed to install signal handlers");
        }
    });

    let consumer = tokio::spawn({
        let pipeline = pipeline.clone();
        async move { pipeline.emit(tokio::io::stdout()).await }
    });

    // End of input drains the pipeline; a read error shuts it down
    let producer = tokio::spawn({
        let pipeline = pipeline.clone();
        async move {
            let result = pipeline.feed(BufReader::new(tokio::io::stdin())).await;
            match &result {
                Ok(_) => {
                    pipeline.orchestrator().drain().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read input");
                    pipeline.orchestrator().graceful_shutdown().await;
                }
            }
            result
        }
    });

    if let Err(e) = orchestrator.start().await {
        tracing::error!(error = %e, "Pipeline failed");
        return Err(e).context("Pipeline failed");
    }

    let lines = producer
        .await
        .context("Producer task panicked")?
        .context("Failed to read input")?;
    let written = consumer
        .await
        .context("Consumer task panicked")?
        .context("Failed to write results")?;

    tracing::info!(lines, written, stats = ?orchestrator.stats(), "Pipeline drained");
    Ok(())
}
