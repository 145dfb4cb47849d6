//! Issue pipeline service entrypoint.
//! Builds the pipeline from the environment, starts the job workers and the
//! optional ingest scheduler, and serves the trigger API.

use std::sync::Arc;

use anyhow::Context;
use shuttle_axum::ShuttleAxum;
use tokio_util::sync::CancellationToken;

use issue_pipeline::api::{self, AppState};
use issue_pipeline::config::PipelineConfig;
use issue_pipeline::ingest::scheduler::spawn_ingest_scheduler;
use issue_pipeline::metrics::Metrics;
use issue_pipeline::telemetry::init_tracing;
use issue_pipeline::Pipeline;

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Loads .env in local/dev; no-op when the file is absent.
    let cfg = PipelineConfig::from_env().context("loading configuration")?;
    init_tracing();

    let metrics = if cfg.metrics_enabled {
        Some(Metrics::init().context("installing metrics recorder")?.handle)
    } else {
        None
    };

    let pipeline = Arc::new(Pipeline::from_config(&cfg).context("building pipeline")?);
    let executor = Arc::new(pipeline.executor(cfg.executor.clone()));
    let workers = executor.spawn_workers();
    tracing::info!(target: "jobs", workers = workers.len(), "executor started");

    if let Some(every) = cfg.ingest_interval {
        spawn_ingest_scheduler(executor.clone(), every, CancellationToken::new());
        tracing::info!(target: "ingest", interval_secs = every.as_secs(), "ingest scheduler started");
    }

    let router = api::router(AppState { executor }, metrics);
    Ok(router.into())
}
