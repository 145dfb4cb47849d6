// src/ingest/scheduler.rs
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::jobs::{Executor, JobParams, Stage};

/// Periodically enqueue an ingest job followed by a classify job.
///
/// The executor does the work; this only keeps the cadence. A full queue is
/// logged and the tick skipped.
pub fn spawn_ingest_scheduler(
    executor: Arc<Executor>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            for stage in [Stage::Ingest, Stage::Classify] {
                match executor.enqueue(stage, JobParams::default()).await {
                    Ok(job) => {
                        tracing::debug!(target: "ingest", job_id = %job.job_id, %stage, "scheduled")
                    }
                    Err(e) => {
                        counter!("ingest_schedule_skipped_total").increment(1);
                        tracing::warn!(target: "ingest", %stage, error = %e, "scheduled enqueue failed");
                    }
                }
            }
            gauge!("ingest_last_scheduled_ts").set(chrono::Utc::now().timestamp() as f64);
        }
        tracing::info!(target: "ingest", "ingest scheduler stopped");
    })
}
