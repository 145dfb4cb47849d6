// src/metrics.rs
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

use crate::error::{PipelineError, Result};

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the process-wide Prometheus recorder. Fails if one is already
    /// installed, so call it once from the binary.
    pub fn init() -> Result<Self> {
        // Use default buckets to avoid API differences across crate versions.
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| PipelineError::Config(format!("prometheus: install recorder: {e}")))?;
        describe_pipeline_metrics();
        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        metrics_router(self.handle.clone())
    }
}

pub fn metrics_router<S: Clone + Send + Sync + 'static>(handle: PrometheusHandle) -> Router<S> {
    Router::new().route(
        "/metrics",
        get(move || {
            let h = handle.clone();
            async move { h.render() }
        }),
    )
}

/// Series shared across stages. Stage-local series are described next to
/// their stage (see `ingest`).
pub fn describe_pipeline_metrics() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("jobs_enqueued_total", "Jobs accepted by the executor, by stage.");
        describe_counter!(
            "jobs_finished_total",
            "Jobs that reached a final status, by stage and status."
        );
        describe_gauge!("jobs_queued", "Jobs waiting in any tier.");
        describe_gauge!("jobs_in_memory", "Job records held by the executor after pruning.");
        describe_histogram!("job_duration_ms", "Wall time of a job run in milliseconds.");
        describe_counter!(
            "external_call_retries_total",
            "Transient external-call failures that were retried."
        );
        describe_counter!(
            "classify_judgments_total",
            "Eligibility verdicts written, by outcome."
        );
        describe_counter!("select_slots_total", "Slot outcomes, by outcome.");
        describe_counter!("enrich_stage_total", "Enrichment stage outcomes, by stage and outcome.");
        describe_counter!("delivery_recipients_total", "Delivery tallies, by outcome.");
        describe_counter!("issue_transitions_total", "Issue status changes, by target status.");
    });
}
