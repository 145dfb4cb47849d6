// src/api.rs
//! Job trigger surface.
//!
//! - `POST /stages/{stage}`     enqueue a stage job, `202 {job_id}`
//! - `GET  /jobs/{id}`          the job record
//! - `POST /jobs/{id}/cancel`   request cancellation, `202`
//! - `GET  /health`
//! - `GET  /metrics`            when a Prometheus handle is supplied

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::error::PipelineError;
use crate::jobs::{Executor, JobParams, JobRecord, JobStatus, Stage};
use crate::metrics::metrics_router;

#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<Executor>,
}

pub fn router(state: AppState, metrics: Option<PrometheusHandle>) -> Router {
    let mut app = Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/stages/{stage}", post(trigger_stage))
        .route("/jobs", get(list_jobs))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .with_state(state);
    if let Some(handle) = metrics {
        app = app.merge(metrics_router(handle));
    }
    app.layer(CorsLayer::very_permissive())
}

/// Maps pipeline errors onto HTTP statuses.
pub struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::InvalidInput(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineError::Malformed(_) => StatusCode::BAD_REQUEST,
            PipelineError::Transient(_) | PipelineError::Timeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::InvalidTransition { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::warn!(target: "api", error = %self.0, %status, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Serialize)]
struct Accepted {
    job_id: String,
    stage: Stage,
    status: JobStatus,
}

/// An empty body means default parameters. Unparseable JSON is a 400, a
/// well-formed body with unknown or mistyped fields a 422.
fn parse_params(body: &[u8]) -> Result<JobParams, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(JobParams::default());
    }
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| PipelineError::Malformed(format!("request body: {e}")))?;
    serde_json::from_value(value)
        .map_err(|e| ApiError(PipelineError::InvalidInput(format!("job params: {e}"))))
}

async fn trigger_stage(
    State(state): State<AppState>,
    Path(stage): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    let stage = Stage::from_str(&stage)?;
    let params = parse_params(&body)?;
    let record = state.executor.enqueue(stage, params).await.map_err(|e| match e {
        // The stage exists but this process cannot take the job.
        PipelineError::NotFound(msg) => PipelineError::Transient(msg),
        other => other,
    })?;
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            job_id: record.job_id,
            stage: record.stage,
            status: record.status,
        }),
    ))
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobRecord>> {
    Json(state.executor.list().await)
}

async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<JobRecord>, ApiError> {
    state
        .executor
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError(PipelineError::NotFound(format!("job {id}"))))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let status = state.executor.cancel(&id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "job_id": id, "status": status })),
    ))
}
