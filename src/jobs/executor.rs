// src/jobs/executor.rs
//! Worker pool over the tiered [`JobQueue`].
//!
//! ```text
//! enqueue ─► JobRecord(queued) ─► persist ─► queue[tier]
//! worker  ─► pop highest tier ─► running ─► persist
//!         ─► timeout(handler.run) ─► succeeded | failed | timed_out | cancelled ─► persist
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::{counter, gauge, histogram};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    JobContext, JobParams, JobQueue, JobRecord, JobSink, JobStatus, Stage, StageHandler,
};
use crate::error::{ErrorKind, PipelineError, Result};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub workers: usize,
    /// Enqueue is refused (503 at the surface) beyond this many queued jobs.
    pub max_queued: usize,
    /// Finished jobs kept in memory; older ones are only in the sink.
    pub retain_finished: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_queued: 256,
            retain_finished: 512,
        }
    }
}

struct JobEntry {
    record: JobRecord,
    cancel: CancellationToken,
}

pub struct Executor {
    config: ExecutorConfig,
    queue: JobQueue,
    jobs: RwLock<HashMap<String, JobEntry>>,
    handlers: HashMap<Stage, Arc<dyn StageHandler>>,
    sink: Option<Arc<dyn JobSink>>,
    shutdown: CancellationToken,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            queue: JobQueue::new(),
            jobs: RwLock::new(HashMap::new()),
            handlers: HashMap::new(),
            sink: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn register(mut self, stage: Stage, handler: Arc<dyn StageHandler>) -> Self {
        self.handlers.insert(stage, handler);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn JobSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn handles(&self, stage: Stage) -> bool {
        self.handlers.contains_key(&stage)
    }

    /// Create, persist and queue a job.
    pub async fn enqueue(&self, stage: Stage, params: JobParams) -> Result<JobRecord> {
        if !self.handles(stage) {
            return Err(PipelineError::NotFound(format!("no handler for stage '{stage}'")));
        }
        if self.shutdown.is_cancelled() {
            return Err(PipelineError::Transient("executor is shutting down".into()));
        }
        if self.queue.len() >= self.config.max_queued {
            return Err(PipelineError::Transient(format!(
                "queue full ({} jobs)",
                self.config.max_queued
            )));
        }

        let record = JobRecord::new(stage, params, Utc::now());
        self.persist(&record).await;
        {
            let mut jobs = self.jobs.write().await;
            jobs.insert(
                record.job_id.clone(),
                JobEntry {
                    record: record.clone(),
                    cancel: self.shutdown.child_token(),
                },
            );
        }
        self.queue.push(record.queue_tier, record.job_id.clone());

        counter!("jobs_enqueued_total", "stage" => stage.as_str()).increment(1);
        gauge!("jobs_queued").set(self.queue.len() as f64);
        info!(
            target: "jobs",
            job_id = %record.job_id,
            stage = %stage,
            tier = record.queue_tier.as_str(),
            "job enqueued"
        );
        Ok(record)
    }

    /// In-memory record, else the sink's copy of a job already pruned.
    pub async fn get(&self, job_id: &str) -> Option<JobRecord> {
        if let Some(rec) = self.jobs.read().await.get(job_id).map(|e| e.record.clone()) {
            return Some(rec);
        }
        let sink = self.sink.as_ref()?;
        match sink.load_job(job_id).await {
            Ok(rec) => rec,
            Err(e) => {
                warn!(target: "jobs", job_id, error = %e, "job lookup in sink failed");
                None
            }
        }
    }

    /// Jobs still held in memory (active plus recently finished), oldest first.
    pub async fn list(&self) -> Vec<JobRecord> {
        let mut out: Vec<JobRecord> = self.jobs.read().await.values().map(|e| e.record.clone()).collect();
        out.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then_with(|| a.job_id.cmp(&b.job_id)));
        out
    }

    /// Queued jobs are cancelled on the spot; running ones at their next
    /// stage boundary. Returns the status right after the request.
    pub async fn cancel(&self, job_id: &str) -> Result<JobStatus> {
        let snapshot = {
            let mut jobs = self.jobs.write().await;
            let entry = jobs
                .get_mut(job_id)
                .ok_or_else(|| PipelineError::NotFound(format!("job {job_id}")))?;
            match entry.record.status {
                JobStatus::Queued if self.queue.remove(job_id) => {
                    entry.cancel.cancel();
                    entry.record.status = JobStatus::Cancelled;
                    entry.record.finished_at = Some(Utc::now());
                    Some(entry.record.clone())
                }
                JobStatus::Queued | JobStatus::Running => {
                    entry.cancel.cancel();
                    None
                }
                status => return Ok(status),
            }
        };
        info!(target: "jobs", job_id, "cancellation requested");
        match snapshot {
            Some(rec) => {
                counter!("jobs_finished_total", "stage" => rec.stage.as_str(), "status" => "cancelled")
                    .increment(1);
                self.persist(&rec).await;
                self.prune().await;
                Ok(JobStatus::Cancelled)
            }
            None => Ok(JobStatus::Running),
        }
    }

    /// Spawn `config.workers` worker tasks.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.config.workers.max(1))
            .map(|n| {
                let exec = Arc::clone(self);
                tokio::spawn(async move { exec.worker_loop(n).await })
            })
            .collect()
    }

    /// Stop handing out jobs and cancel everything in flight.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Poll until the job reaches a final status or `within` elapses.
    pub async fn wait_for(&self, job_id: &str, within: Duration) -> Option<JobRecord> {
        let deadline = Instant::now() + within;
        loop {
            let rec = self.get(job_id).await?;
            if rec.status.is_finished() || Instant::now() >= deadline {
                return Some(rec);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn worker_loop(&self, worker: usize) {
        debug!(target: "jobs", worker, "worker started");
        while let Some(job_id) = self.queue.next(&self.shutdown).await {
            gauge!("jobs_queued").set(self.queue.len() as f64);
            self.process(&job_id).await;
        }
        debug!(target: "jobs", worker, "worker stopped");
    }

    /// Run one job to completion on the calling task.
    pub async fn process(&self, job_id: &str) {
        let started = Utc::now();
        let claimed = {
            let mut jobs = self.jobs.write().await;
            match jobs.get_mut(job_id) {
                Some(entry) if entry.record.status == JobStatus::Queued => {
                    let timeout = entry.record.timeout();
                    entry.record.status = JobStatus::Running;
                    entry.record.started_at = Some(started);
                    entry.record.timeout_at = chrono::Duration::from_std(timeout)
                        .ok()
                        .map(|d| started + d);
                    Some((entry.record.clone(), entry.cancel.clone()))
                }
                _ => None,
            }
        };
        let Some((record, cancel)) = claimed else {
            return;
        };
        self.persist(&record).await;

        let Some(handler) = self.handlers.get(&record.stage).cloned() else {
            self.finish(job_id, JobStatus::Failed, None, vec!["no handler".into()])
                .await;
            return;
        };

        let timeout = record.timeout();
        let ctx = JobContext::new(job_id, cancel.clone());
        let t0 = Instant::now();
        info!(target: "jobs", job_id, stage = %record.stage, ?timeout, "job started");

        let outcome = tokio::time::timeout(timeout, handler.run(&record, &ctx)).await;
        histogram!("job_duration_ms", "stage" => record.stage.as_str())
            .record(t0.elapsed().as_secs_f64() * 1000.0);

        let mut errors = ctx.take_errors();
        let (status, summary) = match outcome {
            Err(_) => {
                // The stage future is dropped here; writes it already made stand.
                cancel.cancel();
                errors.push(format!("timed out after {timeout:?}"));
                (JobStatus::TimedOut, None)
            }
            Ok(Ok(summary)) => (JobStatus::Succeeded, Some(summary)),
            Ok(Err(e)) if e.kind() == ErrorKind::Cancelled => (JobStatus::Cancelled, None),
            Ok(Err(e)) => {
                errors.push(e.to_string());
                (JobStatus::Failed, None)
            }
        };
        self.finish(job_id, status, summary, errors).await;
    }

    async fn finish(
        &self,
        job_id: &str,
        status: JobStatus,
        summary: Option<super::JobSummary>,
        errors: Vec<String>,
    ) {
        let rec = {
            let mut jobs = self.jobs.write().await;
            let Some(entry) = jobs.get_mut(job_id) else {
                return;
            };
            entry.record.status = status;
            entry.record.finished_at = Some(Utc::now());
            entry.record.errors.extend(errors);
            if let Some(s) = summary {
                entry.record.summary = s;
            }
            entry.record.clone()
        };

        counter!("jobs_finished_total", "stage" => rec.stage.as_str(), "status" => status.as_str())
            .increment(1);
        match status {
            JobStatus::Succeeded => {
                info!(target: "jobs", job_id, stage = %rec.stage, summary = ?rec.summary, "job succeeded")
            }
            JobStatus::Cancelled => info!(target: "jobs", job_id, stage = %rec.stage, "job cancelled"),
            _ => warn!(
                target: "jobs",
                job_id,
                stage = %rec.stage,
                status = status.as_str(),
                errors = ?rec.errors,
                "job did not succeed"
            ),
        }
        self.persist(&rec).await;
        self.prune().await;
    }

    /// Drop the oldest finished jobs beyond `retain_finished`. Queued and
    /// running jobs are never dropped.
    async fn prune(&self) {
        let mut jobs = self.jobs.write().await;
        let mut finished: Vec<(chrono::DateTime<Utc>, String)> = jobs
            .iter()
            .filter(|(_, e)| e.record.status.is_finished())
            .map(|(id, e)| (e.record.finished_at.unwrap_or(e.record.enqueued_at), id.clone()))
            .collect();
        let excess = finished.len().saturating_sub(self.config.retain_finished);
        if excess == 0 {
            return;
        }
        finished.sort();
        for (_, id) in finished.into_iter().take(excess) {
            jobs.remove(&id);
        }
        gauge!("jobs_in_memory").set(jobs.len() as f64);
        debug!(target: "jobs", dropped = excess, "pruned finished jobs");
    }

    async fn persist(&self, rec: &JobRecord) {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.save_job(rec).await {
                error!(target: "jobs", job_id = %rec.job_id, error = %e, "failed to persist job record");
            }
        }
    }
}
